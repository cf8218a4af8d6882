//! Background sweeper - materialises lease expiry as delete-and-emit.
//!
//! Each pass claims expired rows with `DELETE ... RETURNING`, which both
//! removes the row and hands back the entity in one statement, so exactly
//! one `Expire` is observed per lapsed lease even with several store
//! instances sharing the database. Events are emitted before the
//! connection lock is released, keeping them ordered against concurrent
//! mutations of the same identity.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::params;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use routemux_core::{EventHub, EventType, RoutingEvent, RoutingResult};

use crate::database::Database;

use super::{route_from_row, tcp_from_row, RoutingError};

/// Lower bound on the sleep so a cluster of short leases cannot spin the
/// sweeper.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(20);

pub(super) fn spawn(
    db: Arc<Mutex<Database>>,
    http_hub: EventHub<RoutingEvent>,
    tcp_hub: EventHub<RoutingEvent>,
    max_interval: Duration,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let interval = next_interval(&db, max_interval).await;
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match sweep_once(&db, &http_hub, &tcp_hub).await {
                Ok(0) => {}
                Ok(expired) => debug!("[Sweeper] expired {expired} routes"),
                Err(err) => warn!("[Sweeper] sweep failed, retrying next tick: {err}"),
            }
        }
        debug!("[Sweeper] stopped");
    });
}

/// Sleep until the earliest remaining lease is half-way to lapsing, but
/// never longer than `max_interval`.
async fn next_interval(db: &Mutex<Database>, max_interval: Duration) -> Duration {
    let earliest: Option<i64> = {
        let db = db.lock().await;
        db.connection()
            .query_row(
                "SELECT MIN(expires_at) FROM ( \
                     SELECT MIN(expires_at) AS expires_at FROM http_routes \
                     UNION ALL \
                     SELECT MIN(expires_at) FROM tcp_route_mappings \
                 )",
                [],
                |row| row.get(0),
            )
            .unwrap_or(None)
    };

    match earliest {
        None => max_interval,
        Some(expires_at) => {
            let remaining = (expires_at - Utc::now().timestamp_millis()).max(0) as u64;
            Duration::from_millis(remaining / 2).clamp(MIN_SWEEP_INTERVAL, max_interval)
        }
    }
}

/// Claim and emit every lapsed lease. Returns the number of rows reaped.
async fn sweep_once(
    db: &Mutex<Database>,
    http_hub: &EventHub<RoutingEvent>,
    tcp_hub: &EventHub<RoutingEvent>,
) -> RoutingResult<usize> {
    let now = Utc::now().timestamp_millis();
    let db = db.lock().await;
    let conn = db.connection();
    let mut reaped = 0;

    let mut stmt = conn
        .prepare(&format!(
            "DELETE FROM http_routes WHERE expires_at <= ?1 RETURNING {}",
            super::HTTP_COLUMNS
        ))
        .map_err(RoutingError::backend)?;
    let routes = stmt
        .query_map(params![now], route_from_row)
        .map_err(RoutingError::backend)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(RoutingError::backend)?;
    for route in routes {
        http_hub.emit(RoutingEvent::http(EventType::Expire, route));
        reaped += 1;
    }

    let mut stmt = conn
        .prepare(&format!(
            "DELETE FROM tcp_route_mappings WHERE expires_at <= ?1 RETURNING {}",
            super::TCP_COLUMNS
        ))
        .map_err(RoutingError::backend)?;
    let mappings = stmt
        .query_map(params![now], tcp_from_row)
        .map_err(RoutingError::backend)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(RoutingError::backend)?;
    for mapping in mappings {
        tcp_hub.emit(RoutingEvent::tcp(EventType::Expire, mapping));
        reaped += 1;
    }

    Ok(reaped)
}

#[cfg(test)]
mod tests {
    use super::super::{SqlRoutingStore, SqlStoreConfig};
    use routemux_core::{EventType, RouterGroup, RoutingEvent, RoutingStore, TcpRouteMapping, WatchFamily};

    #[tokio::test]
    async fn test_short_lease_expires_with_one_event() {
        let store = SqlRoutingStore::open_in_memory(SqlStoreConfig::default()).unwrap();
        let group = RouterGroup::default_tcp();
        store.save_router_group(group.clone()).await.unwrap();

        let mut watch = store.watch_route_changes(WatchFamily::Tcp);

        let mapping = TcpRouteMapping::new(&group.guid, 3000, "1.1.1.1", 1234, 1);
        store.upsert_tcp_route(mapping.clone()).await.unwrap();

        let created = watch.events.recv().await.unwrap();
        assert_eq!(created.event_type(), EventType::Create);

        // the lease is one second; the sweeper fires well inside three
        let expired = tokio::time::timeout(std::time::Duration::from_secs(3), watch.events.recv())
            .await
            .expect("expiry event within the sweep window")
            .unwrap();
        match expired {
            RoutingEvent::Tcp {
                event_type,
                mapping: reaped,
            } => {
                assert_eq!(event_type, EventType::Expire);
                assert!(reaped.matches_identity(&mapping));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(store.read_tcp_routes().await.unwrap().is_empty());

        // no second expiry for the same lease
        let extra =
            tokio::time::timeout(std::time::Duration::from_millis(1500), watch.events.recv()).await;
        assert!(extra.is_err(), "expected no further events, got {extra:?}");
    }
}
