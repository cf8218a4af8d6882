//! Relational back-end over SQLite.
//!
//! Mutations commit under the shared connection lock and emit their event
//! before releasing it, so the per-identity event order always matches
//! commit order. Reads filter `expires_at > now`; rows past their lease
//! stay in place until the sweeper claims them with
//! `DELETE ... RETURNING` and emits the one `Expire` per lease.

mod sweeper;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use routemux_core::{
    EventHub, EventType, ModificationTag, Route, RouteWatch, RouterGroup, RoutingError,
    RoutingEvent, RoutingResult, RoutingStore, TcpRouteMapping, WatchFamily,
    DEFAULT_BUFFER_CAPACITY,
};

use crate::cache::RouterGroupCache;
use crate::database::{Database, StoreInitError};
use crate::group::{self, GroupSave};
use crate::watch;

/// Tuning knobs for the relational back-end.
#[derive(Debug, Clone)]
pub struct SqlStoreConfig {
    /// TTL applied when an upsert omits one, in seconds.
    pub default_ttl_secs: u64,
    /// Per-subscriber event buffer capacity.
    pub hub_capacity: usize,
    /// Longest the sweeper sleeps between passes.
    pub max_sweep_interval: Duration,
}

impl Default for SqlStoreConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 120,
            hub_capacity: DEFAULT_BUFFER_CAPACITY,
            max_sweep_interval: Duration::from_secs(1),
        }
    }
}

/// SQLite-backed implementation of the routing store contract.
pub struct SqlRoutingStore {
    db: Arc<Mutex<Database>>,
    http_hub: EventHub<RoutingEvent>,
    tcp_hub: EventHub<RoutingEvent>,
    group_cache: RouterGroupCache,
    default_ttl_secs: u64,
    sweep_token: CancellationToken,
}

const HTTP_COLUMNS: &str = "route, ip, port, ttl, log_guid, route_service_url, tag_guid, tag_index";
const TCP_COLUMNS: &str =
    "host_ip, host_port, external_port, router_group_guid, ttl, tag_guid, tag_index, expires_at";

impl SqlRoutingStore {
    /// Wrap an already-opened database and start the sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(db: Database, config: SqlStoreConfig) -> Self {
        let db = Arc::new(Mutex::new(db));
        let http_hub = EventHub::with_capacity(config.hub_capacity);
        let tcp_hub = EventHub::with_capacity(config.hub_capacity);
        let sweep_token = CancellationToken::new();

        sweeper::spawn(
            db.clone(),
            http_hub.clone(),
            tcp_hub.clone(),
            config.max_sweep_interval,
            sweep_token.clone(),
        );

        Self {
            db,
            http_hub,
            tcp_hub,
            group_cache: RouterGroupCache::default(),
            default_ttl_secs: config.default_ttl_secs,
            sweep_token,
        }
    }

    /// Open (and migrate) a database file.
    pub fn open(path: &Path, config: SqlStoreConfig) -> Result<Self, StoreInitError> {
        Ok(Self::new(Database::open(path)?, config))
    }

    /// An in-memory store for tests.
    pub fn open_in_memory(config: SqlStoreConfig) -> Result<Self, StoreInitError> {
        Ok(Self::new(Database::open_in_memory()?, config))
    }

    /// Router-group lookup through the short-lived cache.
    async fn cached_router_group(&self, guid: &str) -> RoutingResult<Option<RouterGroup>> {
        if let Some(group) = self.group_cache.get(guid) {
            return Ok(Some(group));
        }
        let group = self.read_router_group(guid).await?;
        if let Some(group) = &group {
            self.group_cache.insert(group.clone());
        }
        Ok(group)
    }
}

impl Drop for SqlRoutingStore {
    fn drop(&mut self) {
        self.sweep_token.cancel();
    }
}

#[async_trait]
impl RoutingStore for SqlRoutingStore {
    async fn read_routes(&self) -> RoutingResult<Vec<Route>> {
        let db = self.db.lock().await;
        let conn = db.connection();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {HTTP_COLUMNS} FROM http_routes WHERE expires_at > ?1"
            ))
            .map_err(RoutingError::backend)?;
        let routes = stmt
            .query_map(params![now_millis()], route_from_row)
            .map_err(RoutingError::backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(RoutingError::backend)?;

        Ok(routes)
    }

    async fn upsert_route(&self, mut route: Route) -> RoutingResult<()> {
        route.validate()?;
        let ttl = route.ttl.unwrap_or(self.default_ttl_secs);
        let now = now_millis();
        let expires_at = now + (ttl as i64) * 1000;

        let db = self.db.lock().await;
        let conn = db.connection();

        let existing = conn
            .query_row(
                &format!(
                    "SELECT {HTTP_COLUMNS}, expires_at FROM http_routes \
                     WHERE route = ?1 AND ip = ?2 AND port = ?3"
                ),
                params![route.route, route.ip, route.port],
                |row| Ok((route_from_row(row)?, row.get::<_, i64>(8)?)),
            )
            .optional()
            .map_err(RoutingError::backend)?;

        match existing {
            Some((prev, prev_expires_at)) if prev_expires_at > now => {
                let mut tag = prev.modification_tag.clone();
                tag.increment();
                conn.execute(
                    "UPDATE http_routes \
                     SET ttl = ?4, log_guid = ?5, route_service_url = ?6, \
                         tag_index = tag_index + 1, expires_at = ?7 \
                     WHERE route = ?1 AND ip = ?2 AND port = ?3",
                    params![
                        route.route,
                        route.ip,
                        route.port,
                        ttl,
                        route.log_guid,
                        route.route_service_url,
                        expires_at
                    ],
                )
                .map_err(RoutingError::backend)?;

                route.ttl = Some(ttl);
                route.modification_tag = tag;
                self.http_hub
                    .emit(RoutingEvent::http(EventType::Update, route));
            }
            existing => {
                // a lapsed row that the sweeper has not claimed yet ends
                // its lease here, before the identity is reborn
                if let Some((expired, _)) = existing {
                    conn.execute(
                        "DELETE FROM http_routes WHERE route = ?1 AND ip = ?2 AND port = ?3",
                        params![expired.route, expired.ip, expired.port],
                    )
                    .map_err(RoutingError::backend)?;
                    self.http_hub
                        .emit(RoutingEvent::http(EventType::Expire, expired));
                }

                let tag = ModificationTag::fresh();
                conn.execute(
                    &format!(
                        "INSERT INTO http_routes ({HTTP_COLUMNS}, expires_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                    ),
                    params![
                        route.route,
                        route.ip,
                        route.port,
                        ttl,
                        route.log_guid,
                        route.route_service_url,
                        tag.guid,
                        tag.index,
                        expires_at
                    ],
                )
                .map_err(|e| map_unique_violation(e, "http route already exists"))?;

                route.ttl = Some(ttl);
                route.modification_tag = tag;
                self.http_hub
                    .emit(RoutingEvent::http(EventType::Create, route));
            }
        }

        Ok(())
    }

    async fn delete_route(&self, route: &Route) -> RoutingResult<()> {
        let db = self.db.lock().await;
        let conn = db.connection();

        let stored = conn
            .query_row(
                &format!(
                    "SELECT {HTTP_COLUMNS} FROM http_routes \
                     WHERE route = ?1 AND ip = ?2 AND port = ?3 AND expires_at > ?4"
                ),
                params![route.route, route.ip, route.port, now_millis()],
                route_from_row,
            )
            .optional()
            .map_err(RoutingError::backend)?
            .ok_or_else(|| {
                RoutingError::NotFound("Delete Fails: HTTP Route does not exist".to_string())
            })?;

        conn.execute(
            "DELETE FROM http_routes WHERE route = ?1 AND ip = ?2 AND port = ?3",
            params![route.route, route.ip, route.port],
        )
        .map_err(RoutingError::backend)?;

        self.http_hub
            .emit(RoutingEvent::http(EventType::Delete, stored));
        Ok(())
    }

    async fn read_tcp_routes(&self) -> RoutingResult<Vec<TcpRouteMapping>> {
        let db = self.db.lock().await;
        let conn = db.connection();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TCP_COLUMNS} FROM tcp_route_mappings WHERE expires_at > ?1"
            ))
            .map_err(RoutingError::backend)?;
        let mappings = stmt
            .query_map(params![now_millis()], tcp_from_row)
            .map_err(RoutingError::backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(RoutingError::backend)?;

        Ok(mappings)
    }

    async fn upsert_tcp_route(&self, mut mapping: TcpRouteMapping) -> RoutingResult<()> {
        mapping.validate()?;

        let referenced = self.cached_router_group(&mapping.router_group_guid).await?;
        group::check_reservable(referenced.as_ref(), &mapping)?;

        let ttl = mapping.ttl.unwrap_or(self.default_ttl_secs);
        let now = now_millis();
        let expires_at = now + (ttl as i64) * 1000;

        let db = self.db.lock().await;
        let conn = db.connection();

        let existing = conn
            .query_row(
                &format!(
                    "SELECT {TCP_COLUMNS} FROM tcp_route_mappings \
                     WHERE host_ip = ?1 AND host_port = ?2 AND external_port = ?3"
                ),
                params![mapping.host_ip, mapping.host_port, mapping.external_port],
                |row| Ok((tcp_from_row(row)?, row.get::<_, i64>(7)?)),
            )
            .optional()
            .map_err(RoutingError::backend)?;

        match existing {
            Some((prev, prev_expires_at)) if prev_expires_at > now => {
                let mut tag = prev.modification_tag.clone();
                tag.increment();
                conn.execute(
                    "UPDATE tcp_route_mappings \
                     SET router_group_guid = ?4, ttl = ?5, \
                         tag_index = tag_index + 1, expires_at = ?6 \
                     WHERE host_ip = ?1 AND host_port = ?2 AND external_port = ?3",
                    params![
                        mapping.host_ip,
                        mapping.host_port,
                        mapping.external_port,
                        mapping.router_group_guid,
                        ttl,
                        expires_at
                    ],
                )
                .map_err(RoutingError::backend)?;

                mapping.ttl = Some(ttl);
                mapping.modification_tag = tag;
                mapping.expires_at = from_millis(expires_at);
                self.tcp_hub
                    .emit(RoutingEvent::tcp(EventType::Update, mapping));
            }
            existing => {
                if let Some((expired, _)) = existing {
                    conn.execute(
                        "DELETE FROM tcp_route_mappings \
                         WHERE host_ip = ?1 AND host_port = ?2 AND external_port = ?3",
                        params![expired.host_ip, expired.host_port, expired.external_port],
                    )
                    .map_err(RoutingError::backend)?;
                    self.tcp_hub
                        .emit(RoutingEvent::tcp(EventType::Expire, expired));
                }

                let tag = ModificationTag::fresh();
                conn.execute(
                    &format!(
                        "INSERT INTO tcp_route_mappings ({TCP_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                    ),
                    params![
                        mapping.host_ip,
                        mapping.host_port,
                        mapping.external_port,
                        mapping.router_group_guid,
                        ttl,
                        tag.guid,
                        tag.index,
                        expires_at
                    ],
                )
                .map_err(|e| map_unique_violation(e, "tcp route mapping already exists"))?;

                mapping.ttl = Some(ttl);
                mapping.modification_tag = tag;
                mapping.expires_at = from_millis(expires_at);
                self.tcp_hub
                    .emit(RoutingEvent::tcp(EventType::Create, mapping));
            }
        }

        Ok(())
    }

    async fn delete_tcp_route(&self, mapping: &TcpRouteMapping) -> RoutingResult<()> {
        let db = self.db.lock().await;
        let conn = db.connection();

        let stored = conn
            .query_row(
                &format!(
                    "SELECT {TCP_COLUMNS} FROM tcp_route_mappings \
                     WHERE host_ip = ?1 AND host_port = ?2 AND external_port = ?3 \
                       AND expires_at > ?4"
                ),
                params![
                    mapping.host_ip,
                    mapping.host_port,
                    mapping.external_port,
                    now_millis()
                ],
                tcp_from_row,
            )
            .optional()
            .map_err(RoutingError::backend)?
            .ok_or_else(|| {
                RoutingError::NotFound(
                    "Delete Fails: TCP Route Mapping does not exist".to_string(),
                )
            })?;

        conn.execute(
            "DELETE FROM tcp_route_mappings \
             WHERE host_ip = ?1 AND host_port = ?2 AND external_port = ?3",
            params![mapping.host_ip, mapping.host_port, mapping.external_port],
        )
        .map_err(RoutingError::backend)?;

        self.tcp_hub
            .emit(RoutingEvent::tcp(EventType::Delete, stored));
        Ok(())
    }

    async fn read_router_groups(&self) -> RoutingResult<Vec<RouterGroup>> {
        let db = self.db.lock().await;
        let conn = db.connection();

        let mut stmt = conn
            .prepare("SELECT guid, name, type, reservable_ports FROM router_groups")
            .map_err(RoutingError::backend)?;
        let groups = stmt
            .query_map([], group_from_row)
            .map_err(RoutingError::backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(RoutingError::backend)?;

        Ok(groups)
    }

    async fn read_router_group(&self, guid: &str) -> RoutingResult<Option<RouterGroup>> {
        let db = self.db.lock().await;
        let conn = db.connection();

        conn.query_row(
            "SELECT guid, name, type, reservable_ports FROM router_groups WHERE guid = ?1",
            params![guid],
            group_from_row,
        )
        .optional()
        .map_err(RoutingError::backend)
    }

    async fn save_router_group(&self, incoming: RouterGroup) -> RoutingResult<()> {
        let existing = self.read_router_group(&incoming.guid).await?;
        let save = group::prepare_group_save(existing, incoming)?;

        let db = self.db.lock().await;
        let conn = db.connection();

        match save {
            GroupSave::Update(merged) => {
                let mapped = mapped_external_ports(conn, &merged.guid)?;
                group::check_no_orphaned_ports(&merged, mapped)?;

                conn.execute(
                    "UPDATE router_groups SET name = ?2, type = ?3, reservable_ports = ?4 \
                     WHERE guid = ?1",
                    params![
                        merged.guid,
                        merged.name,
                        merged.group_type,
                        merged.reservable_ports
                    ],
                )
                .map_err(|e| map_unique_violation(e, "router group name already taken"))?;
                self.group_cache.invalidate(&merged.guid);
            }
            GroupSave::Insert(group) => {
                conn.execute(
                    "INSERT INTO router_groups (guid, name, type, reservable_ports) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        group.guid,
                        group.name,
                        group.group_type,
                        group.reservable_ports
                    ],
                )
                .map_err(|e| map_unique_violation(e, "router group already exists"))?;
            }
        }

        Ok(())
    }

    fn watch_route_changes(&self, family: WatchFamily) -> RouteWatch {
        let hub = match family {
            WatchFamily::Http => &self.http_hub,
            WatchFamily::Tcp => &self.tcp_hub,
        };
        watch::spawn_route_watch(hub)
    }

    fn cancel_watches(&self) {
        self.http_hub.close_all();
        self.tcp_hub.close_all();
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> Option<chrono::DateTime<Utc>> {
    chrono::DateTime::from_timestamp_millis(ms)
}

fn route_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Route> {
    Ok(Route {
        route: row.get(0)?,
        ip: row.get(1)?,
        port: row.get(2)?,
        ttl: Some(row.get(3)?),
        log_guid: row.get(4)?,
        route_service_url: row.get(5)?,
        modification_tag: ModificationTag {
            guid: row.get(6)?,
            index: row.get(7)?,
        },
    })
}

fn tcp_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TcpRouteMapping> {
    Ok(TcpRouteMapping {
        host_ip: row.get(0)?,
        host_port: row.get(1)?,
        external_port: row.get(2)?,
        router_group_guid: row.get(3)?,
        ttl: Some(row.get(4)?),
        modification_tag: ModificationTag {
            guid: row.get(5)?,
            index: row.get(6)?,
        },
        expires_at: from_millis(row.get(7)?),
    })
}

fn group_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RouterGroup> {
    Ok(RouterGroup {
        guid: row.get(0)?,
        name: row.get(1)?,
        group_type: row.get(2)?,
        reservable_ports: row.get(3)?,
    })
}

fn mapped_external_ports(conn: &Connection, guid: &str) -> RoutingResult<Vec<u16>> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT external_port FROM tcp_route_mappings \
             WHERE router_group_guid = ?1 AND expires_at > ?2",
        )
        .map_err(RoutingError::backend)?;
    let ports = stmt
        .query_map(params![guid, now_millis()], |row| row.get(0))
        .map_err(RoutingError::backend)?
        .collect::<Result<Vec<u16>, _>>()
        .map_err(RoutingError::backend)?;
    Ok(ports)
}

/// Uniqueness races surface as `Conflict`; everything else is a backend
/// fault.
fn map_unique_violation(err: rusqlite::Error, message: &str) -> RoutingError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            RoutingError::Conflict(message.to_string())
        }
        _ => RoutingError::backend(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_default_group() -> (SqlRoutingStore, RouterGroup) {
        let store = SqlRoutingStore::open_in_memory(SqlStoreConfig::default()).unwrap();
        let group = RouterGroup::default_tcp();
        store.save_router_group(group.clone()).await.unwrap();
        (store, group)
    }

    #[tokio::test]
    async fn test_expired_rows_are_invisible() {
        let (store, group) = store_with_default_group().await;

        let mapping = TcpRouteMapping::new(&group.guid, 3000, "1.1.1.1", 1234, 60);
        store.upsert_tcp_route(mapping.clone()).await.unwrap();

        // age the row past its lease directly
        {
            let db = store.db.lock().await;
            db.connection()
                .execute(
                    "UPDATE tcp_route_mappings SET expires_at = ?1",
                    params![now_millis() - 1000],
                )
                .unwrap();
        }

        assert!(store.read_tcp_routes().await.unwrap().is_empty());

        // and an expired row cannot be explicitly deleted
        let err = store.delete_tcp_route(&mapping).await.unwrap_err();
        assert_eq!(err.name(), "NotFound");
    }

    #[tokio::test]
    async fn test_upsert_refreshes_lease_and_bumps_tag() {
        let (store, group) = store_with_default_group().await;

        let mapping = TcpRouteMapping::new(&group.guid, 3000, "1.1.1.1", 1234, 55);
        store.upsert_tcp_route(mapping.clone()).await.unwrap();

        let stored = store.read_tcp_routes().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].modification_tag.index, 0);
        let first_guid = stored[0].modification_tag.guid.clone();

        let mut updated = mapping;
        updated.ttl = Some(85);
        store.upsert_tcp_route(updated).await.unwrap();

        let stored = store.read_tcp_routes().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].ttl, Some(85));
        assert_eq!(stored[0].modification_tag.index, 1);
        assert_eq!(stored[0].modification_tag.guid, first_guid);
    }

    #[tokio::test]
    async fn test_save_router_group_rejects_orphaning_shrink() {
        let (store, group) = store_with_default_group().await;

        let mapping = TcpRouteMapping::new(&group.guid, 3000, "1.1.1.1", 1234, 60);
        store.upsert_tcp_route(mapping).await.unwrap();

        let mut shrunk = group.clone();
        shrunk.reservable_ports = "6000-8000".to_string();
        let err = store.save_router_group(shrunk).await.unwrap_err();
        assert_eq!(err.name(), "InUse");

        // the stored range is unchanged
        let stored = store.read_router_group(&group.guid).await.unwrap().unwrap();
        assert_eq!(stored.reservable_ports, "1024-65535");
    }

    #[tokio::test]
    async fn test_group_names_are_unique() {
        let (store, group) = store_with_default_group().await;

        let mut other = RouterGroup::default_tcp();
        other.name = group.name.clone();
        let err = store.save_router_group(other).await.unwrap_err();
        assert_eq!(err.name(), "Conflict");
    }
}
