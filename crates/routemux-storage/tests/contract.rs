//! Contract suite - every test runs identically against both back-ends.
//!
//! The relational and KV stores differ in how they persist and expire, but
//! behind `RoutingStore` they must be indistinguishable: same round-trip
//! behavior, same tag discipline, same event stream, same failure kinds.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use routemux_core::{
    EventType, Route, RouterGroup, RoutingStore, TcpRouteMapping, WatchFamily,
};
use routemux_storage::kv::{KvRoutingStore, KvStoreConfig};
use routemux_storage::sql::{SqlRoutingStore, SqlStoreConfig};

async fn seed_default_group(store: &dyn RoutingStore) -> RouterGroup {
    let group = RouterGroup::default_tcp();
    store.save_router_group(group.clone()).await.unwrap();
    group
}

/// On the KV back-end events reach the hub through a translator task, so a
/// subscription opened right after a mutation could still see it. Let the
/// pipeline drain before subscribing.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn round_trip(store: Arc<dyn RoutingStore>) {
    let route = Route::new("a.b.c", 33, "1.1.1.1", "potato", "", 55);
    store.upsert_route(route.clone()).await.unwrap();

    let routes = store.read_routes().await.unwrap();
    assert_eq!(routes.len(), 1);
    assert!(routes[0].matches_identity(&route));
    assert_eq!(routes[0].log_guid, "potato");

    store.delete_route(&route).await.unwrap();
    assert!(store.read_routes().await.unwrap().is_empty());

    let err = store.delete_route(&route).await.unwrap_err();
    assert_eq!(err.name(), "NotFound");
}

async fn upsert_increments_tag_per_call(store: Arc<dyn RoutingStore>) {
    let route = Route::new("a.b.c", 33, "1.1.1.1", "potato", "", 55);

    store.upsert_route(route.clone()).await.unwrap();
    let first = store.read_routes().await.unwrap().remove(0);
    assert_eq!(first.modification_tag.index, 0);

    store.upsert_route(route.clone()).await.unwrap();
    store.upsert_route(route.clone()).await.unwrap();

    let routes = store.read_routes().await.unwrap();
    assert_eq!(routes.len(), 1, "identity stays stable across upserts");
    assert_eq!(routes[0].modification_tag.guid, first.modification_tag.guid);
    assert_eq!(routes[0].modification_tag.index, 2);
}

async fn update_event_carries_new_ttl(store: Arc<dyn RoutingStore>) {
    let route = Route::new("a.b.c", 33, "1.1.1.1", "potato", "", 55);
    store.upsert_route(route.clone()).await.unwrap();
    settle().await;

    let mut watch = store.watch_route_changes(WatchFamily::Http);

    let mut updated = route.clone();
    updated.ttl = Some(85);
    store.upsert_route(updated).await.unwrap();

    let event = watch.events.recv().await.unwrap();
    assert_eq!(event.event_type(), EventType::Update);
    match event {
        routemux_core::RoutingEvent::Http { route: seen, .. } => {
            assert!(seen.matches_identity(&route));
            assert_eq!(seen.ttl, Some(85));
        }
        other => panic!("unexpected event family: {other:?}"),
    }

    // exactly one event for one upsert
    let quiet = tokio::time::timeout(Duration::from_millis(200), watch.events.recv()).await;
    assert!(quiet.is_err());

    let routes = store.read_routes().await.unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].ttl, Some(85));
}

async fn same_identity_events_arrive_in_commit_order(store: Arc<dyn RoutingStore>) {
    let mut watch = store.watch_route_changes(WatchFamily::Http);

    let route = Route::new("ordered.example.com", 8080, "10.0.0.1", "", "", 60);
    store.upsert_route(route.clone()).await.unwrap();
    store.upsert_route(route.clone()).await.unwrap();

    let first = watch.events.recv().await.unwrap();
    let second = watch.events.recv().await.unwrap();
    assert_eq!(first.event_type(), EventType::Create);
    assert_eq!(second.event_type(), EventType::Update);

    match (first, second) {
        (
            routemux_core::RoutingEvent::Http { route: v1, .. },
            routemux_core::RoutingEvent::Http { route: v2, .. },
        ) => {
            assert!(v1.modification_tag.succeeded_by(&v2.modification_tag));
        }
        other => panic!("unexpected events: {other:?}"),
    }
}

async fn concurrent_subscribers_see_the_same_order(store: Arc<dyn RoutingStore>) {
    let group = seed_default_group(store.as_ref()).await;

    let mut watch_a = store.watch_route_changes(WatchFamily::Tcp);
    let mut watch_b = store.watch_route_changes(WatchFamily::Tcp);

    let first = TcpRouteMapping::new(&group.guid, 52000, "1.2.3.4", 60000, 60);
    let second = TcpRouteMapping::new(&group.guid, 52001, "1.2.3.5", 60001, 60);
    store.upsert_tcp_route(first.clone()).await.unwrap();
    store.upsert_tcp_route(second.clone()).await.unwrap();

    for watch in [&mut watch_a, &mut watch_b] {
        for expected in [&first, &second] {
            let event = watch.events.recv().await.unwrap();
            match event {
                routemux_core::RoutingEvent::Tcp { mapping, .. } => {
                    assert!(mapping.matches_identity(expected));
                }
                other => panic!("unexpected event family: {other:?}"),
            }
        }
    }
}

async fn short_lease_expires_once(store: Arc<dyn RoutingStore>) {
    let mut watch = store.watch_route_changes(WatchFamily::Http);

    let route = Route::new("z.a.k", 63, "42.42.42.42", "tomato", "", 1);
    store.upsert_route(route.clone()).await.unwrap();

    let created = watch.events.recv().await.unwrap();
    assert_eq!(created.event_type(), EventType::Create);

    let expired = tokio::time::timeout(Duration::from_secs(3), watch.events.recv())
        .await
        .expect("expiry event after the lease lapses")
        .unwrap();
    assert_eq!(expired.event_type(), EventType::Expire);

    assert!(store.read_routes().await.unwrap().is_empty());

    // exactly one terminal event per lease
    let quiet = tokio::time::timeout(Duration::from_millis(1200), watch.events.recv()).await;
    assert!(quiet.is_err(), "expected silence, got {quiet:?}");
}

async fn invalid_route_leaves_store_unchanged(store: Arc<dyn RoutingStore>) {
    let good = Route::new("a.b.c", 33, "1.1.1.1", "potato", "", 55);
    store.upsert_route(good.clone()).await.unwrap();

    let bad = Route::new("foo/b ar", 35, "2.2.2.2", "banana", "", 66);
    let err = store.upsert_route(bad).await.unwrap_err();
    assert_eq!(err.name(), "Invalid");

    let routes = store.read_routes().await.unwrap();
    assert_eq!(routes.len(), 1);
    assert!(routes[0].matches_identity(&good));
}

async fn tcp_upsert_enforces_referential_integrity(store: Arc<dyn RoutingStore>) {
    let group = seed_default_group(store.as_ref()).await;

    // unknown router group
    let unknown = TcpRouteMapping::new("no-such-group", 3000, "1.1.1.1", 1234, 60);
    let err = store.upsert_tcp_route(unknown).await.unwrap_err();
    assert_eq!(err.name(), "RefIntegrity");

    // port outside the reservable range (default range starts at 1024)
    let below_range = TcpRouteMapping::new(&group.guid, 1023, "1.1.1.1", 1234, 60);
    let err = store.upsert_tcp_route(below_range).await.unwrap_err();
    assert_eq!(err.name(), "RefIntegrity");

    assert!(store.read_tcp_routes().await.unwrap().is_empty());
}

async fn router_group_update_flow(store: Arc<dyn RoutingStore>) {
    let group = seed_default_group(store.as_ref()).await;

    let mapping = TcpRouteMapping::new(&group.guid, 3000, "1.1.1.1", 1234, 60);
    store.upsert_tcp_route(mapping.clone()).await.unwrap();

    // shrinking the range under a live mapping is refused
    let mut shrunk = group.clone();
    shrunk.reservable_ports = "6000-8000".to_string();
    let err = store.save_router_group(shrunk.clone()).await.unwrap_err();
    assert_eq!(err.name(), "InUse");

    // once the mapping is gone the shrink goes through
    store.delete_tcp_route(&mapping).await.unwrap();
    store.save_router_group(shrunk).await.unwrap();

    let groups = store.read_router_groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].reservable_ports, "6000-8000");

    // and a fresh upsert at the orphaned port is out of range now
    let err = store.upsert_tcp_route(mapping.clone()).await.unwrap_err();
    assert_eq!(err.name(), "RefIntegrity");
    assert!(store.read_tcp_routes().await.unwrap().is_empty());
}

async fn watch_cancel_is_idempotent_and_scoped(store: Arc<dyn RoutingStore>) {
    let group = seed_default_group(store.as_ref()).await;

    let mut watch = store.watch_route_changes(WatchFamily::Tcp);
    watch.cancel();
    watch.cancel();
    assert!(watch.events.recv().await.is_none());
    assert!(watch.errors.recv().await.is_none());

    // a cancelled watch does not affect a fresh one
    let mut fresh = store.watch_route_changes(WatchFamily::Tcp);
    let mapping = TcpRouteMapping::new(&group.guid, 52000, "1.2.3.4", 60000, 60);
    store.upsert_tcp_route(mapping).await.unwrap();
    assert!(fresh.events.recv().await.is_some());
}

async fn cancel_watches_terminates_everything(store: Arc<dyn RoutingStore>) {
    let mut open = store.watch_route_changes(WatchFamily::Http);

    store.cancel_watches();
    store.cancel_watches();

    assert!(open.events.recv().await.is_none());

    // a terminated back-end hands out already-closed pairs
    let mut after = store.watch_route_changes(WatchFamily::Http);
    assert!(after.events.recv().await.is_none());
    assert!(after.errors.recv().await.is_none());
}

async fn unknown_family_yields_invalid_family(store: Arc<dyn RoutingStore>) {
    let mut watch = routemux_storage::open_watch(store.as_ref(), "udp");
    let err = watch.errors.recv().await.unwrap();
    assert_eq!(err.name(), "InvalidFamily");
    assert!(watch.events.recv().await.is_none());

    // known families parse fine through the same path
    let healthy = routemux_storage::open_watch(store.as_ref(), "http");
    drop(healthy);
}

macro_rules! contract_tests {
    ($backend:ident, $make:expr) => {
        mod $backend {
            use super::*;

            #[tokio::test]
            async fn test_round_trip() {
                round_trip($make).await;
            }

            #[tokio::test]
            async fn test_upsert_increments_tag_per_call() {
                upsert_increments_tag_per_call($make).await;
            }

            #[tokio::test]
            async fn test_update_event_carries_new_ttl() {
                update_event_carries_new_ttl($make).await;
            }

            #[tokio::test]
            async fn test_same_identity_events_arrive_in_commit_order() {
                same_identity_events_arrive_in_commit_order($make).await;
            }

            #[tokio::test]
            async fn test_concurrent_subscribers_see_the_same_order() {
                concurrent_subscribers_see_the_same_order($make).await;
            }

            #[tokio::test]
            async fn test_short_lease_expires_once() {
                short_lease_expires_once($make).await;
            }

            #[tokio::test]
            async fn test_invalid_route_leaves_store_unchanged() {
                invalid_route_leaves_store_unchanged($make).await;
            }

            #[tokio::test]
            async fn test_tcp_upsert_enforces_referential_integrity() {
                tcp_upsert_enforces_referential_integrity($make).await;
            }

            #[tokio::test]
            async fn test_router_group_update_flow() {
                router_group_update_flow($make).await;
            }

            #[tokio::test]
            async fn test_watch_cancel_is_idempotent_and_scoped() {
                watch_cancel_is_idempotent_and_scoped($make).await;
            }

            #[tokio::test]
            async fn test_cancel_watches_terminates_everything() {
                cancel_watches_terminates_everything($make).await;
            }

            #[tokio::test]
            async fn test_unknown_family_yields_invalid_family() {
                unknown_family_yields_invalid_family($make).await;
            }
        }
    };
}

contract_tests!(
    relational,
    Arc::new(SqlRoutingStore::open_in_memory(SqlStoreConfig::default()).unwrap()) as Arc<dyn RoutingStore>
);

contract_tests!(
    kv,
    Arc::new(KvRoutingStore::new(KvStoreConfig::default())) as Arc<dyn RoutingStore>
);
