//! KV-with-TTL back-end.
//!
//! Entities serialize to JSON values at deterministic paths under
//! `/routing/`; the embedded store enforces the lease and its subtree
//! watches are the event source. One translator task per family turns
//! native put/delete events into Create/Update/Delete/Expire hub events -
//! a put with a live predecessor is an update, a delete flagged `expired`
//! is an expiry. No sweeper exists on this back-end.

pub mod store;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::warn;

use routemux_core::{
    EventHub, EventType, ModificationTag, Route, RouteWatch, RouterGroup, RoutingError,
    RoutingEvent, RoutingResult, RoutingStore, TcpRouteMapping, WatchFamily,
    DEFAULT_BUFFER_CAPACITY,
};

use crate::cache::RouterGroupCache;
use crate::group::{self, GroupSave};
use crate::watch;

use store::{KvEvent, KvStore, KvWatcher};

const HTTP_PREFIX: &str = "/routing/http/";
const TCP_PREFIX: &str = "/routing/tcp/";
const GROUP_PREFIX: &str = "/routing/router_groups/";

/// Tuning knobs for the KV back-end.
#[derive(Debug, Clone)]
pub struct KvStoreConfig {
    /// TTL applied when an upsert omits one, in seconds.
    pub default_ttl_secs: u64,
    /// Per-subscriber event buffer capacity.
    pub hub_capacity: usize,
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 120,
            hub_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// Routing store over the embedded KV store.
pub struct KvRoutingStore {
    kv: KvStore,
    http_hub: EventHub<RoutingEvent>,
    tcp_hub: EventHub<RoutingEvent>,
    group_cache: RouterGroupCache,
    default_ttl_secs: u64,
    /// Serializes read-modify-write cycles; single KV operations are
    /// atomic on their own.
    mutation: Mutex<()>,
}

impl KvRoutingStore {
    /// Create an empty store and start its event translators.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: KvStoreConfig) -> Self {
        let kv = KvStore::new();
        let http_hub = EventHub::with_capacity(config.hub_capacity);
        let tcp_hub = EventHub::with_capacity(config.hub_capacity);

        tokio::spawn(translate_http(kv.watch(HTTP_PREFIX), http_hub.clone()));
        tokio::spawn(translate_tcp(kv.watch(TCP_PREFIX), tcp_hub.clone()));

        Self {
            kv,
            http_hub,
            tcp_hub,
            group_cache: RouterGroupCache::default(),
            default_ttl_secs: config.default_ttl_secs,
            mutation: Mutex::new(()),
        }
    }

    fn cached_router_group(&self, guid: &str) -> RoutingResult<Option<RouterGroup>> {
        if let Some(group) = self.group_cache.get(guid) {
            return Ok(Some(group));
        }
        let group = self.load_router_group(guid)?;
        if let Some(group) = &group {
            self.group_cache.insert(group.clone());
        }
        Ok(group)
    }

    fn load_router_group(&self, guid: &str) -> RoutingResult<Option<RouterGroup>> {
        self.kv
            .get(&group_key(guid))
            .map(|value| decode::<RouterGroup>(&value))
            .transpose()
    }
}

fn http_key(route: &Route) -> String {
    format!("{HTTP_PREFIX}{},{}:{}", route.route, route.ip, route.port)
}

fn tcp_key(mapping: &TcpRouteMapping) -> String {
    format!(
        "{TCP_PREFIX}{}/{}:{}",
        mapping.external_port, mapping.host_ip, mapping.host_port
    )
}

fn group_key(guid: &str) -> String {
    format!("{GROUP_PREFIX}{guid}")
}

fn decode<T: serde::de::DeserializeOwned>(value: &str) -> RoutingResult<T> {
    serde_json::from_str(value).map_err(RoutingError::backend)
}

fn encode<T: serde::Serialize>(value: &T) -> RoutingResult<String> {
    serde_json::to_string(value).map_err(RoutingError::backend)
}

async fn translate_http(mut watcher: KvWatcher, hub: EventHub<RoutingEvent>) {
    while let Some(event) = watcher.recv().await {
        match translate(event, RoutingEvent::http) {
            Ok(event) => hub.emit(event),
            Err(err) => warn!("[KvStore] dropping undecodable http event: {err}"),
        }
    }
}

async fn translate_tcp(mut watcher: KvWatcher, hub: EventHub<RoutingEvent>) {
    while let Some(event) = watcher.recv().await {
        match translate(event, RoutingEvent::tcp) {
            Ok(event) => hub.emit(event),
            Err(err) => warn!("[KvStore] dropping undecodable tcp event: {err}"),
        }
    }
}

/// Native event to routing event: put with a predecessor is an update,
/// expired delete is an expiry.
fn translate<T: serde::de::DeserializeOwned>(
    event: KvEvent,
    wrap: fn(EventType, T) -> RoutingEvent,
) -> RoutingResult<RoutingEvent> {
    match event {
        KvEvent::Put { value, prev, .. } => {
            let event_type = if prev.is_some() {
                EventType::Update
            } else {
                EventType::Create
            };
            Ok(wrap(event_type, decode(&value)?))
        }
        KvEvent::Delete { value, expired, .. } => {
            let event_type = if expired {
                EventType::Expire
            } else {
                EventType::Delete
            };
            Ok(wrap(event_type, decode(&value)?))
        }
    }
}

#[async_trait]
impl RoutingStore for KvRoutingStore {
    async fn read_routes(&self) -> RoutingResult<Vec<Route>> {
        self.kv
            .range(HTTP_PREFIX)
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    async fn upsert_route(&self, mut route: Route) -> RoutingResult<()> {
        route.validate()?;
        let ttl = route.ttl.unwrap_or(self.default_ttl_secs);
        let key = http_key(&route);

        let _guard = self.mutation.lock().await;

        let tag = match self.kv.get(&key) {
            Some(value) => {
                let prev: Route = decode(&value)?;
                let mut tag = prev.modification_tag;
                tag.increment();
                tag
            }
            None => ModificationTag::fresh(),
        };

        route.ttl = Some(ttl);
        route.modification_tag = tag;
        self.kv
            .put(&key, encode(&route)?, Some(Duration::from_secs(ttl)));
        Ok(())
    }

    async fn delete_route(&self, route: &Route) -> RoutingResult<()> {
        self.kv.delete(&http_key(route)).map(|_| ()).ok_or_else(|| {
            RoutingError::NotFound("Delete Fails: HTTP Route does not exist".to_string())
        })
    }

    async fn read_tcp_routes(&self) -> RoutingResult<Vec<TcpRouteMapping>> {
        self.kv
            .range(TCP_PREFIX)
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    async fn upsert_tcp_route(&self, mut mapping: TcpRouteMapping) -> RoutingResult<()> {
        mapping.validate()?;

        let referenced = self.cached_router_group(&mapping.router_group_guid)?;
        group::check_reservable(referenced.as_ref(), &mapping)?;

        let ttl = mapping.ttl.unwrap_or(self.default_ttl_secs);
        let key = tcp_key(&mapping);

        let _guard = self.mutation.lock().await;

        let tag = match self.kv.get(&key) {
            Some(value) => {
                let prev: TcpRouteMapping = decode(&value)?;
                let mut tag = prev.modification_tag;
                tag.increment();
                tag
            }
            None => ModificationTag::fresh(),
        };

        mapping.ttl = Some(ttl);
        mapping.modification_tag = tag;
        mapping.expires_at = Some(Utc::now() + chrono::Duration::seconds(ttl as i64));
        self.kv
            .put(&key, encode(&mapping)?, Some(Duration::from_secs(ttl)));
        Ok(())
    }

    async fn delete_tcp_route(&self, mapping: &TcpRouteMapping) -> RoutingResult<()> {
        self.kv.delete(&tcp_key(mapping)).map(|_| ()).ok_or_else(|| {
            RoutingError::NotFound("Delete Fails: TCP Route Mapping does not exist".to_string())
        })
    }

    async fn read_router_groups(&self) -> RoutingResult<Vec<RouterGroup>> {
        self.kv
            .range(GROUP_PREFIX)
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    async fn read_router_group(&self, guid: &str) -> RoutingResult<Option<RouterGroup>> {
        self.load_router_group(guid)
    }

    async fn save_router_group(&self, incoming: RouterGroup) -> RoutingResult<()> {
        let _guard = self.mutation.lock().await;

        let existing = self.load_router_group(&incoming.guid)?;
        let save = group::prepare_group_save(existing, incoming)?;

        let (group, is_update) = match save {
            GroupSave::Update(group) => (group, true),
            GroupSave::Insert(group) => (group, false),
        };

        // names are unique across groups
        for other in self.read_router_groups().await? {
            if other.guid != group.guid && other.name == group.name {
                return Err(RoutingError::Conflict(
                    "router group name already taken".to_string(),
                ));
            }
        }

        if is_update {
            let mapped = self
                .read_tcp_routes()
                .await?
                .into_iter()
                .filter(|mapping| mapping.router_group_guid == group.guid)
                .map(|mapping| mapping.external_port);
            group::check_no_orphaned_ports(&group, mapped)?;
        }

        self.kv.put(&group_key(&group.guid), encode(&group)?, None);
        self.group_cache.invalidate(&group.guid);
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
