//! The storage contract implemented by every back-end.
//!
//! Both back-ends (relational and KV-with-TTL) provide exactly this
//! surface; the contract test suite in `routemux-storage/tests/` runs
//! against either. Reads return only live (non-expired) entities, mutations
//! emit events after - and only after - the change has committed.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{Route, RouterGroup, RoutingEvent, TcpRouteMapping};
use crate::error::{RoutingError, RoutingResult};

/// The two event families a watch can follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchFamily {
    Http,
    Tcp,
}

impl WatchFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchFamily::Http => "http",
            WatchFamily::Tcp => "tcp",
        }
    }
}

impl std::str::FromStr for WatchFamily {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(WatchFamily::Http),
            "tcp" => Ok(WatchFamily::Tcp),
            other => Err(RoutingError::InvalidFamily(other.to_string())),
        }
    }
}

/// A request-scoped stream of routing events.
///
/// The forwarder task feeding these channels is their sole owner and
/// closes both when it exits, so a reader can never race a close.
pub struct RouteWatch {
    /// State-change events, in emission order.
    pub events: mpsc::Receiver<RoutingEvent>,
    /// Terminal subscription errors (at most one).
    pub errors: mpsc::Receiver<RoutingError>,
    cancel: CancellationToken,
}

impl RouteWatch {
    pub fn new(
        events: mpsc::Receiver<RoutingEvent>,
        errors: mpsc::Receiver<RoutingError>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            events,
            errors,
            cancel,
        }
    }

    /// Stop the watch. Idempotent; both channels close promptly.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RouteWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Storage contract shared by the relational and KV back-ends.
#[async_trait]
pub trait RoutingStore: Send + Sync {
    /// All live HTTP routes, unordered.
    async fn read_routes(&self) -> RoutingResult<Vec<Route>>;

    /// Insert or update an HTTP route by `(route, ip, port)` identity.
    ///
    /// An update refreshes the lease and increments the modification tag;
    /// an insert assigns a fresh tag. Emits `Update` or `Create` after
    /// commit.
    async fn upsert_route(&self, route: Route) -> RoutingResult<()>;

    /// Remove an HTTP route by identity; `NotFound` if absent. Emits
    /// `Delete` after commit.
    async fn delete_route(&self, route: &Route) -> RoutingResult<()>;

    /// All live TCP route mappings, unordered.
    async fn read_tcp_routes(&self) -> RoutingResult<Vec<TcpRouteMapping>>;

    /// Insert or update a TCP mapping by `(host_ip, host_port,
    /// external_port)` identity.
    ///
    /// Fails with `RefIntegrity` when the referenced router group is
    /// unknown or does not reserve the external port.
    async fn upsert_tcp_route(&self, mapping: TcpRouteMapping) -> RoutingResult<()>;

    /// Remove a TCP mapping by identity; `NotFound` if absent. Emits
    /// `Delete` after commit.
    async fn delete_tcp_route(&self, mapping: &TcpRouteMapping) -> RoutingResult<()>;

    /// All router groups.
    async fn read_router_groups(&self) -> RoutingResult<Vec<RouterGroup>>;

    /// One router group by guid, if present.
    async fn read_router_group(&self, guid: &str) -> RoutingResult<Option<RouterGroup>>;

    /// Update-if-exists-else-insert, keyed by guid, with field-level
    /// merge: only non-empty incoming fields overwrite. Fails with
    /// `InUse` when a shrunk reservable range would orphan mapped ports
    /// and with `Invalid` on an attempted type change.
    async fn save_router_group(&self, group: RouterGroup) -> RoutingResult<()>;

    /// Open a watch on one event family.
    fn watch_route_changes(&self, family: WatchFamily) -> RouteWatch;

    /// Terminate every outstanding watch. Idempotent; afterwards
    /// `watch_route_changes` returns an already-closed pair.
    fn cancel_watches(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_watch_family_round_trip() {
        assert_eq!(WatchFamily::from_str("http").unwrap(), WatchFamily::Http);
        assert_eq!(WatchFamily::from_str("tcp").unwrap(), WatchFamily::Tcp);
        assert_eq!(WatchFamily::Http.as_str(), "http");
    }

    #[test]
    fn test_unknown_family_is_invalid() {
        let err = WatchFamily::from_str("udp").unwrap_err();
        assert_eq!(err.name(), "InvalidFamily");
    }
}
