//! TCP route mapping entity - maps a router-group-scoped external port to a
//! backend host and port.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RoutingError, RoutingResult};

use super::ModificationTag;

/// A TCP route mapping.
///
/// Identity is `(host_ip, host_port, external_port)` and at most one
/// mapping exists per identity. The external port must fall inside the
/// reservable range of the referenced router group; the store enforces
/// that at upsert time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpRouteMapping {
    /// Guid of the router group scoping the external port.
    pub router_group_guid: String,

    /// Port the data plane listens on.
    pub external_port: u16,

    /// Backend host IP.
    pub host_ip: String,

    /// Backend host port.
    pub host_port: u16,

    /// Lease duration in seconds. `None` inherits the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,

    #[serde(default)]
    pub modification_tag: ModificationTag,

    /// Instant the lease lapses. Assigned by the store; absent on ingress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TcpRouteMapping {
    pub fn new(
        router_group_guid: impl Into<String>,
        external_port: u16,
        host_ip: impl Into<String>,
        host_port: u16,
        ttl: u64,
    ) -> Self {
        Self {
            router_group_guid: router_group_guid.into(),
            external_port,
            host_ip: host_ip.into(),
            host_port,
            ttl: Some(ttl),
            modification_tag: ModificationTag::fresh(),
            expires_at: None,
        }
    }

    /// Returns true when `other` names the same
    /// `(host_ip, host_port, external_port)` identity.
    pub fn matches_identity(&self, other: &TcpRouteMapping) -> bool {
        self.host_ip == other.host_ip
            && self.host_port == other.host_port
            && self.external_port == other.external_port
    }

    /// Validate ports, the backend IP, and the router-group reference.
    ///
    /// Whether the referenced group exists (and reserves the external
    /// port) is a store-level check; this only rejects shapes that can
    /// never be valid.
    pub fn validate(&self) -> RoutingResult<()> {
        if self.router_group_guid.is_empty() {
            return Err(RoutingError::Invalid(
                "Each tcp mapping requires a non empty router group guid".to_string(),
            ));
        }
        if self.external_port == 0 {
            return Err(RoutingError::Invalid(
                "Each tcp mapping requires a positive external port".to_string(),
            ));
        }
        if self.host_port == 0 {
            return Err(RoutingError::Invalid(
                "Each tcp mapping requires a positive host port".to_string(),
            ));
        }
        self.host_ip.parse::<std::net::IpAddr>().map_err(|_| {
            RoutingError::Invalid(format!("'{}' is not a valid host IP address", self.host_ip))
        })?;

        Ok(())
    }
}
