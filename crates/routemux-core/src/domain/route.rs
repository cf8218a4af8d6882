//! HTTP route entity - maps a hostname (plus optional path) to a backend.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RoutingError, RoutingResult};

use super::ModificationTag;

/// An HTTP route registration.
///
/// Identity is `(route, ip, port)`; everything else is mutable metadata
/// refreshed on upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Hostname with an optional context path, e.g. `host.com/path`.
    pub route: String,

    /// Backend port.
    pub port: u16,

    /// Backend IP address.
    pub ip: String,

    /// Lease duration in seconds. `None` inherits the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,

    /// Opaque correlation id for the owning application's logs.
    #[serde(default)]
    pub log_guid: String,

    /// Absolute URL of a route service fronting this route, empty if none.
    #[serde(default)]
    pub route_service_url: String,

    #[serde(default)]
    pub modification_tag: ModificationTag,
}

impl Route {
    pub fn new(
        route: impl Into<String>,
        port: u16,
        ip: impl Into<String>,
        log_guid: impl Into<String>,
        route_service_url: impl Into<String>,
        ttl: u64,
    ) -> Self {
        Self {
            route: route.into(),
            port,
            ip: ip.into(),
            ttl: Some(ttl),
            log_guid: log_guid.into(),
            route_service_url: route_service_url.into(),
            modification_tag: ModificationTag::fresh(),
        }
    }

    /// Returns true when `other` names the same `(route, ip, port)` identity.
    pub fn matches_identity(&self, other: &Route) -> bool {
        self.route == other.route && self.ip == other.ip && self.port == other.port
    }

    /// Validate host, path, port, IP, and route service URL.
    pub fn validate(&self) -> RoutingResult<()> {
        if self.port == 0 {
            return Err(RoutingError::Invalid(
                "Port must be between 1 and 65535".to_string(),
            ));
        }

        let (host, path) = match self.route.split_once('/') {
            Some((host, rest)) => (host, Some(format!("/{rest}"))),
            None => (self.route.as_str(), None),
        };

        validate_host(host)?;

        if let Some(path) = path {
            if path.chars().any(char::is_whitespace) {
                return Err(RoutingError::Invalid(format!(
                    "Context path '{path}' cannot contain whitespace"
                )));
            }
        }

        self.ip
            .parse::<std::net::IpAddr>()
            .map_err(|_| RoutingError::Invalid(format!("'{}' is not a valid IP address", self.ip)))?;

        if !self.route_service_url.is_empty() {
            Url::parse(&self.route_service_url).map_err(|_| {
                RoutingError::Invalid(format!(
                    "Route service url '{}' is not a valid absolute url",
                    self.route_service_url
                ))
            })?;
        }

        Ok(())
    }
}

/// A host is a non-empty dot-separated sequence of DNS labels.
fn validate_host(host: &str) -> RoutingResult<()> {
    if host.is_empty() {
        return Err(RoutingError::Invalid("Host cannot be empty".to_string()));
    }

    for label in host.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !valid {
            return Err(RoutingError::Invalid(format!(
                "Host '{host}' contains an invalid label '{label}'"
            )));
        }
    }

    Ok(())
}
