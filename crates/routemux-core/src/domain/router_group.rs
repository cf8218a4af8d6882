//! Router groups - named pools of reservable ports scoping TCP routes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RoutingError, RoutingResult};

/// The only router group type currently defined.
pub const ROUTER_GROUP_TYPE_TCP: &str = "tcp";

/// Name of the router group seeded on first startup.
pub const DEFAULT_ROUTER_GROUP_NAME: &str = "default-tcp";

/// Reservable range of the seeded router group.
pub const DEFAULT_RESERVABLE_PORTS: &str = "1024-65535";

/// A named pool of reservable external ports.
///
/// Every field takes a serde default: update requests may carry a partial
/// record, and the save path merges only the non-empty fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterGroup {
    #[serde(default)]
    pub guid: String,

    /// Unique human-readable name.
    #[serde(default)]
    pub name: String,

    /// Group type; the closed set is currently `{tcp}`. Immutable after
    /// creation.
    #[serde(rename = "type", default)]
    pub group_type: String,

    /// Port-range expression, e.g. `"1024-65535"` or `"6000-8000,9000"`.
    #[serde(default)]
    pub reservable_ports: String,
}

impl RouterGroup {
    /// The router group seeded on first startup when none exist.
    pub fn default_tcp() -> Self {
        Self {
            guid: Uuid::new_v4().to_string(),
            name: DEFAULT_ROUTER_GROUP_NAME.to_string(),
            group_type: ROUTER_GROUP_TYPE_TCP.to_string(),
            reservable_ports: DEFAULT_RESERVABLE_PORTS.to_string(),
        }
    }

    /// Validate a fully-populated group (after any field-level merge).
    pub fn validate(&self) -> RoutingResult<()> {
        if self.guid.is_empty() {
            return Err(RoutingError::Invalid(
                "Router group guid cannot be empty".to_string(),
            ));
        }
        if self.name.is_empty() {
            return Err(RoutingError::Invalid(
                "Router group name cannot be empty".to_string(),
            ));
        }
        if self.group_type != ROUTER_GROUP_TYPE_TCP {
            return Err(RoutingError::Invalid(format!(
                "Router group type '{}' is not supported",
                self.group_type
            )));
        }
        ReservablePorts::parse(&self.reservable_ports)?;
        Ok(())
    }

    /// Field-level merge for save: only non-empty incoming fields
    /// overwrite the existing record.
    pub fn merge_from(&mut self, incoming: &RouterGroup) {
        if !incoming.name.is_empty() {
            self.name = incoming.name.clone();
        }
        if !incoming.reservable_ports.is_empty() {
            self.reservable_ports = incoming.reservable_ports.clone();
        }
        // group_type is immutable after creation; the store rejects a
        // differing non-empty incoming type before merging.
    }
}

/// A parsed, validated set of reservable port ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservablePorts {
    ranges: Vec<(u16, u16)>,
}

impl ReservablePorts {
    /// Parse an expression like `"1024-65535"` or `"6000-8000,9000"`.
    ///
    /// Ranges must be well-formed, lie within [1, 65535], and must not
    /// overlap one another.
    pub fn parse(expr: &str) -> RoutingResult<Self> {
        if expr.is_empty() {
            return Err(RoutingError::Invalid(
                "Reservable ports cannot be empty".to_string(),
            ));
        }

        let mut ranges = Vec::new();
        for item in expr.split(',') {
            let (start, end) = match item.split_once('-') {
                Some((start, end)) => (parse_port(start)?, parse_port(end)?),
                None => {
                    let port = parse_port(item)?;
                    (port, port)
                }
            };
            if start > end {
                return Err(RoutingError::Invalid(format!(
                    "Port range '{item}' ends before it starts"
                )));
            }
            ranges.push((start, end));
        }

        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[1].0 <= pair[0].1 {
                return Err(RoutingError::Invalid(format!(
                    "Overlapping port ranges {}-{} and {}-{}",
                    pair[0].0, pair[0].1, pair[1].0, pair[1].1
                )));
            }
        }

        Ok(Self { ranges })
    }

    /// Returns true if `port` falls in any reservable range.
    pub fn contains(&self, port: u16) -> bool {
        self.ranges
            .iter()
            .any(|&(start, end)| (start..=end).contains(&port))
    }
}

fn parse_port(s: &str) -> RoutingResult<u16> {
    let port: u16 = s
        .trim()
        .parse()
        .map_err(|_| RoutingError::Invalid(format!("'{s}' is not a valid port")))?;
    if port == 0 {
        return Err(RoutingError::Invalid(
            "Port must be between 1 and 65535".to_string(),
        ));
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_group_is_valid() {
        let group = RouterGroup::default_tcp();
        assert!(group.validate().is_ok());
        assert_eq!(group.name, "default-tcp");
        assert_eq!(group.group_type, "tcp");
        assert_eq!(group.reservable_ports, "1024-65535");
    }

    #[test]
    fn test_parse_single_range() {
        let ports = ReservablePorts::parse("1024-65535").unwrap();
        assert!(ports.contains(1024));
        assert!(ports.contains(65535));
        assert!(!ports.contains(1023));
    }

    #[test]
    fn test_parse_mixed_expression() {
        let ports = ReservablePorts::parse("6000-8000,9000").unwrap();
        assert!(ports.contains(6000));
        assert!(ports.contains(7500));
        assert!(ports.contains(9000));
        assert!(!ports.contains(8500));
        assert!(!ports.contains(9001));
    }

    #[test]
    fn test_rejects_malformed_expressions() {
        for bad in ["", "abc", "0-100", "8000-6000", "70000", "100-200,150-300"] {
            assert!(
                ReservablePorts::parse(bad).is_err(),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_merge_skips_empty_fields() {
        let mut existing = RouterGroup::default_tcp();
        let guid = existing.guid.clone();

        let incoming = RouterGroup {
            guid: guid.clone(),
            name: String::new(),
            group_type: String::new(),
            reservable_ports: "6000-8000".to_string(),
        };
        existing.merge_from(&incoming);

        assert_eq!(existing.guid, guid);
        assert_eq!(existing.name, "default-tcp");
        assert_eq!(existing.reservable_ports, "6000-8000");
    }

    #[test]
    fn test_type_serializes_as_type() {
        let json = serde_json::to_value(RouterGroup::default_tcp()).unwrap();
        assert_eq!(json.get("type").unwrap(), "tcp");
    }
}
