//! Routing events emitted by the storage back-ends.

use serde::{Deserialize, Serialize};

use super::{Route, TcpRouteMapping};

/// What happened to an entity.
///
/// `Expire` is distinguished internally so subscribers can tell a lapsed
/// lease from an explicit removal; the SSE wire format collapses both to
/// `Delete` (and `Create`/`Update` to `Upsert`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Create,
    Update,
    Delete,
    Expire,
}

impl EventType {
    /// The action name used on the SSE wire.
    pub fn wire_action(&self) -> &'static str {
        match self {
            EventType::Create | EventType::Update => "Upsert",
            EventType::Delete | EventType::Expire => "Delete",
        }
    }
}

/// A state change to a single route entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoutingEvent {
    Http {
        event_type: EventType,
        route: Route,
    },
    Tcp {
        event_type: EventType,
        mapping: TcpRouteMapping,
    },
}

impl RoutingEvent {
    pub fn http(event_type: EventType, route: Route) -> Self {
        RoutingEvent::Http { event_type, route }
    }

    pub fn tcp(event_type: EventType, mapping: TcpRouteMapping) -> Self {
        RoutingEvent::Tcp {
            event_type,
            mapping,
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            RoutingEvent::Http { event_type, .. } | RoutingEvent::Tcp { event_type, .. } => {
                *event_type
            }
        }
    }

    /// JSON of the entity the event carries.
    pub fn payload_json(&self) -> serde_json::Value {
        match self {
            RoutingEvent::Http { route, .. } => {
                serde_json::to_value(route).unwrap_or(serde_json::Value::Null)
            }
            RoutingEvent::Tcp { mapping, .. } => {
                serde_json::to_value(mapping).unwrap_or(serde_json::Value::Null)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_actions_collapse() {
        assert_eq!(EventType::Create.wire_action(), "Upsert");
        assert_eq!(EventType::Update.wire_action(), "Upsert");
        assert_eq!(EventType::Delete.wire_action(), "Delete");
        assert_eq!(EventType::Expire.wire_action(), "Delete");
    }

    #[test]
    fn test_payload_json_carries_entity() {
        let route = Route::new("a.b.c", 33, "1.1.1.1", "potato", "", 55);
        let event = RoutingEvent::http(EventType::Create, route);
        let payload = event.payload_json();
        assert_eq!(payload.get("route").unwrap(), "a.b.c");
        assert_eq!(payload.get("port").unwrap(), 33);
    }
}
