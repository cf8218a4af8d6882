//! Domain entities and events
//!
//! This module contains all domain-level types for routemux:
//! - Entities (Route, TcpRouteMapping, RouterGroup)
//! - Value objects (ModificationTag, ReservablePorts)
//! - Routing events (Create/Update/Delete/Expire)

mod event;
mod modification_tag;
mod route;
mod router_group;
mod tcp_route;

pub use event::{EventType, RoutingEvent};
pub use modification_tag::ModificationTag;
pub use route::Route;
pub use router_group::{RouterGroup, ReservablePorts, ROUTER_GROUP_TYPE_TCP};
pub use tcp_route::TcpRouteMapping;
