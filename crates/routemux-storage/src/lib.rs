//! # routemux Storage
//!
//! Two interchangeable implementations of the
//! [`RoutingStore`](routemux_core::RoutingStore) contract:
//!
//! - [`sql::SqlRoutingStore`] - SQLite-backed, with a background sweeper
//!   that materialises expiry as delete-and-emit
//! - [`kv::KvRoutingStore`] - an embedded hierarchical key-value store
//!   whose TTL leases and subtree watches make expiry native
//!
//! Plus the watch orchestration shared by both
//! ([`watch::open_watch`]).

pub mod cache;
pub mod database;
pub(crate) mod group;
pub mod kv;
pub mod sql;
pub mod watch;

pub use database::{Database, StoreInitError};
pub use kv::KvRoutingStore;
pub use sql::SqlRoutingStore;
pub use watch::open_watch;
