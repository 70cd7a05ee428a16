//! keel-state — persistence layer for the Keel control plane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for tenancy records, workloads, domains, the deployment progress
//! log, and workflow step checkpoints.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{deployment_id}:{instance_id}`, `{workflow}/{step}`)
//! keep related records adjacent for prefix scans.
//!
//! Gateway routing configs live in a separate database
//! ([`RoutingStore`]) partitioned by region so the routing plane can be
//! replicated independently of the control-plane store.
//!
//! Both stores are `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod routing;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use routing::RoutingStore;
pub use store::{StateStore, StoreTxn};
pub use types::*;
