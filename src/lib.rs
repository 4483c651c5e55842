//! WolfHA - High-Availability Database Cluster
//!
//! Presents a cluster of independent, possibly heterogeneous database
//! backends as one logical database. Writes are replicated to every active
//! backend, reads are balanced across them, failed backends are isolated,
//! and a backend that fell behind is resynchronized before it rejoins.
//!
//! # Architecture
//!
//! A [`proxy::FanOutProxy`] runs each client statement against the active
//! set held by the [`state::BackendRegistry`]. Backend state only changes
//! under the cluster-wide topology lock from [`lock`], which cooperating
//! processes share through the group transport in [`network`]. The
//! [`sync::SyncEngine`] compares [`metadata`] snapshots captured through a
//! [`dialect`] and copies data before a backend is reactivated.
//!
//! # Features
//!
//! - Concurrent write fan-out with per-backend timeouts and isolation
//! - Read balancing (round-robin, weighted, random) or compare-all reads
//! - Full-copy, diff and passive synchronization strategies
//! - Coordinator-based distributed locks over TCP group messaging
//! - Persistent backend state across restarts
//! - HTTP API for management and SQL

pub mod api;
pub mod cluster;
pub mod config;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod group;
pub mod lb;
pub mod lock;
pub mod metadata;
pub mod network;
pub mod proxy;
pub mod state;
pub mod sync;

pub use cluster::DatabaseCluster;
pub use config::WolfHaConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{ClusterBuilder, DatabaseCluster};
    pub use crate::config::WolfHaConfig;
    pub use crate::error::{Error, Result};
    pub use crate::executor::{RowSet, Value};
    pub use crate::proxy::{AggregatedResult, Session, StatementResult};
    pub use crate::state::{BackendState, BackendStatus};
    pub use crate::sync::{SyncReport, SyncStrategy};
}
