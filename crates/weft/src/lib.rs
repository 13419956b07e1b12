//! Reactive state replication over Loro documents.
//!
//! This crate provides:
//! - An observable node graph paired one-to-one with Loro containers
//! - A model registry with versioned migrations and `init`/`cleanup` hooks
//! - `ChangeObserver`: local mutations out as single deltas, remote deltas in
//! - Debounced single-slot persistence (`Store`, `MemoryStore`, `FileStore`)
//! - Cross-peer named mutex and liveness probes (`Coordinator`)
//! - `Context`/`Replica`: connect, disconnect, destroy and auto-reclaim
//!
//! ```ignore
//! let hub = MemoryHub::new();
//! let server = Context::authoritative(Arc::new(hub.join()), Arc::new(MemoryStore::new()), EngineConfig::default());
//! let todos = server
//!     .connect(Location::new("app", "todos", "main"), ConnectOptions::new().initial_value(json!({"count": 0})))
//!     .await?;
//! todos.transaction(|tx| {
//!     let root = tx.root()?;
//!     tx.set(root, "count", 5)
//! })?;
//! ```

pub mod config;
pub mod context;
pub mod coordination;
pub mod error;
pub mod graph;
pub mod location;
pub mod model;
pub mod observer;
pub mod persist;
pub mod replica;
#[cfg(feature = "telemetry")]
pub mod telemetry;
pub mod transport;
pub mod value;

pub use config::{EngineConfig, MissingModelPolicy};
pub use context::{Context, Group};
pub use coordination::Coordinator;
pub use error::{
    AttachError, BoxError, ConfigError, MigrationError, PersistenceError, ReplicaError, Result,
    TransportError, WeftError,
};
pub use graph::{Graph, NodeId, Slot};
pub use location::Location;
pub use model::{Model, ModelType, Registry, Versioner};
pub use observer::{ChangeObserver, Tx};
pub use persist::{FileStore, MemoryStore, Store};
pub use replica::{ConnectOptions, Initializer, Replica, ReplicaState};
pub use transport::{MemoryHub, MemoryTransport, PeerId, Transport, WireMessage};
pub use value::{Input, MODEL_KEY, Primitive, VERSION_KEY};

// Re-export Loro so consumers can name document types without a direct dependency
pub use loro;
