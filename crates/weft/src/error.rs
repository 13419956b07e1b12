//! Error types for the replication engine.

use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

/// Boxed error returned by user-supplied migrations and initializers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for weft operations.
#[derive(Debug, Error, Diagnostic)]
pub enum WeftError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Attach(#[from] AttachError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Replica(#[from] ReplicaError),
}

/// Errors raised while attaching values to the graph or mutating it.
#[derive(Debug, Error, Diagnostic)]
pub enum AttachError {
    #[error("unsupported value: {kind}")]
    #[diagnostic(
        code(attach::unsupported_value),
        help("only null, booleans, numbers, strings, arrays and objects can be attached")
    )]
    UnsupportedValue { kind: SmolStr },

    #[error("no model registered for discriminator {name:?}")]
    #[diagnostic(
        code(attach::missing_model),
        help("register the model on the Registry passed to connect, or set WEFT_MISSING_MODELS=allow")
    )]
    MissingModel { name: SmolStr },

    #[error("node {id} is not part of the graph")]
    #[diagnostic(code(attach::unknown_node))]
    UnknownNode { id: u64 },

    #[error("node {id} is not an object node")]
    #[diagnostic(code(attach::not_an_object))]
    NotAnObject { id: u64 },

    #[error("node {id} is not an array node")]
    #[diagnostic(code(attach::not_an_array))]
    NotAnArray { id: u64 },

    #[error("index {index} out of bounds for array of length {len}")]
    #[diagnostic(code(attach::index_out_of_bounds))]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("replication document rejected the mutation: {message}")]
    #[diagnostic(code(attach::document))]
    Document { message: String },
}

impl From<loro::LoroError> for AttachError {
    fn from(e: loro::LoroError) -> Self {
        AttachError::Document {
            message: e.to_string(),
        }
    }
}

/// A versioner step failed. Never recovered: a half-migrated instance must
/// not be persisted.
#[derive(Debug, Error, Diagnostic)]
#[error("migration to version {version} of {target} failed")]
#[diagnostic(code(model::migration))]
pub struct MigrationError {
    pub target: SmolStr,
    pub version: u32,
    #[source]
    pub source: BoxError,
}

/// Durable store errors.
#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("failed to read {key}")]
    #[diagnostic(code(persist::read))]
    Read {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to write {key}")]
    #[diagnostic(code(persist::write))]
    Write {
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("{part:?} is not usable as a storage path component")]
    #[diagnostic(
        code(persist::invalid_key),
        help("components must be non-empty and must not contain path separators or be `.`/`..`")
    )]
    InvalidKey { part: String },

    #[error("failed to (de)serialize payload for {key}")]
    #[diagnostic(code(persist::serialize))]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Transport errors.
#[derive(Debug, Error, Diagnostic)]
pub enum TransportError {
    #[error("no peer handles topic {topic}")]
    #[diagnostic(code(transport::no_route))]
    NoRoute { topic: String },

    #[error("transport closed")]
    #[diagnostic(code(transport::closed))]
    Closed,

    #[error("failed to encode message")]
    #[diagnostic(code(transport::encode))]
    Encode(#[source] postcard::Error),

    #[error("failed to decode message")]
    #[diagnostic(code(transport::decode))]
    Decode(#[source] postcard::Error),
}

/// Configuration errors.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid configuration value for {field}: {message}")]
    #[diagnostic(code(config::invalid))]
    Invalid { field: &'static str, message: String },
}

/// Replica lifecycle errors.
#[derive(Debug, Error, Diagnostic)]
pub enum ReplicaError {
    #[error("replica for {location} is not connected")]
    #[diagnostic(code(replica::not_connected))]
    NotConnected { location: String },

    #[error("replica for {location} was destroyed")]
    #[diagnostic(code(replica::destroyed))]
    Destroyed { location: String },

    #[error("failed to import document update: {message}")]
    #[diagnostic(code(replica::import))]
    Import { message: String },

    #[error("failed to export document: {message}")]
    #[diagnostic(code(replica::export))]
    Export { message: String },

    #[error("initializer failed")]
    #[diagnostic(code(replica::initial))]
    Initial(#[source] BoxError),
}

pub type Result<T> = std::result::Result<T, WeftError>;
