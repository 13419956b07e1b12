//! Topic-keyed peer transport.
//!
//! The engine only needs request/broadcast with an optional reply; any
//! network that can carry opaque bytes per topic can implement
//! [`Transport`]. [`MemoryHub`] connects peers inside one process.

mod memory;
mod messages;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

pub use memory::{MemoryHub, MemoryTransport};
pub use messages::{
    CONNECT_TOPIC, MUTEX_TOPIC, PING_TOPIC, WireMessage, doc_topic, status_topic, update_topic,
};

/// Identifies one peer on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(u64);

impl PeerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// A random id, for transports without their own addressing.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{:x}", self.0)
    }
}

/// Topic handler: receives the sender and payload, optionally replies.
pub type Handler = Arc<dyn Fn(PeerId, Bytes) -> BoxFuture<'static, Option<Bytes>> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(PeerId, Bytes) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Option<Bytes>> + Send + 'static,
{
    Arc::new(
        move |peer: PeerId, payload: Bytes| -> BoxFuture<'static, Option<Bytes>> {
            Box::pin(f(peer, payload))
        },
    )
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn peer_id(&self) -> PeerId;

    /// Deliver `payload` to every other peer handling `topic` and return
    /// the first reply, if any.
    async fn send(&self, topic: &str, payload: Bytes) -> Result<Option<Bytes>, TransportError>;

    /// Deliver `payload` to one peer only.
    ///
    /// Fails with [`TransportError::NoRoute`] if the peer is gone or does
    /// not handle `topic`.
    async fn send_to(
        &self,
        peer: PeerId,
        topic: &str,
        payload: Bytes,
    ) -> Result<Option<Bytes>, TransportError>;

    /// Register the handler for `topic`, replacing any previous one.
    fn on(&self, topic: &str, handler: Handler);

    fn off(&self, topic: &str);
}
