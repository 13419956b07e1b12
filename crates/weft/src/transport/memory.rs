use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use smol_str::SmolStr;

use super::{Handler, PeerId, Transport};
use crate::error::TransportError;

type Handlers = Arc<DashMap<SmolStr, Handler>>;

/// In-process switchboard connecting [`MemoryTransport`] endpoints.
///
/// Handlers run on the sender's task, so a `send` completes once every
/// recipient has handled the message.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    peers: DashMap<PeerId, Handlers>,
    next: AtomicU64,
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHub")
            .field("peers", &self.peers())
            .finish()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new endpoint. Peer ids are handed out in join order.
    pub fn join(&self) -> MemoryTransport {
        let peer = PeerId::new(self.inner.next.fetch_add(1, Ordering::SeqCst) + 1);
        let handlers: Handlers = Arc::new(DashMap::new());
        self.inner.peers.insert(peer, handlers.clone());
        tracing::debug!(peer = %peer, "joined memory hub");
        MemoryTransport {
            hub: self.clone(),
            peer,
            handlers,
        }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inner.peers.iter().map(|entry| *entry.key()).collect();
        peers.sort();
        peers
    }

    fn routes(&self, topic: &str, except: PeerId) -> Vec<Handler> {
        self.inner
            .peers
            .iter()
            .filter(|entry| *entry.key() != except)
            .filter_map(|entry| entry.value().get(topic).map(|h| h.value().clone()))
            .collect()
    }

    fn route(&self, peer: PeerId, topic: &str) -> Option<Handler> {
        self.inner
            .peers
            .get(&peer)
            .and_then(|handlers| handlers.get(topic).map(|h| h.value().clone()))
    }
}

/// One endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    hub: MemoryHub,
    peer: PeerId,
    handlers: Handlers,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("peer", &self.peer)
            .field("topics", &self.handlers.len())
            .finish()
    }
}

impl MemoryTransport {
    /// Drop off the hub without telling anyone, like a crashed peer.
    pub fn leave(&self) {
        self.hub.inner.peers.remove(&self.peer);
        tracing::debug!(peer = %self.peer, "left memory hub");
    }

    fn is_member(&self) -> bool {
        self.hub.inner.peers.contains_key(&self.peer)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn peer_id(&self) -> PeerId {
        self.peer
    }

    async fn send(&self, topic: &str, payload: Bytes) -> Result<Option<Bytes>, TransportError> {
        if !self.is_member() {
            return Err(TransportError::Closed);
        }
        let routes = self.hub.routes(topic, self.peer);
        let replies = join_all(routes.iter().map(|h| h(self.peer, payload.clone()))).await;
        Ok(replies.into_iter().flatten().next())
    }

    async fn send_to(
        &self,
        peer: PeerId,
        topic: &str,
        payload: Bytes,
    ) -> Result<Option<Bytes>, TransportError> {
        if !self.is_member() {
            return Err(TransportError::Closed);
        }
        let handler = self.hub.route(peer, topic).ok_or_else(|| TransportError::NoRoute {
            topic: topic.to_string(),
        })?;
        Ok(handler(self.peer, payload).await)
    }

    fn on(&self, topic: &str, handler: Handler) {
        self.handlers.insert(SmolStr::new(topic), handler);
    }

    fn off(&self, topic: &str) {
        self.handlers.remove(topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::handler;

    #[tokio::test]
    async fn test_send_reaches_other_peers_only() {
        let hub = MemoryHub::new();
        let a = hub.join();
        let b = hub.join();
        let c = hub.join();

        for t in [&a, &b, &c] {
            let me = t.peer_id();
            t.on(
                "echo",
                handler(move |_, payload: Bytes| async move {
                    let mut reply = payload.to_vec();
                    reply.push(me.raw() as u8);
                    Some(Bytes::from(reply))
                }),
            );
        }

        let reply = a.send("echo", Bytes::from_static(b"x")).await.unwrap().unwrap();
        // never delivered back to the sender
        assert!(reply.as_ref() == b"x\x02" || reply.as_ref() == b"x\x03");

        let reply = a
            .send_to(c.peer_id(), "echo", Bytes::from_static(b"y"))
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some(&b"y\x03"[..]));
    }

    #[tokio::test]
    async fn test_departed_peer_is_unroutable() {
        let hub = MemoryHub::new();
        let a = hub.join();
        let b = hub.join();
        b.on("ping", handler(|_, _| async { Some(Bytes::new()) }));

        b.leave();
        let err = a
            .send_to(b.peer_id(), "ping", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoRoute { .. }));
        assert!(a.send("ping", Bytes::new()).await.unwrap().is_none());
        assert!(matches!(
            b.send("ping", Bytes::new()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_off_removes_handler() {
        let hub = MemoryHub::new();
        let a = hub.join();
        let b = hub.join();
        b.on("t", handler(|_, _| async { Some(Bytes::from_static(b"ok")) }));
        assert!(a.send("t", Bytes::new()).await.unwrap().is_some());
        b.off("t");
        assert!(a.send("t", Bytes::new()).await.unwrap().is_none());
    }
}
