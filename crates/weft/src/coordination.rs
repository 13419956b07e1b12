//! Cross-peer named mutex and liveness probes.
//!
//! A claimant records the claim locally, then announces it with
//! `MutexStart`. Only peers holding their own claim on the same name
//! answer: a holder already performing always wins, otherwise the lower
//! peer id does. Losers wait for `MutexDone`, and probe the holder every
//! ping interval so a vanished holder cannot wedge them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use smol_str::SmolStr;
use tokio::sync::Notify;

use crate::config::EngineConfig;
use crate::transport::{MUTEX_TOPIC, PING_TOPIC, PeerId, Transport, WireMessage, handler};

#[derive(Debug, Clone)]
struct Claim {
    holder: PeerId,
    performing: bool,
    done: Arc<Notify>,
}

impl Claim {
    fn new(holder: PeerId, performing: bool) -> Self {
        Self {
            holder,
            performing,
            done: Arc::new(Notify::new()),
        }
    }
}

type Claims = Arc<DashMap<SmolStr, Claim>>;

/// Serializes named critical sections across every reachable peer.
#[derive(Clone)]
pub struct Coordinator {
    transport: Arc<dyn Transport>,
    claims: Claims,
    ping_interval: Duration,
    ping_timeout: Duration,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("peer", &self.transport.peer_id())
            .field("claims", &self.claims.len())
            .finish()
    }
}

/// Removes our claim even if the critical section is dropped midway.
struct ClaimGuard {
    claims: Claims,
    name: SmolStr,
    holder: PeerId,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Some((_, claim)) = self
            .claims
            .remove_if(&self.name, |_, claim| claim.holder == self.holder)
        {
            claim.done.notify_waiters();
        }
    }
}

impl Coordinator {
    /// Create a coordinator and register its protocol handlers on
    /// `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: &EngineConfig) -> Self {
        let coordinator = Self {
            transport,
            claims: Arc::new(DashMap::new()),
            ping_interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
        };
        coordinator.install();
        coordinator
    }

    pub fn peer_id(&self) -> PeerId {
        self.transport.peer_id()
    }

    fn install(&self) {
        let me = self.transport.peer_id();
        let claims = self.claims.clone();
        self.transport.on(
            MUTEX_TOPIC,
            handler(move |from, payload: Bytes| {
                let reply = handle_mutex(&claims, me, from, &payload);
                async move { reply }
            }),
        );
        self.transport.on(
            PING_TOPIC,
            handler(|_, payload: Bytes| async move {
                match WireMessage::from_bytes(&payload) {
                    Ok(WireMessage::Ping) => encode(&WireMessage::Pong),
                    _ => None,
                }
            }),
        );
    }

    /// Run `f` once no other peer is running a section with the same name.
    pub async fn mutex<F, T>(&self, name: &str, f: F) -> T
    where
        F: Future<Output = T>,
    {
        let me = self.transport.peer_id();
        let name = SmolStr::new(name);
        let guard = loop {
            if let Some(holder) = self.current_holder(&name) {
                self.wait_for(&name, holder).await;
                continue;
            }
            let claim = Claim::new(me, false);
            if self.claims.insert(name.clone(), claim).is_some() {
                // lost a local race with another task on this peer
                continue;
            }
            let guard = ClaimGuard {
                claims: self.claims.clone(),
                name: name.clone(),
                holder: me,
            };
            match self.announce(&name, me).await {
                Some(holder) => {
                    drop(guard);
                    self.broadcast(&WireMessage::MutexDone {
                        name: name.clone(),
                        holder: me,
                    })
                    .await;
                    tracing::debug!(mutex = %name, holder = %holder, "mutex busy, waiting");
                    self.record_remote(&name, holder);
                    self.wait_for(&name, holder).await;
                    // stagger retries so waiters do not all reclaim at once
                    let jitter = rand::rng().random_range(0..=10);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                }
                None => break guard,
            }
        };

        if let Some(mut claim) = self.claims.get_mut(&name) {
            claim.performing = true;
        }
        tracing::debug!(mutex = %name, "mutex acquired");
        let output = f.await;
        drop(guard);
        self.broadcast(&WireMessage::MutexDone {
            name: name.clone(),
            holder: me,
        })
        .await;
        output
    }

    /// Whether `peer` answers a ping within the configured timeout.
    pub async fn ping(&self, peer: PeerId) -> bool {
        let Some(payload) = encode(&WireMessage::Ping) else {
            return false;
        };
        let reply = tokio::time::timeout(
            self.ping_timeout,
            self.transport.send_to(peer, PING_TOPIC, payload),
        )
        .await;
        match reply {
            Ok(Ok(Some(bytes))) => matches!(WireMessage::from_bytes(&bytes), Ok(WireMessage::Pong)),
            Ok(Ok(None)) => false,
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer, error = %e, "ping failed");
                false
            }
            Err(_) => {
                tracing::debug!(peer = %peer, "ping timed out");
                false
            }
        }
    }

    fn current_holder(&self, name: &str) -> Option<PeerId> {
        self.claims.get(name).map(|claim| claim.holder)
    }

    fn record_remote(&self, name: &SmolStr, holder: PeerId) {
        self.claims
            .entry(name.clone())
            .or_insert_with(|| Claim::new(holder, true));
    }

    /// Announce our claim; returns the winning holder if it is not us.
    async fn announce(&self, name: &SmolStr, me: PeerId) -> Option<PeerId> {
        let payload = encode(&WireMessage::MutexStart {
            name: name.clone(),
            holder: me,
        })?;
        match self.transport.send(MUTEX_TOPIC, payload).await {
            Ok(Some(reply)) => match WireMessage::from_bytes(&reply) {
                Ok(WireMessage::MutexBusy { holder, .. }) if holder != me => Some(holder),
                _ => None,
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(mutex = %name, error = %e, "could not announce mutex claim");
                None
            }
        }
    }

    /// Wait until `holder` releases `name` or stops answering.
    async fn wait_for(&self, name: &SmolStr, holder: PeerId) {
        let me = self.transport.peer_id();
        loop {
            let Some(done) = self
                .claims
                .get(name)
                .filter(|claim| claim.holder == holder)
                .map(|claim| claim.done.clone())
            else {
                return;
            };
            let notified = done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.current_holder(name) != Some(holder) {
                return;
            }

            tokio::select! {
                _ = &mut notified => return,
                _ = tokio::time::sleep(self.ping_interval) => {}
            }

            if holder == me {
                continue;
            }
            if !self.ping(holder).await {
                tracing::warn!(mutex = %name, holder = %holder, "mutex holder unreachable, releasing");
                self.release_remote(name, holder);
                return;
            }
            if !self.still_holds(name, holder).await {
                self.release_remote(name, holder);
                return;
            }
        }
    }

    async fn still_holds(&self, name: &SmolStr, holder: PeerId) -> bool {
        let Some(payload) = encode(&WireMessage::MutexQuery { name: name.clone() }) else {
            return false;
        };
        match self.transport.send_to(holder, MUTEX_TOPIC, payload).await {
            Ok(Some(reply)) => matches!(
                WireMessage::from_bytes(&reply),
                Ok(WireMessage::MutexBusy { holder: h, .. }) if h == holder
            ),
            _ => false,
        }
    }

    fn release_remote(&self, name: &SmolStr, holder: PeerId) {
        if let Some((_, claim)) = self
            .claims
            .remove_if(name, |_, claim| claim.holder == holder)
        {
            claim.done.notify_waiters();
        }
    }

    async fn broadcast(&self, message: &WireMessage) {
        let Some(payload) = encode(message) else {
            return;
        };
        if let Err(e) = self.transport.send(MUTEX_TOPIC, payload).await {
            tracing::warn!(error = %e, "failed to broadcast mutex message");
        }
    }
}

fn encode(message: &WireMessage) -> Option<Bytes> {
    match message.to_bytes() {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode wire message");
            None
        }
    }
}

/// Answer one mutex protocol message on behalf of the local claims.
fn handle_mutex(claims: &Claims, me: PeerId, from: PeerId, payload: &[u8]) -> Option<Bytes> {
    let message = match WireMessage::from_bytes(payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(peer = %from, error = %e, "bad mutex message");
            return None;
        }
    };
    match message {
        WireMessage::MutexStart { name, holder } => {
            let claim = claims.get(&name)?;
            if claim.holder != me {
                return None;
            }
            // we win if already running, or on the lower id
            if claim.performing || me < holder {
                encode(&WireMessage::MutexBusy {
                    holder: me,
                    performing: claim.performing,
                })
            } else {
                None
            }
        }
        WireMessage::MutexQuery { name } => {
            let claim = claims.get(&name)?;
            (claim.holder == me).then(|| {
                encode(&WireMessage::MutexBusy {
                    holder: me,
                    performing: claim.performing,
                })
            })?
        }
        WireMessage::MutexDone { name, holder } => {
            if let Some((_, claim)) = claims.remove_if(&name, |_, claim| claim.holder == holder) {
                claim.done.notify_waiters();
            }
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryHub, MemoryTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> EngineConfig {
        EngineConfig {
            ping_interval: Duration::from_millis(100),
            ping_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        }
    }

    fn peer(hub: &MemoryHub) -> (Coordinator, Arc<MemoryTransport>) {
        let transport = Arc::new(hub.join());
        (Coordinator::new(transport.clone(), &config()), transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sections_never_overlap() {
        let hub = MemoryHub::new();
        let (a, _ta) = peer(&hub);
        let (b, _tb) = peer(&hub);
        let (c, _tc) = peer(&hub);

        let running = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let section = |coordinator: Coordinator| {
            let running = running.clone();
            let overlaps = overlaps.clone();
            let runs = runs.clone();
            async move {
                coordinator
                    .mutex("load/app/todos/main", async {
                        if running.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        runs.fetch_add(1, Ordering::SeqCst);
                    })
                    .await
            }
        };

        tokio::join!(
            section(a.clone()),
            section(b.clone()),
            section(c.clone()),
            section(a.clone())
        );

        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping() {
        let hub = MemoryHub::new();
        let (a, _ta) = peer(&hub);
        let (b, tb) = peer(&hub);

        assert!(a.ping(b.peer_id()).await);
        tb.leave();
        assert!(!a.ping(b.peer_id()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_holder_releases_waiter() {
        let hub = MemoryHub::new();
        let (a, ta) = peer(&hub);
        let (b, _tb) = peer(&hub);

        // a takes the mutex and never finishes
        let stuck = tokio::spawn({
            let a = a.clone();
            async move {
                a.mutex("m", std::future::pending::<()>()).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = tokio::spawn(async move { b.mutex("m", async { 42 }).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        ta.leave();
        let value = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, 42);
        stuck.abort();
    }
}
