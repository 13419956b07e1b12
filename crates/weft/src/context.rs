//! Process-wide entry point owning the transport, store and live replicas.
//!
//! A context built with a store is authoritative: it persists, connects
//! defined collections when satellites ask, and reclaims locations nobody
//! uses any more. A context without a store is a satellite.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use smol_str::SmolStr;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::coordination::Coordinator;
use crate::error::Result;
use crate::location::Location;
use crate::persist::Store;
use crate::observer::Tx;
use crate::replica::{ConnectOptions, Replica, ReplicaEnv, ReplicaState};
use crate::transport::{CONNECT_TOPIC, PeerId, Transport, WireMessage, handler};

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    env: ReplicaEnv,
    replicas: DashMap<Location, Replica>,
    /// Serializes connects per location so `connect` stays idempotent.
    connecting: DashMap<Location, Arc<tokio::sync::Mutex<()>>>,
    defined: DashMap<(SmolStr, SmolStr), ConnectOptions>,
    reclaimer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("peer", &self.peer_id())
            .field("authoritative", &self.is_authoritative())
            .field("replicas", &self.inner.replicas.len())
            .finish()
    }
}

impl Context {
    /// Authoritative context: persists to `store` and runs auto-reclaim.
    ///
    /// Must be called from within a tokio runtime.
    pub fn authoritative(
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
        config: EngineConfig,
    ) -> Self {
        let context = Self::build(transport, Some(store), config);
        context.install_connect_handler();
        context.start_reclaimer();
        context
    }

    /// Satellite context: no persistence, fetches state from peers.
    pub fn satellite(transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        Self::build(transport, None, config)
    }

    fn build(
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn Store>>,
        config: EngineConfig,
    ) -> Self {
        let coordinator = Coordinator::new(transport.clone(), &config);
        Self {
            inner: Arc::new(ContextInner {
                env: ReplicaEnv {
                    transport,
                    coordinator,
                    store,
                    config,
                },
                replicas: DashMap::new(),
                connecting: DashMap::new(),
                defined: DashMap::new(),
                reclaimer: Mutex::new(None),
            }),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.env.transport.peer_id()
    }

    pub fn is_authoritative(&self) -> bool {
        self.inner.env.store.is_some()
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.inner.env.coordinator
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.env.config
    }

    /// Options used when a satellite asks for a location in this
    /// collection. Connections made this way are reclaimable.
    pub fn define(
        &self,
        namespace: impl Into<SmolStr>,
        collection: impl Into<SmolStr>,
        options: ConnectOptions,
    ) {
        self.inner
            .defined
            .insert((namespace.into(), collection.into()), options.reclaim(true));
    }

    /// Connected replica for `location`, if any.
    pub fn replica(&self, location: &Location) -> Option<Replica> {
        self.inner
            .replicas
            .get(location)
            .map(|entry| entry.value().clone())
            .filter(|replica| replica.state() == ReplicaState::Connected)
    }

    /// Connect `location`, or return the replica already connected there.
    pub async fn connect(&self, location: Location, options: ConnectOptions) -> Result<Replica> {
        if let Some(replica) = self.replica(&location) {
            return Ok(replica);
        }
        let gate = self
            .inner
            .connecting
            .entry(location.clone())
            .or_default()
            .clone();
        let result = {
            let _gate = gate.lock().await;
            self.connect_gated(&location, options).await
        };
        // last one through the gate removes it
        self.inner
            .connecting
            .remove_if(&location, |_, entry| {
                Arc::ptr_eq(entry, &gate) && Arc::strong_count(entry) == 2
            });
        result
    }

    async fn connect_gated(&self, location: &Location, options: ConnectOptions) -> Result<Replica> {
        if let Some(replica) = self.replica(location) {
            return Ok(replica);
        }
        if !self.is_authoritative() {
            self.signal_connect(location).await;
        }
        let replica = Replica::connect(&self.inner.env, location.clone(), options).await?;
        self.inner.replicas.insert(location.clone(), replica.clone());
        Ok(replica)
    }

    /// Run `f` with mutations on any number of replicas grouped together.
    ///
    /// Each replica touched through the [`Group`] commits exactly once,
    /// when `f` returns, and its models are initialized only then. Other
    /// transactions on a touched replica made while the group is open
    /// join the group's commit.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Group) -> Result<R>) -> Result<R> {
        let mut group = Group::default();
        let result = f(&mut group);
        let closed = group.close();
        let value = result?;
        closed?;
        Ok(value)
    }

    /// Ask the authoritative side to bring `location` up first.
    async fn signal_connect(&self, location: &Location) {
        let Ok(request) = (WireMessage::Connect {
            location: location.clone(),
        })
        .to_bytes() else {
            return;
        };
        match self
            .inner
            .env
            .transport
            .send(CONNECT_TOPIC, Bytes::from(request))
            .await
        {
            Ok(Some(_)) => tracing::debug!(location = %location, "authoritative side connected"),
            Ok(None) => tracing::debug!(location = %location, "no authoritative side for location"),
            Err(e) => tracing::warn!(location = %location, error = %e, "connect signal failed"),
        }
    }

    pub async fn disconnect(&self, location: &Location) -> Result<()> {
        if let Some((_, replica)) = self.inner.replicas.remove(location) {
            replica.disconnect().await?;
        }
        Ok(())
    }

    /// Disconnect `location` and delete its durable payload.
    pub async fn destroy(&self, location: &Location) -> Result<()> {
        match self.inner.replicas.remove(location) {
            Some((_, replica)) => replica.destroy().await,
            None => {
                if let Some(store) = &self.inner.env.store {
                    store.delete(location).await?;
                }
                Ok(())
            }
        }
    }

    /// Destroy every location in a collection.
    pub async fn destroy_collection(&self, namespace: &str, collection: &str) -> Result<()> {
        let live: Vec<Location> = self
            .inner
            .replicas
            .iter()
            .filter(|entry| entry.key().namespace == namespace && entry.key().collection == collection)
            .map(|entry| entry.key().clone())
            .collect();
        for location in live {
            self.destroy(&location).await?;
        }
        if let Some(store) = &self.inner.env.store {
            store.delete_collection(namespace, collection).await?;
        }
        Ok(())
    }

    /// Collections with a stored payload under `namespace`.
    pub async fn list_collections(&self, namespace: &str) -> Result<Vec<SmolStr>> {
        match &self.inner.env.store {
            Some(store) => Ok(store.list_collections(namespace).await?),
            None => Ok(Vec::new()),
        }
    }

    /// Disconnect everything and stop background work.
    pub async fn shutdown(&self) -> Result<()> {
        let reclaimer = self
            .inner
            .reclaimer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reclaimer) = reclaimer {
            reclaimer.abort();
        }
        self.inner.env.transport.off(CONNECT_TOPIC);
        let live: Vec<Location> = self.inner.replicas.iter().map(|e| e.key().clone()).collect();
        for location in live {
            self.disconnect(&location).await?;
        }
        Ok(())
    }

    fn install_connect_handler(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.env.transport.on(
            CONNECT_TOPIC,
            handler(move |peer, payload: Bytes| {
                let weak = weak.clone();
                async move {
                    let inner = weak.upgrade()?;
                    let Ok(WireMessage::Connect { location }) = WireMessage::from_bytes(&payload)
                    else {
                        return None;
                    };
                    Context { inner }.answer_connect(peer, location).await
                }
            }),
        );
    }

    async fn answer_connect(&self, peer: PeerId, location: Location) -> Option<Bytes> {
        let options = self
            .inner
            .defined
            .get(&(location.namespace.clone(), location.collection.clone()))
            .map(|entry| entry.value().clone())?;
        tracing::debug!(location = %location, peer = %peer, "connecting on behalf of peer");
        if let Err(e) = self.connect(location.clone(), options).await {
            tracing::warn!(location = %location, error = %e, "connect on behalf of peer failed");
            return None;
        }
        WireMessage::Connected.to_bytes().ok().map(Bytes::from)
    }

    fn start_reclaimer(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.env.config.reclaim_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !reclaim_once(&weak).await {
                    break;
                }
            }
        });
        *self
            .inner
            .reclaimer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }
}

/// One auto-reclaim pass. Returns false once the context is gone.
async fn reclaim_once(weak: &Weak<ContextInner>) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    let context = Context { inner };
    let candidates: Vec<Replica> = context
        .inner
        .replicas
        .iter()
        .map(|entry| entry.value().clone())
        .filter(|replica| replica.is_reclaimable() && replica.state() == ReplicaState::Connected)
        .collect();

    for replica in candidates {
        if replica.has_consumers().await {
            continue;
        }
        let location = replica.location().clone();
        tracing::debug!(location = %location, "no consumers left, reclaiming");
        metrics::counter!("weft_reclaimed_total").increment(1);
        if let Err(e) = context.disconnect(&location).await {
            tracing::warn!(location = %location, error = %e, "reclaim failed");
        }
    }
    true
}

/// Mutations spanning several replicas, see [`Context::transaction`].
#[derive(Debug, Default)]
pub struct Group {
    touched: Vec<Replica>,
}

impl Group {
    /// Mutate `replica` as part of the group.
    pub fn transaction<R>(
        &mut self,
        replica: &Replica,
        f: impl FnOnce(&mut Tx<'_>) -> Result<R>,
    ) -> Result<R> {
        if !self.touched.iter().any(|r| r.same_as(replica)) {
            replica.open_group()?;
            self.touched.push(replica.clone());
        }
        replica.transaction(f)
    }

    /// Close every replica, in the order they were first touched.
    fn close(&mut self) -> Result<()> {
        let mut result = Ok(());
        for replica in self.touched.drain(..) {
            if let Err(e) = replica.close_group() {
                tracing::warn!(location = %replica.location(), error = %e, "closing grouped transaction failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "group dropped with a failing replica");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;
    use crate::transport::MemoryHub;

    #[tokio::test(start_paused = true)]
    async fn test_connect_gates_are_released() {
        let hub = MemoryHub::new();
        let context = Context::authoritative(
            Arc::new(hub.join()),
            Arc::new(MemoryStore::new()),
            EngineConfig::default(),
        );
        let location = Location::new("app", "todos", "main");
        let (a, b) = tokio::join!(
            context.connect(location.clone(), ConnectOptions::new()),
            context.connect(location.clone(), ConnectOptions::new()),
        );
        assert!(a.unwrap().same_as(&b.unwrap()));
        assert!(context.inner.connecting.is_empty());

        context.connect(location, ConnectOptions::new()).await.unwrap();
        assert!(context.inner.connecting.is_empty());
        context.shutdown().await.unwrap();
    }
}
