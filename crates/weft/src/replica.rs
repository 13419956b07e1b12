//! One replicated state at one location, and its connection lifecycle.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::coordination::Coordinator;
use crate::error::{BoxError, ReplicaError, Result};
use crate::graph::{Graph, NodeId};
use crate::location::Location;
use crate::model::{Model, Registry, Versioner};
use crate::observer::{ChangeObserver, Tx};
use crate::persist::{Saver, Store};
use crate::transport::{Transport, WireMessage, doc_topic, handler, status_topic, update_topic};
use crate::value::Input;

/// Connection state of a [`Replica`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Destroyed,
}

/// Produces the initial value for a state that has never been saved.
pub type Initializer = Arc<dyn Fn() -> std::result::Result<Input, BoxError> + Send + Sync>;

/// Per-connection settings.
#[derive(Clone, Default)]
pub struct ConnectOptions {
    pub initial: Option<Initializer>,
    pub registry: Registry,
    /// State-level versioner, used when the root is not itself a model.
    pub versioner: Option<Versioner>,
    /// Let the authoritative side disconnect this location once no peer
    /// reports using it.
    pub reclaim: bool,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("initial", &self.initial.is_some())
            .field("registry", &self.registry)
            .field("versioner", &self.versioner)
            .field("reclaim", &self.reclaim)
            .finish()
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial<F>(mut self, initial: F) -> Self
    where
        F: Fn() -> std::result::Result<Input, BoxError> + Send + Sync + 'static,
    {
        self.initial = Some(Arc::new(initial));
        self
    }

    /// Initialize an empty state with a fixed plain value.
    pub fn initial_value(self, value: Value) -> Self {
        self.initial(move || Ok(Input::Json(value.clone())))
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn versioner(mut self, versioner: Versioner) -> Self {
        self.versioner = Some(versioner);
        self
    }

    pub fn reclaim(mut self, reclaim: bool) -> Self {
        self.reclaim = reclaim;
        self
    }
}

/// Shared services a replica runs on.
#[derive(Clone)]
pub(crate) struct ReplicaEnv {
    pub transport: Arc<dyn Transport>,
    pub coordinator: Coordinator,
    pub store: Option<Arc<dyn Store>>,
    pub config: EngineConfig,
}

/// Handle to a connected state. Cheap to clone.
#[derive(Clone)]
pub struct Replica {
    inner: Arc<ReplicaInner>,
}

struct ReplicaInner {
    location: Location,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn Store>>,
    reclaim: bool,
    state: Mutex<ReplicaState>,
    observer: Mutex<Option<ChangeObserver>>,
    saver: Mutex<Option<Saver>>,
    broadcaster: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("location", &self.inner.location)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Replica {
    /// Connect `location`: load or fetch its document under the load
    /// mutex, then start broadcasting and applying updates.
    pub(crate) async fn connect(
        env: &ReplicaEnv,
        location: Location,
        options: ConnectOptions,
    ) -> Result<Replica> {
        let ConnectOptions {
            initial,
            registry,
            versioner,
            reclaim,
        } = options;

        let mut observer = ChangeObserver::new(Graph::new(
            Arc::new(registry),
            env.config.missing_models,
        ));
        let (outgoing, updates) = mpsc::unbounded_channel();
        observer.set_outgoing(Some(outgoing));

        let replica = Replica {
            inner: Arc::new(ReplicaInner {
                location: location.clone(),
                transport: env.transport.clone(),
                store: env.store.clone(),
                reclaim,
                state: Mutex::new(ReplicaState::Connecting),
                observer: Mutex::new(Some(observer)),
                saver: Mutex::new(None),
                broadcaster: Mutex::new(None),
            }),
        };
        tracing::debug!(location = %location, "connecting");

        if let Some(store) = &env.store {
            let weak = Arc::downgrade(&replica.inner);
            let saver = Saver::new(
                location.clone(),
                store.clone(),
                env.config.save_debounce,
                Arc::new(move || snapshot_of(&weak)),
            );
            let hook = saver.clone();
            if let Some(observer) = lock(&replica.inner.observer).as_mut() {
                observer.set_on_commit(Some(Box::new(move || hook.schedule())));
            }
            *lock(&replica.inner.saver) = Some(saver);
        }

        let broadcaster = tokio::spawn(broadcast_updates(
            env.transport.clone(),
            update_topic(&location),
            updates,
        ));
        *lock(&replica.inner.broadcaster) = Some(broadcaster);

        // updates arriving before the load lands go straight into the
        // document and are picked up by hydration
        replica.install_update_handler();

        let load_mutex = format!("load/{}", location.id());
        let loaded = env
            .coordinator
            .mutex(&load_mutex, replica.load(env, initial, versioner))
            .await;
        if let Err(e) = loaded {
            tracing::warn!(location = %location, error = %e, "connect failed");
            replica.shutdown().await;
            *lock(&replica.inner.state) = ReplicaState::Disconnected;
            return Err(e);
        }

        replica.install_query_handlers();
        *lock(&replica.inner.state) = ReplicaState::Connected;
        tracing::debug!(location = %location, "connected");
        Ok(replica)
    }

    async fn load(
        &self,
        env: &ReplicaEnv,
        initial: Option<Initializer>,
        versioner: Option<Versioner>,
    ) -> Result<()> {
        let fetched = match self.fetch_from_peers().await {
            Some(snapshot) => {
                self.with_observer(|obs| obs.import(&snapshot))?;
                true
            }
            None => false,
        };

        let empty = self.with_observer(|obs| Ok(obs.is_empty()))?;
        let stored = match (&env.store, fetched || !empty) {
            (Some(store), false) => store.get(&self.inner.location).await?,
            _ => None,
        };

        self.with_observer(|obs| {
            if fetched || !obs.is_empty() {
                obs.hydrate_root()?;
                if let Some(versioner) = &versioner {
                    obs.version_state(versioner, false)?;
                }
            } else if let Some(payload) = stored {
                tracing::debug!(location = %self.inner.location, "loaded from store");
                obs.attach_root(Input::Json(payload))?;
                if let Some(versioner) = &versioner {
                    obs.version_state(versioner, false)?;
                }
            } else {
                let value = match &initial {
                    Some(initial) => initial().map_err(ReplicaError::Initial)?,
                    None => Input::Json(Value::Object(Map::new())),
                };
                obs.attach_root(value)?;
                if let Some(versioner) = &versioner {
                    obs.version_state(versioner, true)?;
                }
            }
            Ok(())
        })
    }

    /// Ask peers already holding this location for their whole document.
    async fn fetch_from_peers(&self) -> Option<Vec<u8>> {
        let request = WireMessage::GetDoc.to_bytes().ok()?;
        let topic = doc_topic(&self.inner.location);
        match self.inner.transport.send(&topic, Bytes::from(request)).await {
            Ok(Some(reply)) => match WireMessage::from_bytes(&reply) {
                Ok(WireMessage::Doc { data }) => data,
                Ok(other) => {
                    tracing::warn!(?other, "unexpected reply to document request");
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable document reply");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(location = %self.inner.location, error = %e, "document request failed");
                None
            }
        }
    }

    fn install_update_handler(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.transport.on(
            &update_topic(&self.inner.location),
            handler(move |peer, payload: Bytes| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply_update(peer, &payload);
                }
                async { None }
            }),
        );
    }

    fn install_query_handlers(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.transport.on(
            &doc_topic(&self.inner.location),
            handler(move |_, payload: Bytes| {
                let reply = weak.upgrade().and_then(|inner| inner.answer_doc(&payload));
                async move { reply }
            }),
        );

        let weak = Arc::downgrade(&self.inner);
        self.inner.transport.on(
            &status_topic(&self.inner.location),
            handler(move |_, payload: Bytes| {
                let reply = weak.upgrade().and_then(|inner| inner.answer_status(&payload));
                async move { reply }
            }),
        );
    }

    fn remove_handlers(&self) {
        let location = &self.inner.location;
        self.inner.transport.off(&update_topic(location));
        self.inner.transport.off(&doc_topic(location));
        self.inner.transport.off(&status_topic(location));
    }

    fn with_observer<R>(&self, f: impl FnOnce(&mut ChangeObserver) -> Result<R>) -> Result<R> {
        let mut guard = lock(&self.inner.observer);
        let observer = guard.as_mut().ok_or_else(|| ReplicaError::NotConnected {
            location: self.inner.location.id(),
        })?;
        f(observer)
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            ReplicaState::Connected => Ok(()),
            ReplicaState::Destroyed => Err(ReplicaError::Destroyed {
                location: self.inner.location.id(),
            }
            .into()),
            _ => Err(ReplicaError::NotConnected {
                location: self.inner.location.id(),
            }
            .into()),
        }
    }

    pub fn location(&self) -> &Location {
        &self.inner.location
    }

    pub fn state(&self) -> ReplicaState {
        *lock(&self.inner.state)
    }

    pub(crate) fn is_reclaimable(&self) -> bool {
        self.inner.reclaim
    }

    /// Run `f` as one mutation; everything it changes reaches peers as a
    /// single delta.
    ///
    /// The replica stays locked while `f` and any model `init` hooks run.
    /// Calling back into this replica (`read`, `snapshot`, `transaction`,
    /// ...) from inside `f` deadlocks; use the `Tx` instead.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<R>) -> Result<R> {
        self.ensure_connected()?;
        self.with_observer(|obs| obs.transaction(f))
    }

    /// Hold commits open until the matching [`Replica::close_group`].
    pub(crate) fn open_group(&self) -> Result<()> {
        self.ensure_connected()?;
        self.with_observer(|obs| {
            obs.begin();
            Ok(())
        })
    }

    /// Close a level opened by [`Replica::open_group`]; the outermost close
    /// runs model lifecycles and commits.
    pub(crate) fn close_group(&self) -> Result<()> {
        self.with_observer(|obs| obs.end())
    }

    pub(crate) fn same_as(&self, other: &Replica) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read the graph without mutating it.
    pub fn read<R>(&self, f: impl FnOnce(&ChangeObserver) -> R) -> Result<R> {
        self.ensure_connected()?;
        self.with_observer(|obs| Ok(f(obs)))
    }

    pub fn root(&self) -> Result<NodeId> {
        self.read(|obs| obs.root())?.ok_or_else(|| {
            ReplicaError::NotConnected {
                location: self.inner.location.id(),
            }
            .into()
        })
    }

    /// The whole state as plain data.
    pub fn snapshot(&self) -> Result<Value> {
        self.read(ChangeObserver::snapshot)
    }

    /// Typed access to the model bound to `node`, if it is a `T`.
    pub fn with_model<T: Model, R>(&self, node: NodeId, f: impl FnOnce(&T) -> R) -> Result<Option<R>> {
        self.read(|obs| obs.model::<T>(node).map(f))
    }

    /// Full document snapshot bytes.
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        self.with_observer(|obs| obs.export_snapshot())
    }

    /// Persist the current state now instead of waiting for the debounce.
    pub async fn save(&self) -> Result<()> {
        self.ensure_connected()?;
        let saver = lock(&self.inner.saver).clone();
        if let Some(saver) = saver {
            saver.save().await;
        }
        Ok(())
    }

    /// Stop broadcasting, flush pending persistence and release the graph.
    /// Disconnecting a replica that is not connected is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if *state != ReplicaState::Connected {
                return Ok(());
            }
            *state = ReplicaState::Disconnecting;
        }
        tracing::debug!(location = %self.inner.location, "disconnecting");
        self.shutdown().await;
        *lock(&self.inner.state) = ReplicaState::Disconnected;
        tracing::debug!(location = %self.inner.location, "disconnected");
        Ok(())
    }

    async fn shutdown(&self) {
        self.remove_handlers();
        // dropping the sender lets the broadcaster drain and exit
        if let Some(observer) = lock(&self.inner.observer).as_mut() {
            observer.set_outgoing(None);
        }
        let broadcaster = lock(&self.inner.broadcaster).take();
        if let Some(broadcaster) = broadcaster {
            if let Err(e) = broadcaster.await {
                tracing::warn!(error = %e, "broadcaster task failed");
            }
        }
        let saver = lock(&self.inner.saver).take();
        if let Some(saver) = saver {
            saver.flush().await;
            saver.close().await;
        }
        let observer = lock(&self.inner.observer).take();
        if let Some(mut observer) = observer {
            observer.teardown();
        }
    }

    /// Disconnect, then remove the durable payload.
    pub async fn destroy(&self) -> Result<()> {
        self.disconnect().await?;
        if let Some(store) = &self.inner.store {
            store.delete(&self.inner.location).await?;
        }
        *lock(&self.inner.state) = ReplicaState::Destroyed;
        tracing::debug!(location = %self.inner.location, "destroyed");
        Ok(())
    }

    /// Whether any other peer reports this location as connected.
    pub(crate) async fn has_consumers(&self) -> bool {
        let Ok(request) = WireMessage::Status.to_bytes() else {
            return false;
        };
        let topic = status_topic(&self.inner.location);
        match self.inner.transport.send(&topic, Bytes::from(request)).await {
            Ok(Some(reply)) => matches!(
                WireMessage::from_bytes(&reply),
                Ok(WireMessage::StatusReply { connected: true })
            ),
            _ => false,
        }
    }
}

impl ReplicaInner {
    fn apply_update(&self, peer: crate::transport::PeerId, payload: &[u8]) {
        let data = match WireMessage::from_bytes(payload) {
            Ok(WireMessage::Update { data }) => data,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "undecodable update");
                return;
            }
        };
        let mut observer = lock(&self.observer);
        let Some(observer) = observer.as_mut() else {
            return;
        };
        if let Err(e) = observer.import(&data) {
            tracing::error!(location = %self.location, peer = %peer, error = %e, "failed to apply update");
        }
    }

    fn answer_doc(&self, payload: &[u8]) -> Option<Bytes> {
        if !matches!(WireMessage::from_bytes(payload), Ok(WireMessage::GetDoc)) {
            return None;
        }
        if *lock(&self.state) != ReplicaState::Connected {
            return None;
        }
        let data = lock(&self.observer).as_ref()?.export_snapshot().ok()?;
        let reply = WireMessage::Doc { data: Some(data) }.to_bytes().ok()?;
        Some(Bytes::from(reply))
    }

    fn answer_status(&self, payload: &[u8]) -> Option<Bytes> {
        if !matches!(WireMessage::from_bytes(payload), Ok(WireMessage::Status)) {
            return None;
        }
        let connected = *lock(&self.state) == ReplicaState::Connected;
        let reply = WireMessage::StatusReply { connected }.to_bytes().ok()?;
        connected.then(|| Bytes::from(reply))
    }
}

fn snapshot_of(inner: &Weak<ReplicaInner>) -> Option<Value> {
    let inner = inner.upgrade()?;
    let observer = lock(&inner.observer);
    let observer = observer.as_ref()?;
    observer.root().map(|_| observer.snapshot())
}

/// Forward committed local deltas to peers, in commit order.
async fn broadcast_updates(
    transport: Arc<dyn Transport>,
    topic: String,
    mut updates: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(update) = updates.recv().await {
        let message = match (WireMessage::Update {
            data: update.to_vec(),
        })
        .to_bytes()
        {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode update");
                continue;
            }
        };
        if let Err(e) = transport.send(&topic, Bytes::from(message)).await {
            tracing::error!(topic = %topic, error = %e, "failed to broadcast update");
        }
    }
}
