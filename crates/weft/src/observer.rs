//! Change observer: keeps the node graph and the Loro document in step.
//!
//! Local mutations go through [`Tx`], which attaches new values (writing
//! their containers into the document), detaches old ones and commits the
//! document once per outermost mutation. Remote updates are imported into
//! the document; the resulting diff events are queued by a root
//! subscription and replayed onto the graph with mirroring switched off.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use loro::event::{Diff, DiffEvent, ListDiffItem};
use loro::{
    ContainerID, EventTriggerKind, ExportMode, LoroDoc, LoroMap, Subscription, ValueOrContainer,
    VersionVector,
};
use serde_json::{Map, Value};
use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::error::{AttachError, ReplicaError, Result};
use crate::graph::{Children, Graph, NodeId, Plan, RNode, Slot, Target};
use crate::model::{AsAny, Model, Versioner, recorded_version};
use crate::value::{Input, VERSION_KEY};

/// Name of the document's root map.
pub(crate) const ROOT_CONTAINER: &str = "state";

/// One container's worth of an imported diff, copied out of the event.
pub(crate) struct RemoteChange {
    target: ContainerID,
    delta: RemoteDelta,
}

enum RemoteDelta {
    Map(Vec<(SmolStr, Option<ValueOrContainer>)>),
    List(Vec<ListRun>),
}

enum ListRun {
    Retain(usize),
    Delete(usize),
    Insert(Vec<ValueOrContainer>),
}

impl RemoteChange {
    fn from_event(event: &DiffEvent<'_>) -> Vec<RemoteChange> {
        event
            .events
            .iter()
            .filter_map(|container| {
                let delta = match &container.diff {
                    Diff::Map(map) => RemoteDelta::Map(
                        map.updated
                            .iter()
                            .map(|(key, value)| (SmolStr::new(key.as_ref()), value.clone()))
                            .collect(),
                    ),
                    Diff::List(items) => RemoteDelta::List(
                        items
                            .iter()
                            .map(|item| match item {
                                ListDiffItem::Retain { retain } => ListRun::Retain(*retain),
                                ListDiffItem::Delete { delete } => ListRun::Delete(*delete),
                                ListDiffItem::Insert { insert, .. } => {
                                    ListRun::Insert(insert.clone())
                                }
                            })
                            .collect(),
                    ),
                    _ => return None,
                };
                Some(RemoteChange {
                    target: container.target.clone(),
                    delta,
                })
            })
            .collect()
    }
}

type RemoteQueue = Arc<Mutex<Vec<RemoteChange>>>;

/// A value on its way into an object key or array position.
enum Prepared {
    /// Validated local input; materializing it writes the document.
    Local(Plan),
    /// Already present in the document; only the graph side is built.
    Remote(ValueOrContainer),
}

/// Callback run after every committed change, local or remote.
pub(crate) type CommitHook = Box<dyn Fn() + Send + Sync>;

/// Owns one replica's document and graph.
pub struct ChangeObserver {
    doc: LoroDoc,
    graph: Graph,
    root: Option<NodeId>,
    depth: usize,
    applying_remote: bool,
    flushing: bool,
    /// Containers hydrated during the current import batch.
    batch_hydrated: HashSet<ContainerID>,
    broadcast_from: VersionVector,
    outgoing: Option<mpsc::UnboundedSender<Bytes>>,
    on_commit: Option<CommitHook>,
    remote: RemoteQueue,
    _subscription: Subscription,
}

impl fmt::Debug for ChangeObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeObserver")
            .field("root", &self.root)
            .field("depth", &self.depth)
            .field("graph", &self.graph)
            .finish()
    }
}

impl ChangeObserver {
    pub(crate) fn new(graph: Graph) -> Self {
        let doc = LoroDoc::new();
        let remote: RemoteQueue = Arc::new(Mutex::new(Vec::new()));
        let queue = remote.clone();
        let subscription = doc.subscribe_root(Arc::new(move |event: DiffEvent| {
            // local commits are already reflected in the graph
            if !matches!(event.triggered_by, EventTriggerKind::Import) {
                return;
            }
            let changes = RemoteChange::from_event(&event);
            queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(changes);
        }));
        let broadcast_from = doc.oplog_vv();

        Self {
            doc,
            graph,
            root: None,
            depth: 0,
            applying_remote: false,
            flushing: false,
            batch_hydrated: HashSet::new(),
            broadcast_from,
            outgoing: None,
            on_commit: None,
            remote,
            _subscription: subscription,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub(crate) fn doc(&self) -> &LoroDoc {
        &self.doc
    }

    pub(crate) fn set_outgoing(&mut self, outgoing: Option<mpsc::UnboundedSender<Bytes>>) {
        self.outgoing = outgoing;
    }

    pub(crate) fn set_on_commit(&mut self, hook: Option<CommitHook>) {
        self.on_commit = hook;
    }

    fn root_map(&self) -> LoroMap {
        self.doc.get_map(ROOT_CONTAINER)
    }

    /// Whether the document holds no state yet.
    pub(crate) fn is_empty(&self) -> bool {
        self.root_map().is_empty()
    }

    /// Plain-data copy of the whole state.
    pub fn snapshot(&self) -> Value {
        match self.root {
            Some(root) => self.graph.to_json(root),
            None => Value::Null,
        }
    }

    /// Full document snapshot, suitable for handing to a joining peer.
    pub(crate) fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| {
                ReplicaError::Export {
                    message: e.to_string(),
                }
                .into()
            })
    }

    // ------------------------------------------------------------------
    // Mutation depth
    // ------------------------------------------------------------------

    pub(crate) fn begin(&mut self) {
        self.depth += 1;
    }

    /// Close one mutation level. The outermost close versions and hydrates
    /// queued models, runs cleanups, and commits the document once.
    pub(crate) fn end(&mut self) -> Result<()> {
        if self.depth > 1 || self.flushing {
            self.depth -= 1;
            return Ok(());
        }
        self.flushing = true;
        let result = self.flush_lifecycle();
        self.flushing = false;
        self.depth -= 1;
        self.commit();
        result
    }

    /// Run a closure as one mutation: every change inside it lands in a
    /// single commit and therefore a single outgoing delta.
    pub fn transaction<R>(&mut self, f: impl FnOnce(&mut Tx<'_>) -> Result<R>) -> Result<R> {
        self.begin();
        let result = f(&mut Tx { obs: self });
        let end = self.end();
        let value = result?;
        end?;
        Ok(value)
    }

    fn commit(&mut self) {
        self.doc.commit();
        let version = self.doc.oplog_vv();
        if version == self.broadcast_from {
            return;
        }
        let update = self.doc.export(ExportMode::Updates {
            from: Cow::Owned(self.broadcast_from.clone()),
        });
        match update {
            Ok(update) => {
                self.broadcast_from = version;
                tracing::trace!(bytes = update.len(), "local change committed");
                if let Some(outgoing) = &self.outgoing {
                    metrics::counter!("weft_deltas_sent_total").increment(1);
                    if outgoing.send(Bytes::from(update)).is_err() {
                        tracing::warn!("broadcaster closed, dropping outgoing delta");
                    }
                }
                if let Some(hook) = &self.on_commit {
                    hook();
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to export local update"),
        }
    }

    // ------------------------------------------------------------------
    // Root lifecycle
    // ------------------------------------------------------------------

    /// Attach an initial value as the root of an empty document.
    pub(crate) fn attach_root(&mut self, input: Input) -> Result<NodeId> {
        self.begin();
        let result = self.attach_root_inner(input);
        let end = self.end();
        let root = result?;
        end?;
        Ok(root)
    }

    fn attach_root_inner(&mut self, input: Input) -> Result<NodeId> {
        let plan = self.graph.plan(input)?;
        let root_map = self.root_map();
        let slot = self.graph.materialize(plan, None, Target::Root(&root_map))?;
        let root = slot.as_node().ok_or(AttachError::UnsupportedValue {
            kind: "primitive root".into(),
        })?;
        self.root = Some(root);
        Ok(root)
    }

    /// Build the graph from whatever the document currently holds.
    pub(crate) fn hydrate_root(&mut self) -> Result<NodeId> {
        self.drain_remote();
        self.begin();
        let mut hydrated = HashSet::new();
        let root_map = self.root_map();
        let root = self.graph.hydrate_map(root_map, None, &mut hydrated);
        self.root = Some(root);
        self.end()?;
        Ok(root)
    }

    /// Detach the whole graph, running `cleanup` on initialized models.
    pub(crate) fn teardown(&mut self) {
        if let Some(root) = self.root.take() {
            self.graph.detach(root);
        }
        self.graph.pending_hydration.clear();
        self.run_cleanups();
    }

    /// Bring a non-model root up to date with a state-level versioner.
    ///
    /// On a freshly initialized state the latest version is stamped
    /// directly since there is nothing to migrate.
    pub(crate) fn version_state(&mut self, versioner: &Versioner, fresh: bool) -> Result<()> {
        let Some(root) = self.root else {
            return Ok(());
        };
        if self.graph.model_name(root).is_some() {
            return Ok(());
        }
        self.begin();
        let result = if fresh {
            match versioner.latest() {
                0 => Ok(()),
                latest => self
                    .graph
                    .plan(Input::from(latest))
                    .map_err(Into::into)
                    .and_then(|plan| self.assign_key(root, VERSION_KEY, Prepared::Local(plan))),
            }
        } else {
            self.migrate_node(root, "state", versioner)
        };
        let end = self.end();
        result?;
        end
    }

    // ------------------------------------------------------------------
    // Model lifecycle
    // ------------------------------------------------------------------

    /// Version and `init` every queued model. A model that fails to
    /// migrate stays uninitialized; the rest of the queue still runs and
    /// the first failure is returned.
    fn flush_lifecycle(&mut self) -> Result<()> {
        let mut result = Ok(());
        loop {
            let queued = std::mem::take(&mut self.graph.pending_hydration);
            if queued.is_empty() && self.graph.pending_cleanup.is_empty() {
                return result;
            }
            for id in queued {
                if let Err(e) = self.hydrate_model(id) {
                    tracing::warn!(node = %id, error = %e, "model hydration failed");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
            self.run_cleanups();
        }
    }

    fn hydrate_model(&mut self, id: NodeId) -> Result<()> {
        if !self.graph.contains(id) || self.graph.is_initialized(id) {
            return Ok(());
        }
        let Some(name) = self.graph.model_name(id).map(SmolStr::new) else {
            return Ok(());
        };
        let fresh = self
            .graph
            .node(id)?
            .model
            .as_ref()
            .is_some_and(|binding| binding.fresh);

        if !fresh {
            if let Some(versioner) = self.graph.registry().versioner(&name).cloned() {
                self.migrate_node(id, &name, &versioner)?;
            }
        }

        let fields = self.graph.fields(id);
        let node = self.graph.node_mut(id)?;
        if let Some(binding) = node.model.as_mut() {
            if let Some(mut instance) = binding.instance.take() {
                instance.init(&fields);
                binding.instance = Some(instance);
            }
            binding.initialized = true;
            binding.fields = fields.keys().map(SmolStr::new).collect();
        }
        tracing::trace!(model = %name, node = %id, "model hydrated");
        Ok(())
    }

    /// Run due migrations against a snapshot of the node, then write the
    /// resulting key diff back through the normal mutation path.
    fn migrate_node(&mut self, id: NodeId, target: &str, versioner: &Versioner) -> Result<()> {
        let before = self.graph.fields(id);
        let current = recorded_version(&before);
        if !versioner.is_behind(current) {
            return Ok(());
        }
        let mut after = before.clone();
        versioner.migrate(target, current, &mut after)?;
        self.write_back(id, &before, after)
    }

    fn write_back(
        &mut self,
        id: NodeId,
        before: &Map<String, Value>,
        after: Map<String, Value>,
    ) -> Result<()> {
        for key in before.keys() {
            if !after.contains_key(key) {
                self.remove_key(id, key)?;
            }
        }
        for (key, value) in after {
            if before.get(&key) != Some(&value) {
                let plan = self.graph.plan(Input::Json(value))?;
                self.assign_key(id, &key, Prepared::Local(plan))?;
            }
        }
        Ok(())
    }

    fn run_cleanups(&mut self) {
        for (name, mut instance) in std::mem::take(&mut self.graph.pending_cleanup) {
            instance.cleanup();
            tracing::trace!(model = %name, "model cleaned up");
        }
    }

    // ------------------------------------------------------------------
    // Mutation primitives, shared by local and remote paths
    // ------------------------------------------------------------------

    fn attach(&mut self, owner: NodeId, value: Prepared, target: Target<'_>) -> Result<Slot> {
        Ok(match value {
            Prepared::Local(plan) => self.graph.materialize(plan, Some(owner), target)?,
            Prepared::Remote(value) => {
                self.graph
                    .hydrate(value, Some(owner), &mut self.batch_hydrated)
            }
        })
    }

    fn assign_key(&mut self, id: NodeId, key: &str, value: Prepared) -> Result<()> {
        let (_, map) = self.graph.object(id)?;
        let map = map.clone();
        let slot = self.attach(id, value, Target::Key(&map, key))?;
        let old = match self.graph.children_mut(id)? {
            Children::Object(children) => children.insert(SmolStr::new(key), slot),
            Children::Array(_) => None,
        };
        if let Some(old) = old {
            self.graph.detach_slot(&old);
        }
        Ok(())
    }

    fn remove_key(&mut self, id: NodeId, key: &str) -> Result<()> {
        let (children, map) = self.graph.object(id)?;
        if !children.contains_key(key) {
            return Ok(());
        }
        let map = map.clone();
        if !self.applying_remote {
            map.delete(key).map_err(AttachError::from)?;
        }
        let old = match self.graph.children_mut(id)? {
            Children::Object(children) => children.remove(key),
            Children::Array(_) => None,
        };
        if let Some(old) = old {
            self.graph.detach_slot(&old);
        }
        Ok(())
    }

    fn splice_items(
        &mut self,
        id: NodeId,
        start: usize,
        delete: usize,
        inserts: Vec<Prepared>,
    ) -> Result<Vec<Value>> {
        let (items, list) = self.graph.array(id)?;
        let len = items.len();
        if start > len {
            return Err(AttachError::IndexOutOfBounds { index: start, len }.into());
        }
        let delete = delete.min(len - start);
        let list = list.clone();

        if delete > 0 && !self.applying_remote {
            list.delete(start, delete).map_err(AttachError::from)?;
        }
        let mut slots = Vec::with_capacity(inserts.len());
        for (offset, value) in inserts.into_iter().enumerate() {
            slots.push(self.attach(id, value, Target::Index(&list, start + offset))?);
        }

        let removed: Vec<Slot> = match self.graph.children_mut(id)? {
            Children::Array(children) => {
                children.splice(start..start + delete, slots).collect()
            }
            Children::Object(_) => Vec::new(),
        };
        let removed_json = removed.iter().map(|s| self.graph.slot_to_json(s)).collect();
        for slot in &removed {
            self.graph.detach_slot(slot);
        }
        Ok(removed_json)
    }

    // ------------------------------------------------------------------
    // Remote path
    // ------------------------------------------------------------------

    fn drain_remote(&self) -> Vec<RemoteChange> {
        std::mem::take(&mut *self.remote.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Import an update from a peer and replay its diff onto the graph.
    pub(crate) fn import(&mut self, update: &[u8]) -> Result<()> {
        // local ops of a still-open mutation stay queued for the next commit
        let local = self.doc.peer_id();
        let sent = self.broadcast_from.get(&local).copied();
        self.doc.import(update).map_err(|e| ReplicaError::Import {
            message: e.to_string(),
        })?;
        // nothing imported needs to go back out
        let mut from = self.doc.oplog_vv();
        match sent {
            Some(counter) => {
                from.insert(local, counter);
            }
            None => {
                from.remove(&local);
            }
        }
        self.broadcast_from = from;

        let changes = self.drain_remote();
        if changes.is_empty() || self.root.is_none() {
            return Ok(());
        }

        self.begin();
        self.applying_remote = true;
        self.batch_hydrated.clear();
        let mut result = Ok(());
        for change in changes {
            if self.batch_hydrated.contains(&change.target) {
                continue;
            }
            let Some(node) = self.graph.by_container(&change.target) else {
                tracing::trace!(container = ?change.target, "delta for unknown container, skipping");
                continue;
            };
            if let Err(e) = self.apply_remote(node, change.delta) {
                tracing::warn!(node = %node, error = %e, "remote change did not apply, resyncing container");
                if let Err(e) = self.resync(node) {
                    tracing::error!(node = %node, error = %e, "container resync failed");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        self.applying_remote = false;
        self.batch_hydrated.clear();
        let end = self.end();

        metrics::counter!("weft_deltas_applied_total").increment(1);
        if let Some(hook) = &self.on_commit {
            hook();
        }
        result?;
        end
    }

    /// Rebuild a node's children from its container's current contents.
    fn resync(&mut self, id: NodeId) -> Result<()> {
        let rnode = self.graph.node(id)?.rnode.clone();
        let stale = match (self.graph.children_mut(id)?, &rnode) {
            (Children::Object(children), RNode::Map(_)) => std::mem::take(children)
                .into_values()
                .collect::<Vec<_>>(),
            (Children::Array(children), RNode::List(_)) => std::mem::take(children),
            _ => return Err(AttachError::NotAnObject { id: id.raw() }.into()),
        };
        for slot in &stale {
            self.graph.detach_slot(slot);
        }
        self.batch_hydrated.insert(rnode.id());

        match rnode {
            RNode::Map(map) => {
                let mut entries = Vec::with_capacity(map.len());
                map.for_each(|key, value| entries.push((SmolStr::new(key), value)));
                let mut fresh = std::collections::BTreeMap::new();
                for (key, value) in entries {
                    let slot = self.graph.hydrate(value, Some(id), &mut self.batch_hydrated);
                    fresh.insert(key, slot);
                }
                if let Children::Object(children) = self.graph.children_mut(id)? {
                    *children = fresh;
                }
            }
            RNode::List(list) => {
                let mut fresh = Vec::with_capacity(list.len());
                for index in 0..list.len() {
                    if let Some(item) = list.get(index) {
                        fresh.push(self.graph.hydrate(item, Some(id), &mut self.batch_hydrated));
                    }
                }
                if let Children::Array(children) = self.graph.children_mut(id)? {
                    *children = fresh;
                }
            }
        }
        Ok(())
    }

    fn apply_remote(&mut self, node: NodeId, delta: RemoteDelta) -> Result<()> {
        match delta {
            RemoteDelta::Map(entries) => {
                for (key, value) in entries {
                    match value {
                        Some(value) => self.assign_key(node, &key, Prepared::Remote(value))?,
                        None => self.remove_key(node, &key)?,
                    }
                }
            }
            RemoteDelta::List(runs) => {
                let mut index = 0;
                for run in runs {
                    match run {
                        ListRun::Retain(n) => index += n,
                        ListRun::Delete(n) => {
                            self.splice_items(node, index, n, Vec::new())?;
                        }
                        ListRun::Insert(values) => {
                            let count = values.len();
                            let inserts = values.into_iter().map(Prepared::Remote).collect();
                            self.splice_items(node, index, 0, inserts)?;
                            index += count;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Typed model access
    // ------------------------------------------------------------------

    pub fn model<T: Model>(&self, node: NodeId) -> Option<&T> {
        self.graph
            .model_instance(node)
            .and_then(|m| AsAny::as_any(m).downcast_ref::<T>())
    }

    pub fn model_mut<T: Model>(&mut self, node: NodeId) -> Option<&mut T> {
        self.graph
            .model_instance_mut(node)
            .and_then(|m| AsAny::as_any_mut(m).downcast_mut::<T>())
    }
}

/// Mutation handle passed to [`ChangeObserver::transaction`].
///
/// Everything done through one `Tx` is committed as one delta. A failing
/// call leaves its own assignment unapplied; earlier calls stay applied.
pub struct Tx<'a> {
    obs: &'a mut ChangeObserver,
}

impl Tx<'_> {
    /// Root node of the state.
    pub fn root(&self) -> Result<NodeId> {
        self.obs.root.ok_or_else(|| {
            ReplicaError::NotConnected {
                location: "<unattached>".into(),
            }
            .into()
        })
    }

    /// Assign `value` to `key` on an object node.
    pub fn set(&mut self, node: NodeId, key: &str, value: impl Into<Input>) -> Result<()> {
        self.obs.graph.object(node)?;
        let plan = self.obs.graph.plan(value.into())?;
        self.obs.assign_key(node, key, Prepared::Local(plan))
    }

    /// Remove `key` from an object node. Missing keys are a no-op.
    pub fn remove(&mut self, node: NodeId, key: &str) -> Result<()> {
        self.obs.remove_key(node, key)
    }

    /// Replace the item at `index`, or append when `index == len`.
    pub fn set_index(&mut self, node: NodeId, index: usize, value: impl Into<Input>) -> Result<()> {
        let len = self.obs.graph.array(node)?.0.len();
        let plan = self.obs.graph.plan(value.into())?;
        match index.cmp(&len) {
            std::cmp::Ordering::Less => {
                self.obs
                    .splice_items(node, index, 1, vec![Prepared::Local(plan)])?;
            }
            std::cmp::Ordering::Equal => {
                self.obs
                    .splice_items(node, index, 0, vec![Prepared::Local(plan)])?;
            }
            std::cmp::Ordering::Greater => {
                return Err(AttachError::IndexOutOfBounds { index, len }.into());
            }
        }
        Ok(())
    }

    /// Remove `delete` items at `start` and insert `values` in their place.
    /// Returns the removed items as plain data.
    pub fn splice<I, V>(&mut self, node: NodeId, start: usize, delete: usize, values: I) -> Result<Vec<Value>>
    where
        I: IntoIterator<Item = V>,
        V: Into<Input>,
    {
        self.obs.graph.array(node)?;
        let plans = values
            .into_iter()
            .map(|v| self.obs.graph.plan(v.into()).map(Prepared::Local))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.obs.splice_items(node, start, delete, plans)
    }

    pub fn push(&mut self, node: NodeId, value: impl Into<Input>) -> Result<()> {
        let len = self.obs.graph.array(node)?.0.len();
        self.splice(node, len, 0, [value])?;
        Ok(())
    }

    pub fn get(&self, node: NodeId, key: &str) -> Option<&Slot> {
        self.obs.graph.get(node, key)
    }

    /// Node stored under `key`, if that key holds an object or array.
    pub fn child(&self, node: NodeId, key: &str) -> Option<NodeId> {
        self.get(node, key).and_then(Slot::as_node)
    }

    pub fn at(&self, node: NodeId, index: usize) -> Option<&Slot> {
        self.obs.graph.at(node, index)
    }

    pub fn len(&self, node: NodeId) -> usize {
        self.obs.graph.len(node)
    }

    pub fn keys(&self, node: NodeId) -> Vec<SmolStr> {
        self.obs.graph.keys(node)
    }

    pub fn to_json(&self, node: NodeId) -> Value {
        self.obs.graph.to_json(node)
    }

    pub fn graph(&self) -> &Graph {
        &self.obs.graph
    }

    pub fn model<T: Model>(&self, node: NodeId) -> Option<&T> {
        self.obs.model::<T>(node)
    }

    pub fn model_mut<T: Model>(&mut self, node: NodeId) -> Option<&mut T> {
        self.obs.model_mut::<T>(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MissingModelPolicy;
    use crate::model::{ModelType, Registry};
    use serde_json::json;

    #[derive(Default)]
    struct Todo {
        inits: usize,
        text: Option<String>,
    }

    impl Model for Todo {
        fn init(&mut self, fields: &Map<String, Value>) {
            self.inits += 1;
            self.text = fields.get("text").and_then(Value::as_str).map(str::to_string);
        }
    }

    impl ModelType for Todo {
        const NAME: &'static str = "Todo";

        fn create() -> Self {
            Self::default()
        }

        fn versioner() -> Option<Versioner> {
            Some(Versioner::new().step(1, |fields| {
                if let Some(title) = fields.remove("title") {
                    fields.insert("text".into(), title);
                }
                Ok(())
            }))
        }
    }

    fn observer() -> (ChangeObserver, mpsc::UnboundedReceiver<Bytes>) {
        observer_with(MissingModelPolicy::Strict)
    }

    fn observer_with(policy: MissingModelPolicy) -> (ChangeObserver, mpsc::UnboundedReceiver<Bytes>) {
        let mut registry = Registry::new();
        registry.register::<Todo>();
        let graph = Graph::new(Arc::new(registry), policy);
        let mut obs = ChangeObserver::new(graph);
        let (tx, rx) = mpsc::unbounded_channel();
        obs.set_outgoing(Some(tx));
        (obs, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(update) = rx.try_recv() {
            out.push(update);
        }
        out
    }

    #[test]
    fn test_transaction_produces_one_delta() {
        let (mut obs, mut rx) = observer();
        obs.attach_root(Input::Json(json!({"count": 0}))).unwrap();
        drain(&mut rx);

        obs.transaction(|tx| {
            let root = tx.root()?;
            tx.set(root, "count", 5)?;
            tx.set(root, "items", json!([]))?;
            let items = tx.child(root, "items").unwrap();
            tx.push(items, json!({"@": "Todo", "text": "a"}))?;
            tx.push(items, json!({"@": "Todo", "text": "b"}))?;
            Ok(())
        })
        .unwrap();

        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_empty_transaction_sends_nothing() {
        let (mut obs, mut rx) = observer();
        obs.attach_root(Input::Json(json!({}))).unwrap();
        drain(&mut rx);
        obs.transaction(|_| Ok(())).unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_remote_updates_converge() {
        let (mut a, mut a_rx) = observer();
        let (mut b, mut b_rx) = observer();

        a.attach_root(Input::Json(json!({"list": [1, 2, 3]}))).unwrap();
        b.import(&a.export_snapshot().unwrap()).unwrap();
        b.hydrate_root().unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        a.transaction(|tx| {
            let root = tx.root()?;
            let list = tx.child(root, "list").unwrap();
            tx.splice(list, 1, 1, [json!({"x": 1})])?;
            tx.set(root, "a", "from a")?;
            Ok(())
        })
        .unwrap();
        b.transaction(|tx| {
            let root = tx.root()?;
            tx.set(root, "b", "from b")?;
            tx.remove(root, "missing")?;
            Ok(())
        })
        .unwrap();

        for update in drain(&mut a_rx) {
            b.import(&update).unwrap();
        }
        for update in drain(&mut b_rx) {
            a.import(&update).unwrap();
        }

        let expected = json!({"list": [1, {"x": 1}, 3], "a": "from a", "b": "from b"});
        assert_eq!(a.snapshot(), expected);
        assert_eq!(b.snapshot(), expected);
        // imports are not echoed back out
        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut b_rx).is_empty());
    }

    #[test]
    fn test_remote_model_is_hydrated_and_cleaned_up() {
        let (mut a, mut a_rx) = observer();
        let (mut b, _b_rx) = observer();
        a.attach_root(Input::Json(json!({"items": []}))).unwrap();
        b.import(&a.export_snapshot().unwrap()).unwrap();
        b.hydrate_root().unwrap();
        drain(&mut a_rx);

        a.transaction(|tx| {
            let root = tx.root()?;
            let items = tx.child(root, "items").unwrap();
            tx.push(items, Input::model::<Todo>(json!({"text": "a"}).as_object().cloned().unwrap()))
        })
        .unwrap();
        for update in drain(&mut a_rx) {
            b.import(&update).unwrap();
        }

        let root = b.root().unwrap();
        let items = b.graph().get(root, "items").and_then(Slot::as_node).unwrap();
        let todo = b.graph().at(items, 0).and_then(Slot::as_node).unwrap();
        let model = b.model::<Todo>(todo).unwrap();
        assert_eq!(model.inits, 1);
        assert_eq!(model.text.as_deref(), Some("a"));

        a.transaction(|tx| {
            let root = tx.root()?;
            let items = tx.child(root, "items").unwrap();
            tx.splice(items, 0, 1, Vec::<Value>::new())?;
            Ok(())
        })
        .unwrap();
        for update in drain(&mut a_rx) {
            b.import(&update).unwrap();
        }
        assert!(!b.graph().contains(todo));
        assert_eq!(b.snapshot(), json!({"items": []}));
    }

    #[test]
    fn test_reloaded_model_is_migrated_through_mutation_path() {
        let (mut obs, mut rx) = observer();
        obs.attach_root(Input::Json(json!({"todo": {"@": "Todo", "title": "old"}})))
            .unwrap();

        let root = obs.root().unwrap();
        let todo = obs.graph().get(root, "todo").and_then(Slot::as_node).unwrap();
        assert_eq!(
            obs.graph().to_json(todo),
            json!({"@": "Todo", ":version": 1, "text": "old"})
        );
        assert_eq!(obs.model::<Todo>(todo).unwrap().text.as_deref(), Some("old"));

        // the migrated shape went out in the same delta as the attach
        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 1);
        let (mut peer, _peer_rx) = observer();
        peer.import(&updates[0]).unwrap();
        peer.hydrate_root().unwrap();
        assert_eq!(peer.snapshot(), obs.snapshot());
    }

    #[test]
    fn test_rejected_assignment_leaves_graph_unchanged() {
        let (mut obs, _rx) = observer();
        obs.attach_root(Input::Json(json!({"a": 1}))).unwrap();
        let err = obs
            .transaction(|tx| {
                let root = tx.root()?;
                tx.set(root, "b", 2)?;
                tx.set(root, "c", json!({"@": "Nope"}))?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::WeftError::Attach(AttachError::MissingModel { .. })
        ));
        // earlier assignment in the same transaction stays
        assert_eq!(obs.snapshot(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_set_index_bounds() {
        let (mut obs, _rx) = observer();
        obs.attach_root(Input::Json(json!({"l": [1]}))).unwrap();
        obs.transaction(|tx| {
            let root = tx.root()?;
            let l = tx.child(root, "l").unwrap();
            tx.set_index(l, 0, 5)?;
            tx.set_index(l, 1, 6)?;
            assert!(tx.set_index(l, 5, 7).is_err());
            Ok(())
        })
        .unwrap();
        assert_eq!(obs.snapshot(), json!({"l": [5, 6]}));
    }

    #[test]
    fn test_remove_key() {
        let (mut obs, _rx) = observer();
        obs.attach_root(Input::Json(json!({"a": 1, "b": {"c": 2}}))).unwrap();
        let keys = obs
            .transaction(|tx| {
                let root = tx.root()?;
                tx.remove(root, "b")?;
                Ok(tx.keys(root))
            })
            .unwrap();
        assert_eq!(keys, vec![SmolStr::new("a")]);
        assert_eq!(obs.snapshot(), json!({"a": 1}));
    }

    /// `b` starts out as a copy of `a` seeded with `value`.
    fn pair(
        a: &mut ChangeObserver,
        b: &mut ChangeObserver,
        value: Value,
    ) {
        a.attach_root(Input::Json(value)).unwrap();
        b.import(&a.export_snapshot().unwrap()).unwrap();
        b.hydrate_root().unwrap();
    }

    #[test]
    fn test_concurrent_deltas_converge_in_any_order() {
        let (mut a, mut a_rx) = observer();
        let (mut b, mut b_rx) = observer();
        let (mut c, _c_rx) = observer();
        let (mut d, _d_rx) = observer();
        a.attach_root(Input::Json(json!({"list": [1], "m": {}}))).unwrap();
        let seed = a.export_snapshot().unwrap();
        for peer in [&mut b, &mut c, &mut d] {
            peer.import(&seed).unwrap();
            peer.hydrate_root().unwrap();
        }
        drain(&mut a_rx);

        for n in [2, 3] {
            a.transaction(|tx| {
                let root = tx.root()?;
                let list = tx.child(root, "list").unwrap();
                tx.push(list, n)?;
                let m = tx.child(root, "m").unwrap();
                tx.set(m, "k", format!("a{n}"))
            })
            .unwrap();
            b.transaction(|tx| {
                let root = tx.root()?;
                let list = tx.child(root, "list").unwrap();
                tx.splice(list, 0, 0, [n * 10])?;
                let m = tx.child(root, "m").unwrap();
                tx.set(m, "k", format!("b{n}"))?;
                tx.set(root, format!("b{n}").as_str(), json!({"n": n}))
            })
            .unwrap();
        }
        let from_a = drain(&mut a_rx);
        let from_b = drain(&mut b_rx);
        assert_eq!(from_a.len(), 2);
        assert_eq!(from_b.len(), 2);

        for update in &from_a {
            b.import(update).unwrap();
            c.import(update).unwrap();
        }
        for update in &from_b {
            a.import(update).unwrap();
            c.import(update).unwrap();
        }
        // reversed: b's deltas first, each stream back to front
        for update in from_b.iter().rev().chain(from_a.iter().rev()) {
            d.import(update).unwrap();
        }

        let expected = a.snapshot();
        assert_eq!(b.snapshot(), expected);
        assert_eq!(c.snapshot(), expected);
        assert_eq!(d.snapshot(), expected);
        assert_eq!(expected["list"].as_array().map(Vec::len), Some(5));
    }

    #[test]
    fn test_unregistered_remote_model_keeps_sibling_changes() {
        let (mut a, mut a_rx) = observer_with(MissingModelPolicy::Allow);
        let (mut b, _b_rx) = observer();
        pair(&mut a, &mut b, json!({"list": [], "m": {}}));
        drain(&mut a_rx);

        a.transaction(|tx| {
            let root = tx.root()?;
            let list = tx.child(root, "list").unwrap();
            tx.push(list, 1)?;
            let m = tx.child(root, "m").unwrap();
            tx.set(m, "k", "v")?;
            tx.set(root, "ghost", json!({"@": "Ghost", "x": 1}))?;
            tx.set(root, "z", 1)
        })
        .unwrap();
        for update in drain(&mut a_rx) {
            b.import(&update).unwrap();
        }

        assert_eq!(
            b.snapshot(),
            json!({"list": [1], "m": {"k": "v"}, "ghost": {"@": "Ghost", "x": 1}, "z": 1})
        );
        assert_eq!(b.snapshot(), a.snapshot());
        let ghost = b.graph().get(b.root().unwrap(), "ghost").and_then(Slot::as_node).unwrap();
        assert!(b.graph().model_name(ghost).is_none());
    }

    #[test]
    fn test_diverged_container_is_resynced_from_document() {
        let (mut a, mut a_rx) = observer();
        let (mut b, _b_rx) = observer();
        pair(&mut a, &mut b, json!({"list": [1, 2], "n": 0}));
        drain(&mut a_rx);

        let list = b.graph().get(b.root().unwrap(), "list").and_then(Slot::as_node).unwrap();
        if let Children::Array(items) = b.graph.children_mut(list).unwrap() {
            items.clear();
        }

        a.transaction(|tx| {
            let root = tx.root()?;
            let list = tx.child(root, "list").unwrap();
            tx.push(list, 3)?;
            tx.set(root, "n", 1)
        })
        .unwrap();
        for update in drain(&mut a_rx) {
            b.import(&update).unwrap();
        }
        assert_eq!(b.snapshot(), json!({"list": [1, 2, 3], "n": 1}));
    }

    #[test]
    fn test_large_numbers_match_across_replicas() {
        let (mut a, mut a_rx) = observer();
        let (mut b, _b_rx) = observer();
        pair(&mut a, &mut b, json!({}));
        drain(&mut a_rx);

        a.transaction(|tx| {
            let root = tx.root()?;
            tx.set(root, "n", u64::MAX)
        })
        .unwrap();
        for update in drain(&mut a_rx) {
            b.import(&update).unwrap();
        }
        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.snapshot()["n"].as_f64(), Some(u64::MAX as f64));
    }
}
