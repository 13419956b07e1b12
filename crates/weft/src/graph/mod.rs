//! Observable node graph paired with Loro containers.
//!
//! Nodes live in an arena keyed by [`NodeId`]. Owner links are plain ids,
//! used only for upward lookups; lifetime is decided by the parent's child
//! slots alone.

mod attach;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use loro::{ContainerID, ContainerTrait, LoroList, LoroMap};
use serde_json::{Map, Value};
use smol_str::SmolStr;

use crate::config::MissingModelPolicy;
use crate::error::AttachError;
use crate::model::{Model, Registry};
use crate::value::Primitive;

pub(crate) use attach::{Plan, Target};

/// Handle to a node in a replica's graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Contents of one key or index.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Value(Primitive),
    Node(NodeId),
}

impl Slot {
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Slot::Node(id) => Some(*id),
            Slot::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Primitive> {
        match self {
            Slot::Value(p) => Some(p),
            Slot::Node(_) => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Children {
    Object(BTreeMap<SmolStr, Slot>),
    Array(Vec<Slot>),
}

/// Replication-side counterpart of a node.
#[derive(Debug, Clone)]
pub(crate) enum RNode {
    Map(LoroMap),
    List(LoroList),
}

impl RNode {
    pub(crate) fn id(&self) -> ContainerID {
        match self {
            RNode::Map(m) => m.id(),
            RNode::List(l) => l.id(),
        }
    }
}

pub(crate) struct ModelBinding {
    pub name: SmolStr,
    /// Taken out while a lifecycle hook runs.
    pub instance: Option<Box<dyn Model>>,
    pub fresh: bool,
    pub initialized: bool,
    /// Field names present when the instance was hydrated.
    pub fields: Vec<SmolStr>,
}

pub(crate) struct Node {
    pub children: Children,
    pub rnode: RNode,
    pub owner: Option<NodeId>,
    pub model: Option<ModelBinding>,
}

impl Node {
    fn child_ids(&self) -> Vec<NodeId> {
        match &self.children {
            Children::Object(map) => map.values().filter_map(Slot::as_node).collect(),
            Children::Array(items) => items.iter().filter_map(Slot::as_node).collect(),
        }
    }
}

/// Arena of live nodes for one replica.
pub struct Graph {
    nodes: HashMap<NodeId, Node>,
    by_container: HashMap<ContainerID, NodeId>,
    next_id: u64,
    registry: Arc<Registry>,
    policy: MissingModelPolicy,
    /// Model nodes waiting for versioning and `init`, in queue order.
    pub(crate) pending_hydration: Vec<NodeId>,
    /// Initialized instances that left the graph and still need `cleanup`.
    pub(crate) pending_cleanup: Vec<(SmolStr, Box<dyn Model>)>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Graph {
    pub(crate) fn new(registry: Arc<Registry>, policy: MissingModelPolicy) -> Self {
        Self {
            nodes: HashMap::new(),
            by_container: HashMap::new(),
            next_id: 0,
            registry,
            policy,
            pending_hydration: Vec::new(),
            pending_cleanup: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn alloc(&mut self) -> NodeId {
        self.next_id += 1;
        NodeId(self.next_id)
    }

    pub(crate) fn node(&self, id: NodeId) -> Result<&Node, AttachError> {
        self.nodes
            .get(&id)
            .ok_or(AttachError::UnknownNode { id: id.raw() })
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, AttachError> {
        self.nodes
            .get_mut(&id)
            .ok_or(AttachError::UnknownNode { id: id.raw() })
    }

    pub(crate) fn object(&self, id: NodeId) -> Result<(&BTreeMap<SmolStr, Slot>, &LoroMap), AttachError> {
        let node = self.node(id)?;
        match (&node.children, &node.rnode) {
            (Children::Object(map), RNode::Map(rmap)) => Ok((map, rmap)),
            _ => Err(AttachError::NotAnObject { id: id.raw() }),
        }
    }

    pub(crate) fn array(&self, id: NodeId) -> Result<(&Vec<Slot>, &LoroList), AttachError> {
        let node = self.node(id)?;
        match (&node.children, &node.rnode) {
            (Children::Array(items), RNode::List(list)) => Ok((items, list)),
            _ => Err(AttachError::NotAnArray { id: id.raw() }),
        }
    }

    pub(crate) fn by_container(&self, id: &ContainerID) -> Option<NodeId> {
        self.by_container.get(id).copied()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, id: NodeId, key: &str) -> Option<&Slot> {
        self.object(id).ok().and_then(|(map, _)| map.get(key))
    }

    pub fn at(&self, id: NodeId, index: usize) -> Option<&Slot> {
        self.array(id).ok().and_then(|(items, _)| items.get(index))
    }

    /// Number of keys or items; 0 for unknown nodes.
    pub fn len(&self, id: NodeId) -> usize {
        match self.nodes.get(&id).map(|n| &n.children) {
            Some(Children::Object(map)) => map.len(),
            Some(Children::Array(items)) => items.len(),
            None => 0,
        }
    }

    pub fn keys(&self, id: NodeId) -> Vec<SmolStr> {
        self.object(id)
            .map(|(map, _)| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn owner(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.owner)
    }

    pub fn is_array(&self, id: NodeId) -> bool {
        matches!(
            self.nodes.get(&id).map(|n| &n.children),
            Some(Children::Array(_))
        )
    }

    pub fn model_name(&self, id: NodeId) -> Option<&str> {
        self.nodes
            .get(&id)
            .and_then(|n| n.model.as_ref())
            .map(|b| b.name.as_str())
    }

    /// Whether the model bound to `id` has had `init` run.
    pub fn is_initialized(&self, id: NodeId) -> bool {
        self.nodes
            .get(&id)
            .and_then(|n| n.model.as_ref())
            .is_some_and(|b| b.initialized)
    }

    pub(crate) fn model_instance(&self, id: NodeId) -> Option<&dyn Model> {
        self.nodes
            .get(&id)
            .and_then(|n| n.model.as_ref())
            .and_then(|b| b.instance.as_deref())
    }

    pub(crate) fn model_instance_mut(&mut self, id: NodeId) -> Option<&mut (dyn Model + 'static)> {
        self.nodes
            .get_mut(&id)
            .and_then(|n| n.model.as_mut())
            .and_then(|b| b.instance.as_deref_mut())
    }

    /// Plain-data copy of a node, with all attachment metadata stripped.
    pub fn to_json(&self, id: NodeId) -> Value {
        let Some(node) = self.nodes.get(&id) else {
            return Value::Null;
        };
        match &node.children {
            Children::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, slot)| (k.to_string(), self.slot_to_json(slot)))
                    .collect(),
            ),
            Children::Array(items) => {
                Value::Array(items.iter().map(|slot| self.slot_to_json(slot)).collect())
            }
        }
    }

    pub fn slot_to_json(&self, slot: &Slot) -> Value {
        match slot {
            Slot::Value(p) => p.to_json(),
            Slot::Node(id) => self.to_json(*id),
        }
    }

    /// Plain-data fields of an object node.
    pub(crate) fn fields(&self, id: NodeId) -> Map<String, Value> {
        match self.to_json(id) {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    pub(crate) fn insert_node(&mut self, id: NodeId, node: Node) {
        self.by_container.insert(node.rnode.id(), id);
        self.nodes.insert(id, node);
    }

    pub(crate) fn children_mut(&mut self, id: NodeId) -> Result<&mut Children, AttachError> {
        Ok(&mut self.node_mut(id)?.children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Input, loro_to_json};
    use loro::LoroDoc;
    use serde_json::json;

    fn graph() -> Graph {
        Graph::new(Arc::new(Registry::new()), MissingModelPolicy::Strict)
    }

    #[test]
    fn test_to_json_round_trip() {
        let doc = LoroDoc::new();
        let root = doc.get_map("state");
        let mut g = graph();

        let value = json!({
            "count": 0,
            "name": "x",
            "nested": {"list": [1, 2.5, {"deep": null}], "flag": true}
        });
        let plan = g.plan(Input::Json(value.clone())).unwrap();
        let slot = g.materialize(plan, None, Target::Root(&root)).unwrap();
        let id = slot.as_node().unwrap();

        assert_eq!(g.to_json(id), value);
        assert_eq!(loro_to_json(&root.get_deep_value()), value);
    }

    #[test]
    fn test_owner_chain_terminates_at_root() {
        let doc = LoroDoc::new();
        let root = doc.get_map("state");
        let mut g = graph();

        let plan = g.plan(Input::Json(json!({"a": {"b": {"c": []}}}))).unwrap();
        let root_id = g
            .materialize(plan, None, Target::Root(&root))
            .unwrap()
            .as_node()
            .unwrap();

        let a = g.get(root_id, "a").and_then(Slot::as_node).unwrap();
        let b = g.get(a, "b").and_then(Slot::as_node).unwrap();
        let c = g.get(b, "c").and_then(Slot::as_node).unwrap();

        let mut chain = vec![c];
        let mut cursor = c;
        while let Some(owner) = g.owner(cursor) {
            chain.push(owner);
            cursor = owner;
        }
        assert_eq!(chain, vec![c, b, a, root_id]);
    }
}
