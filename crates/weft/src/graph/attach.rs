//! Node attachment: turning plain values and document containers into
//! paired graph nodes, and tearing them down again.

use std::collections::{BTreeMap, HashSet};

use loro::{Container, ContainerID, ContainerTrait, LoroList, LoroMap, LoroValue, ValueOrContainer};
use serde_json::{Map, Value};
use smol_str::SmolStr;

use super::{Children, Graph, ModelBinding, Node, NodeId, RNode, Slot};
use crate::config::MissingModelPolicy;
use crate::error::AttachError;
use crate::model::Model;
use crate::value::{Input, MODEL_KEY, Primitive, VERSION_KEY};

/// A validated value ready to be materialized.
///
/// Planning checks the whole input before anything is written, so a
/// rejected assignment leaves both the graph and the document untouched.
pub(crate) enum Plan {
    Value(Primitive),
    Object {
        fields: Vec<(SmolStr, Plan)>,
        model: Option<ModelPlan>,
    },
    Array(Vec<Plan>),
}

pub(crate) struct ModelPlan {
    name: SmolStr,
    instance: Box<dyn Model>,
    fresh: bool,
}

/// Where a materialized value's replication node goes.
pub(crate) enum Target<'a> {
    Key(&'a LoroMap, &'a str),
    Index(&'a LoroList, usize),
    /// The document's root map, which already exists.
    Root(&'a LoroMap),
}

impl Graph {
    pub(crate) fn plan(&self, input: Input) -> Result<Plan, AttachError> {
        match input {
            Input::Json(value) => self.plan_json(value),
            Input::Fresh { name, mut fields } => {
                fields.insert(MODEL_KEY.to_string(), Value::String(name.to_string()));
                if let Some(versioner) = self.registry.versioner(&name) {
                    fields.insert(VERSION_KEY.to_string(), Value::from(versioner.latest()));
                }
                let model = self.resolve_model(&name, true)?;
                self.plan_object(fields, model)
            }
        }
    }

    fn plan_json(&self, value: Value) -> Result<Plan, AttachError> {
        match value {
            Value::Null => Ok(Plan::Value(Primitive::Null)),
            Value::Bool(b) => Ok(Plan::Value(Primitive::Bool(b))),
            Value::Number(n) => Primitive::number(n).map(Plan::Value),
            Value::String(s) => Ok(Plan::Value(Primitive::String(s.into()))),
            Value::Array(items) => items
                .into_iter()
                .map(|item| self.plan_json(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Plan::Array),
            Value::Object(fields) => {
                let model = match fields.get(MODEL_KEY).and_then(Value::as_str) {
                    Some(name) => self.resolve_model(name, false)?,
                    None => None,
                };
                self.plan_object(fields, model)
            }
        }
    }

    fn plan_object(
        &self,
        fields: Map<String, Value>,
        model: Option<ModelPlan>,
    ) -> Result<Plan, AttachError> {
        let fields = fields
            .into_iter()
            .map(|(k, v)| Ok((SmolStr::from(k), self.plan_json(v)?)))
            .collect::<Result<Vec<_>, AttachError>>()?;
        Ok(Plan::Object { fields, model })
    }

    /// Look up a discriminator, applying the missing-model policy.
    fn resolve_model(&self, name: &str, fresh: bool) -> Result<Option<ModelPlan>, AttachError> {
        match self.registry.create(name) {
            Some(instance) => Ok(Some(ModelPlan {
                name: SmolStr::new(name),
                instance,
                fresh,
            })),
            None => match self.policy {
                MissingModelPolicy::Strict => Err(AttachError::MissingModel {
                    name: SmolStr::new(name),
                }),
                MissingModelPolicy::Allow => {
                    tracing::warn!(model = %name, "unregistered model, attaching as plain object");
                    Ok(None)
                }
            },
        }
    }

    /// Create the nodes for `plan` under `owner` and write the matching
    /// containers/values into the document at `target`.
    pub(crate) fn materialize(
        &mut self,
        plan: Plan,
        owner: Option<NodeId>,
        target: Target<'_>,
    ) -> Result<Slot, AttachError> {
        match plan {
            Plan::Value(p) => {
                match target {
                    Target::Key(map, key) => map.insert(key, p.to_loro())?,
                    Target::Index(list, index) => list.insert(index, p.to_loro())?,
                    Target::Root(_) => {
                        return Err(AttachError::UnsupportedValue {
                            kind: "primitive root".into(),
                        });
                    }
                }
                Ok(Slot::Value(p))
            }
            Plan::Object { fields, model } => {
                let map = match target {
                    Target::Key(parent, key) => parent.insert_container(key, LoroMap::new())?,
                    Target::Index(parent, index) => {
                        parent.insert_container(index, LoroMap::new())?
                    }
                    Target::Root(root) => root.clone(),
                };
                let id = self.alloc();
                let mut children = BTreeMap::new();
                for (key, child) in fields {
                    let slot = self.materialize(child, Some(id), Target::Key(&map, &key))?;
                    children.insert(key, slot);
                }
                let binding = model.map(|plan| ModelBinding {
                    name: plan.name,
                    instance: Some(plan.instance),
                    fresh: plan.fresh,
                    initialized: false,
                    fields: children.keys().cloned().collect(),
                });
                let queue = binding.is_some();
                self.insert_node(
                    id,
                    Node {
                        children: Children::Object(children),
                        rnode: RNode::Map(map),
                        owner,
                        model: binding,
                    },
                );
                if queue {
                    self.pending_hydration.push(id);
                }
                Ok(Slot::Node(id))
            }
            Plan::Array(items) => {
                let list = match target {
                    Target::Key(parent, key) => parent.insert_container(key, LoroList::new())?,
                    Target::Index(parent, index) => {
                        parent.insert_container(index, LoroList::new())?
                    }
                    Target::Root(_) => {
                        return Err(AttachError::UnsupportedValue {
                            kind: "array root".into(),
                        });
                    }
                };
                let id = self.alloc();
                let mut children = Vec::with_capacity(items.len());
                for (index, child) in items.into_iter().enumerate() {
                    children.push(self.materialize(child, Some(id), Target::Index(&list, index))?);
                }
                self.insert_node(
                    id,
                    Node {
                        children: Children::Array(children),
                        rnode: RNode::List(list),
                        owner,
                        model: None,
                    },
                );
                Ok(Slot::Node(id))
            }
        }
    }

    /// Pair an existing document value with new graph nodes, recursively.
    ///
    /// The document already holds the value, so hydration never rejects it:
    /// unregistered models become plain objects and values with no plain
    /// representation become `null`, both with a warning.
    ///
    /// Every container reached is recorded in `hydrated` so later events for
    /// the same import batch can be skipped.
    pub(crate) fn hydrate(
        &mut self,
        value: ValueOrContainer,
        owner: Option<NodeId>,
        hydrated: &mut HashSet<ContainerID>,
    ) -> Slot {
        match value {
            ValueOrContainer::Value(v) => match Primitive::from_loro(&v) {
                Ok(p) => Slot::Value(p),
                Err(e) => {
                    tracing::warn!(error = %e, "document value has no plain form, hydrating as null");
                    Slot::Value(Primitive::Null)
                }
            },
            ValueOrContainer::Container(Container::Map(map)) => {
                Slot::Node(self.hydrate_map(map, owner, hydrated))
            }
            ValueOrContainer::Container(Container::List(list)) => {
                let id = self.alloc();
                hydrated.insert(list.id());
                let mut children = Vec::with_capacity(list.len());
                for index in 0..list.len() {
                    if let Some(item) = list.get(index) {
                        children.push(self.hydrate(item, Some(id), hydrated));
                    }
                }
                self.insert_node(
                    id,
                    Node {
                        children: Children::Array(children),
                        rnode: RNode::List(list),
                        owner,
                        model: None,
                    },
                );
                Slot::Node(id)
            }
            ValueOrContainer::Container(other) => {
                tracing::warn!(kind = ?other.get_type(), "unsupported container, hydrating as null");
                Slot::Value(Primitive::Null)
            }
        }
    }

    pub(crate) fn hydrate_map(
        &mut self,
        map: LoroMap,
        owner: Option<NodeId>,
        hydrated: &mut HashSet<ContainerID>,
    ) -> NodeId {
        let mut entries: Vec<(String, ValueOrContainer)> = Vec::with_capacity(map.len());
        map.for_each(|key, value| entries.push((key.to_string(), value)));

        let model = match entries.iter().find(|(key, _)| key == MODEL_KEY) {
            Some((_, ValueOrContainer::Value(LoroValue::String(name)))) => {
                let name = name.to_string();
                let instance = self.registry.create(&name);
                if instance.is_none() {
                    tracing::warn!(model = %name, "unregistered model in document, hydrating as plain object");
                }
                instance.map(|instance| (SmolStr::new(name), instance))
            }
            _ => None,
        };

        let id = self.alloc();
        hydrated.insert(map.id());
        let mut children = BTreeMap::new();
        for (key, value) in entries {
            let slot = self.hydrate(value, Some(id), hydrated);
            children.insert(SmolStr::from(key), slot);
        }
        let binding = model.map(|(name, instance)| ModelBinding {
            name,
            instance: Some(instance),
            fresh: false,
            initialized: false,
            fields: children.keys().cloned().collect(),
        });
        let queue = binding.is_some();
        self.insert_node(
            id,
            Node {
                children: Children::Object(children),
                rnode: RNode::Map(map),
                owner,
                model: binding,
            },
        );
        if queue {
            self.pending_hydration.push(id);
        }
        id
    }

    /// Remove a node and its whole subtree from the graph, children first.
    ///
    /// Unknown ids are ignored, so detaching twice is harmless. The document
    /// side is left alone: removing the parent entry there drops the
    /// container with it.
    pub(crate) fn detach(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        for child in node.child_ids() {
            self.detach(child);
        }
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        let container = node.rnode.id();
        if self.by_container.get(&container) == Some(&id) {
            self.by_container.remove(&container);
        }
        if let Some(binding) = node.model {
            if binding.initialized {
                if let Some(instance) = binding.instance {
                    self.pending_cleanup.push((binding.name, instance));
                }
            }
        }
    }

    pub(crate) fn detach_slot(&mut self, slot: &Slot) {
        if let Slot::Node(id) = slot {
            self.detach(*id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::{ModelType, Registry};
    use loro::LoroDoc;
    use serde_json::json;

    struct Todo;

    impl Model for Todo {}

    impl ModelType for Todo {
        const NAME: &'static str = "Todo";

        fn create() -> Self {
            Todo
        }

        fn versioner() -> Option<crate::model::Versioner> {
            Some(crate::model::Versioner::new().step(1, |_| Ok(())).step(2, |_| Ok(())))
        }
    }

    fn graph(policy: MissingModelPolicy) -> Graph {
        let mut registry = Registry::new();
        registry.register::<Todo>();
        Graph::new(Arc::new(registry), policy)
    }

    fn attach_root(g: &mut Graph, doc: &LoroDoc, value: Value) -> Result<NodeId, AttachError> {
        let plan = g.plan(Input::Json(value))?;
        let root = doc.get_map("state");
        Ok(g.materialize(plan, None, Target::Root(&root))?
            .as_node()
            .unwrap())
    }

    #[test]
    fn test_missing_model_strict() {
        let g = graph(MissingModelPolicy::Strict);
        let err = g
            .plan(Input::Json(json!({"@": "Unregistered"})))
            .err()
            .unwrap();
        assert!(matches!(err, AttachError::MissingModel { name } if name == "Unregistered"));
    }

    #[test]
    fn test_missing_model_permissive() {
        let doc = LoroDoc::new();
        let mut g = graph(MissingModelPolicy::Allow);
        let id = attach_root(&mut g, &doc, json!({"@": "Unregistered", "x": 1})).unwrap();
        assert!(g.model_name(id).is_none());
        assert!(g.pending_hydration.is_empty());
        assert_eq!(g.to_json(id), json!({"@": "Unregistered", "x": 1}));
    }

    #[test]
    fn test_fresh_instance_is_stamped() {
        let doc = LoroDoc::new();
        let mut g = graph(MissingModelPolicy::Strict);
        let root = attach_root(&mut g, &doc, json!({})).unwrap();
        let (_, map) = g.object(root).unwrap();
        let map = map.clone();

        let mut fields = Map::new();
        fields.insert("text".into(), json!("a"));
        let plan = g.plan(Input::model::<Todo>(fields)).unwrap();
        let slot = g.materialize(plan, Some(root), Target::Key(&map, "todo")).unwrap();
        let id = slot.as_node().unwrap();

        assert_eq!(g.model_name(id), Some("Todo"));
        assert_eq!(g.to_json(id), json!({"@": "Todo", ":version": 2, "text": "a"}));
        assert_eq!(g.pending_hydration, vec![id]);
    }

    #[test]
    fn test_hydrate_from_document() {
        let source = LoroDoc::new();
        let mut g1 = graph(MissingModelPolicy::Strict);
        let value = json!({"items": [{"@": "Todo", "text": "a"}], "n": 3});
        attach_root(&mut g1, &source, value.clone()).unwrap();
        source.commit();

        let mut g2 = graph(MissingModelPolicy::Strict);
        let mut hydrated = HashSet::new();
        let root = g2.hydrate_map(source.get_map("state"), None, &mut hydrated);
        assert_eq!(g2.to_json(root), value);
        assert_eq!(hydrated.len(), 3);
        assert_eq!(g2.pending_hydration.len(), 1);
    }

    #[test]
    fn test_hydrate_degrades_unrepresentable_values() {
        let doc = LoroDoc::new();
        let state = doc.get_map("state");
        state
            .insert_container("body", loro::LoroText::new())
            .unwrap();
        state.insert("blob", vec![1u8, 2]).unwrap();
        let ghost = state.insert_container("ghost", LoroMap::new()).unwrap();
        ghost.insert("@", "Unregistered").unwrap();
        ghost.insert("x", 1).unwrap();

        let mut g = graph(MissingModelPolicy::Strict);
        let root = g.hydrate_map(state, None, &mut HashSet::new());
        assert_eq!(
            g.to_json(root),
            json!({"blob": null, "body": null, "ghost": {"@": "Unregistered", "x": 1}})
        );
        let ghost = g.get(root, "ghost").and_then(Slot::as_node).unwrap();
        assert!(g.model_name(ghost).is_none());
        assert!(g.pending_hydration.is_empty());
    }

    #[test]
    fn test_detach_is_idempotent() {
        let doc = LoroDoc::new();
        let mut g = graph(MissingModelPolicy::Strict);
        let root = attach_root(&mut g, &doc, json!({"a": {"b": [1, {"c": 2}]}})).unwrap();
        let a = g.get(root, "a").and_then(Slot::as_node).unwrap();
        let before = g.len_nodes();

        g.detach(a);
        assert_eq!(g.len_nodes(), before - 3);
        g.detach(a);
        assert_eq!(g.len_nodes(), before - 3);
        g.detach(NodeId(9_999));
    }
}
