//! Model registry.
//!
//! Objects carrying a `"@"` discriminator are bound to a registered model
//! when they are attached. The binding is resolved once, at attach time, by
//! calling the registered factory; nothing is re-typed afterwards.

mod versioner;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use smol_str::SmolStr;

pub use versioner::{Migration, Versioner, recorded_version};

/// Upcast helper so typed access can downcast boxed models.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Behaviour attached to a model instance in the graph.
///
/// The instance's data lives in the graph node; the model value holds
/// whatever derived, non-replicated state the type wants.
pub trait Model: AsAny + Send {
    /// Called once per hydration, after versioning, with the instance's
    /// fields as they stand at the end of the enclosing mutation.
    ///
    /// Runs while the owning replica is locked: reading or mutating that
    /// replica from here deadlocks.
    fn init(&mut self, _fields: &Map<String, Value>) {}

    /// Called once when an initialized instance leaves the graph.
    fn cleanup(&mut self) {}
}

/// Static side of a model type, used by [`Registry::register`].
pub trait ModelType: Model + Sized {
    const NAME: &'static str;

    fn create() -> Self;

    fn versioner() -> Option<Versioner> {
        None
    }
}

type Factory = Arc<dyn Fn() -> Box<dyn Model> + Send + Sync>;

#[derive(Clone)]
struct Entry {
    factory: Factory,
    versioner: Option<Versioner>,
}

/// Maps discriminator strings to model factories.
#[derive(Clone, Default)]
pub struct Registry {
    models: HashMap<SmolStr, Entry>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed model under its `NAME`.
    pub fn register<T: ModelType>(&mut self) -> &mut Self {
        self.register_with(
            T::NAME,
            || Box::new(T::create()) as Box<dyn Model>,
            T::versioner(),
        )
    }

    /// Register a model by name with an explicit factory.
    pub fn register_with<F>(
        &mut self,
        name: impl Into<SmolStr>,
        factory: F,
        versioner: Option<Versioner>,
    ) -> &mut Self
    where
        F: Fn() -> Box<dyn Model> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.models.contains_key(&name) {
            tracing::warn!(model = %name, "model registered twice, replacing");
        }
        self.models.insert(
            name,
            Entry {
                factory: Arc::new(factory),
                versioner,
            },
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Construct a new instance of the named model.
    pub fn create(&self, name: &str) -> Option<Box<dyn Model>> {
        self.models.get(name).map(|entry| (entry.factory)())
    }

    pub fn versioner(&self, name: &str) -> Option<&Versioner> {
        self.models.get(name).and_then(|entry| entry.versioner.as_ref())
    }

    /// Latest declared version for the model, 0 without a versioner.
    pub fn latest_version(&self, name: &str) -> u32 {
        self.versioner(name).map(Versioner::latest).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        inits: usize,
    }

    impl Model for Counter {
        fn init(&mut self, _fields: &Map<String, Value>) {
            self.inits += 1;
        }
    }

    impl ModelType for Counter {
        const NAME: &'static str = "Counter";

        fn create() -> Self {
            Self::default()
        }

        fn versioner() -> Option<Versioner> {
            Some(Versioner::new().step(1, |_| Ok(())).step(4, |_| Ok(())))
        }
    }

    #[test]
    fn test_register_and_create() {
        let mut registry = Registry::new();
        registry.register::<Counter>();

        assert!(registry.contains("Counter"));
        assert_eq!(registry.latest_version("Counter"), 4);

        let mut model = registry.create("Counter").unwrap();
        model.init(&Map::new());
        let counter = (*model).as_any().downcast_ref::<Counter>().unwrap();
        assert_eq!(counter.inits, 1);
    }

    #[test]
    fn test_unknown_model() {
        let registry = Registry::new();
        assert!(registry.create("Nope").is_none());
        assert_eq!(registry.latest_version("Nope"), 0);
    }
}
