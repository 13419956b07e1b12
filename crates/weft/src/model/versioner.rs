use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use smol_str::SmolStr;

use crate::error::{BoxError, MigrationError};
use crate::value::VERSION_KEY;

/// A single migration step, run against a plain snapshot of the instance.
pub type Migration = Arc<dyn Fn(&mut Map<String, Value>) -> Result<(), BoxError> + Send + Sync>;

/// Ascending migration steps keyed by integer version.
#[derive(Clone, Default)]
pub struct Versioner {
    steps: BTreeMap<u32, Migration>,
}

impl fmt::Debug for Versioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Versioner")
            .field("versions", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Versioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the migration that brings an instance up to `version`.
    pub fn step<F>(mut self, version: u32, migrate: F) -> Self
    where
        F: Fn(&mut Map<String, Value>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.steps.insert(version, Arc::new(migrate));
        self
    }

    /// Latest declared version, 0 if there are no steps.
    pub fn latest(&self) -> u32 {
        self.steps.keys().next_back().copied().unwrap_or(0)
    }

    /// Whether an instance at `current` has migrations to run.
    pub fn is_behind(&self, current: u32) -> bool {
        self.latest() > current
    }

    /// Run every step above `current` in ascending order, recording each
    /// version in `fields` as it completes. Returns the final version.
    pub fn migrate(
        &self,
        target: &str,
        current: u32,
        fields: &mut Map<String, Value>,
    ) -> Result<u32, MigrationError> {
        let mut version = current;
        for (&step_version, migrate) in self.steps.range(current.saturating_add(1)..) {
            migrate(fields).map_err(|source| MigrationError {
                target: SmolStr::new(target),
                version: step_version,
                source,
            })?;
            fields.insert(VERSION_KEY.to_string(), Value::from(step_version));
            version = step_version;
            tracing::debug!(target = %target, version, "migration applied");
        }
        Ok(version)
    }
}

/// Version recorded in a field map; missing or malformed means 0.
pub fn recorded_version(fields: &Map<String, Value>) -> u32 {
    fields
        .get(VERSION_KEY)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}
