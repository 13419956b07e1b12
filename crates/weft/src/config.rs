use std::time::Duration;

use crate::error::ConfigError;

/// What to do when an object names a model the registry does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingModelPolicy {
    /// Fail the attach with `AttachError::MissingModel`.
    #[default]
    Strict,
    /// Log a warning and treat the object as plain data.
    Allow,
}

impl std::str::FromStr for MissingModelPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "allow" | "allow-missing" => Ok(Self::Allow),
            other => Err(format!("expected `strict` or `allow`, got `{other}`")),
        }
    }
}

/// Engine runtime configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Quiet period before a debounced save is written.
    pub save_debounce: Duration,
    /// How often a mutex waiter probes the holder.
    pub ping_interval: Duration,
    /// How long a ping may take before the peer counts as unreachable.
    pub ping_timeout: Duration,
    /// How often the authoritative side checks for consumers.
    pub reclaim_interval: Duration,
    pub missing_models: MissingModelPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(500),
            ping_interval: Duration::from_millis(1000),
            ping_timeout: Duration::from_millis(500),
            reclaim_interval: Duration::from_millis(5000),
            missing_models: MissingModelPolicy::Strict,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional env vars (defaults in parentheses):
    /// - `WEFT_SAVE_DEBOUNCE_MS` (500)
    /// - `WEFT_PING_INTERVAL_MS` (1000)
    /// - `WEFT_PING_TIMEOUT_MS` (500)
    /// - `WEFT_RECLAIM_INTERVAL_MS` (5000)
    /// - `WEFT_MISSING_MODELS`: `strict` or `allow` (strict)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let millis = |field: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(field) {
                None => Ok(default),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|e| ConfigError::Invalid {
                        field,
                        message: e.to_string(),
                    }),
            }
        };

        let missing_models = match lookup("WEFT_MISSING_MODELS") {
            None => defaults.missing_models,
            Some(raw) => raw.parse().map_err(|message| ConfigError::Invalid {
                field: "WEFT_MISSING_MODELS",
                message,
            })?,
        };

        Ok(Self {
            save_debounce: millis("WEFT_SAVE_DEBOUNCE_MS", defaults.save_debounce)?,
            ping_interval: millis("WEFT_PING_INTERVAL_MS", defaults.ping_interval)?,
            ping_timeout: millis("WEFT_PING_TIMEOUT_MS", defaults.ping_timeout)?,
            reclaim_interval: millis("WEFT_RECLAIM_INTERVAL_MS", defaults.reclaim_interval)?,
            missing_models,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.save_debounce, Duration::from_millis(500));
        assert_eq!(config.missing_models, MissingModelPolicy::Strict);
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("WEFT_SAVE_DEBOUNCE_MS", "20"),
            ("WEFT_MISSING_MODELS", "allow"),
        ]))
        .unwrap();
        assert_eq!(config.save_debounce, Duration::from_millis(20));
        assert_eq!(config.missing_models, MissingModelPolicy::Allow);
    }

    #[test]
    fn test_invalid_value() {
        let err = EngineConfig::from_lookup(lookup(&[("WEFT_PING_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "WEFT_PING_TIMEOUT_MS",
                ..
            }
        ));
    }
}
