use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Identifies one replicated state: `(namespace, collection, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub namespace: SmolStr,
    pub collection: SmolStr,
    pub key: SmolStr,
}

impl Location {
    pub fn new(
        namespace: impl Into<SmolStr>,
        collection: impl Into<SmolStr>,
        key: impl Into<SmolStr>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Stable string id, `namespace/collection/key`.
    ///
    /// `%` and `/` inside a component are percent-encoded, so distinct
    /// locations never share an id.
    pub fn id(&self) -> String {
        format!(
            "{}/{}/{}",
            escape(&self.namespace),
            escape(&self.collection),
            escape(&self.key)
        )
    }

    /// Transport topic suffix for this location.
    ///
    /// A blake3 hash over the length-prefixed components so topics stay
    /// fixed-width regardless of how long the key is.
    pub fn topic(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for part in [&self.namespace, &self.collection, &self.key] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

fn escape(part: &str) -> Cow<'_, str> {
    if part.contains(['%', '/']) {
        Cow::Owned(part.replace('%', "%25").replace('/', "%2F"))
    } else {
        Cow::Borrowed(part)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_deterministic() {
        let a = Location::new("app", "todos", "main");
        let b = Location::new("app", "todos", "main");
        assert_eq!(a.topic(), b.topic());
        assert_eq!(a.id(), "app/todos/main");
    }

    #[test]
    fn test_topic_differs_per_key() {
        let a = Location::new("app", "todos", "main");
        let b = Location::new("app", "todos", "other");
        assert_ne!(a.topic(), b.topic());
    }

    #[test]
    fn test_separator_inside_component() {
        let a = Location::new("a/b", "c", "d");
        let b = Location::new("a", "b/c", "d");
        assert_ne!(a.id(), b.id());
        assert_ne!(a.topic(), b.topic());
        assert_eq!(a.id(), "a%2Fb/c/d");
        assert_ne!(Location::new("a%2Fb", "c", "d").id(), a.id());
    }
}
