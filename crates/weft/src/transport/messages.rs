//! Wire protocol between peers.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use super::PeerId;
use crate::error::TransportError;
use crate::location::Location;

/// Coordination mutex traffic.
pub const MUTEX_TOPIC: &str = "weft/mutex";
/// Liveness probes.
pub const PING_TOPIC: &str = "weft/ping";
/// Satellite -> authoritative connect signalling.
pub const CONNECT_TOPIC: &str = "weft/connect";

/// Incremental document updates for one location.
pub fn update_topic(location: &Location) -> String {
    format!("weft/update/{}", location.topic())
}

/// Full-document requests for one location.
pub fn doc_topic(location: &Location) -> String {
    format!("weft/doc/{}", location.topic())
}

/// "Is anyone still using this location" queries.
pub fn status_topic(location: &Location) -> String {
    format!("weft/status/{}", location.topic())
}

/// Messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Loro update bytes: everything committed since the sender's last delta.
    Update { data: Vec<u8> },

    /// Ask whoever holds the location for its whole document.
    GetDoc,

    /// Reply to `GetDoc`; `None` when the responder has nothing loaded.
    Doc { data: Option<Vec<u8>> },

    /// A peer is claiming a named mutex.
    MutexStart { name: SmolStr, holder: PeerId },

    /// Reply to `MutexStart` or `MutexQuery` from the current holder.
    MutexBusy { holder: PeerId, performing: bool },

    /// The holder finished, or withdrew its claim.
    MutexDone { name: SmolStr, holder: PeerId },

    /// Does the addressed peer still hold `name`?
    MutexQuery { name: SmolStr },

    Ping,
    Pong,

    /// Ask the authoritative side to connect a location it has defined.
    Connect { location: Location },

    /// Acknowledges `Connect`.
    Connected,

    /// Does the responder still consider this location connected?
    Status,

    StatusReply { connected: bool },
}

impl WireMessage {
    /// Serialize message to postcard bytes for wire transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        postcard::to_stdvec(self).map_err(TransportError::Encode)
    }

    /// Deserialize message from postcard bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        postcard::from_bytes(bytes).map_err(TransportError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutex_start_wire_format() {
        let msg = WireMessage::MutexStart {
            name: "load/app/todos/main".into(),
            holder: PeerId::new(3),
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(WireMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let err = WireMessage::from_bytes(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[test]
    fn test_topics_are_per_location() {
        let a = Location::new("app", "todos", "a");
        let b = Location::new("app", "todos", "b");
        assert_ne!(update_topic(&a), update_topic(&b));
        assert_ne!(update_topic(&a), doc_topic(&a));
    }
}
