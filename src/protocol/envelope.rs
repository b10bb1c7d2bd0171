//! Message Envelope
//!
//! Wire format for every CWDTP frame. Each WebSocket text frame carries one
//! JSON envelope:
//!
//! ```text
//! { "event": "player_move", "meta": { "cid": "..." }, "data": [ ... ] }
//! ```
//!
//! Events in the reserved `cwdtp::` namespace are control messages and are
//! parsed into [`ControlMessage`]; everything else is application traffic.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::Map;
use thiserror::Error;

use super::value::Value;

/// Namespace prefix of control event names.
pub const CONTROL_PREFIX: &str = "cwdtp::";

/// Decode/encode failures. Always the result of bad input, never a panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Structural violation of the envelope shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Metadata key outside the recognised set.
    #[error("invalid metadata key: {0}")]
    InvalidMetadata(String),
}

// =============================================================================
// METADATA
// =============================================================================

/// Recognised metadata keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetaKey {
    /// Handshake challenge.
    ReqKey,
    /// Handshake response.
    ResKey,
    /// Close reason.
    Reason,
    /// Close error flag.
    Error,
    /// Connection identifier.
    Cid,
}

impl MetaKey {
    /// Every recognised key.
    pub const ALL: [MetaKey; 5] = [
        MetaKey::ReqKey,
        MetaKey::ResKey,
        MetaKey::Reason,
        MetaKey::Error,
        MetaKey::Cid,
    ];

    /// Key as it appears on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            MetaKey::ReqKey => "req_key",
            MetaKey::ResKey => "res_key",
            MetaKey::Reason => "reason",
            MetaKey::Error => "error",
            MetaKey::Cid => "cid",
        }
    }
}

impl FromStr for MetaKey {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetaKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| CodecError::InvalidMetadata(s.to_string()))
    }
}

/// Envelope metadata, restricted to [`MetaKey`] entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta(BTreeMap<MetaKey, String>);

impl Meta {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from string pairs, rejecting unknown keys.
    pub fn from_pairs<K, V, I>(pairs: I) -> Result<Self, CodecError>
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut meta = Self::new();
        for (key, value) in pairs {
            meta.insert(key.as_ref(), value)?;
        }
        Ok(meta)
    }

    /// Insert by wire key name.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) -> Result<(), CodecError> {
        let key = key.parse::<MetaKey>()?;
        self.0.insert(key, value.into());
        Ok(())
    }

    /// Builder-style typed insert.
    pub fn with(mut self, key: MetaKey, value: impl Into<String>) -> Self {
        self.0.insert(key, value.into());
        self
    }

    /// Look up a value.
    pub fn get(&self, key: MetaKey) -> Option<&str> {
        self.0.get(&key).map(String::as_str)
    }

    /// Whether no entries are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn to_wire(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }

    fn from_wire(map: Map<String, serde_json::Value>) -> Result<Self, CodecError> {
        let mut meta = Self::new();
        for (key, value) in map {
            let key = key.parse::<MetaKey>()?;
            let serde_json::Value::String(value) = value else {
                return Err(CodecError::Malformed(format!(
                    "meta value for {} must be a string",
                    key.as_str()
                )));
            };
            meta.0.insert(key, value);
        }
        Ok(meta)
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// One protocol message unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Restricted metadata.
    pub meta: Meta,
    /// Ordered payload values.
    pub data: Vec<Value>,
}

impl Envelope {
    /// Create an envelope.
    pub fn new(event: impl Into<String>, meta: Meta, data: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            meta,
            data,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, CodecError> {
        self.data.iter().try_for_each(Value::check_encodable)?;
        let mut map = Map::new();
        map.insert("event".into(), serde_json::Value::String(self.event.clone()));
        map.insert("meta".into(), self.meta.to_wire());
        map.insert(
            "data".into(),
            serde_json::Value::Array(self.data.iter().map(Value::to_wire).collect()),
        );
        serde_json::to_string(&serde_json::Value::Object(map))
            .map_err(|e| CodecError::Malformed(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let json: serde_json::Value =
            serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;

        let serde_json::Value::Object(mut map) = json else {
            return Err(CodecError::Malformed("envelope must be an object".into()));
        };
        if map.len() != 3 {
            return Err(CodecError::Malformed(
                "envelope must have exactly event, meta and data".into(),
            ));
        }

        let event = match map.remove("event") {
            Some(serde_json::Value::String(event)) if !event.is_empty() => event,
            Some(serde_json::Value::String(_)) => {
                return Err(CodecError::Malformed("event name is empty".into()))
            }
            _ => return Err(CodecError::Malformed("event must be a string".into())),
        };
        let meta = match map.remove("meta") {
            Some(serde_json::Value::Object(meta)) => Meta::from_wire(meta)?,
            _ => return Err(CodecError::Malformed("meta must be an object".into())),
        };
        let data = match map.remove("data") {
            Some(serde_json::Value::Array(items)) => items
                .into_iter()
                .map(Value::from_wire)
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(CodecError::Malformed("data must be an array".into())),
        };

        Ok(Self { event, meta, data })
    }
}

/// Encode an event, metadata and values in one call.
pub fn encode(event: &str, meta: Meta, data: Vec<Value>) -> Result<String, CodecError> {
    Envelope::new(event, meta, data).encode()
}

/// Decode a text frame.
pub fn decode(text: &str) -> Result<Envelope, CodecError> {
    Envelope::decode(text)
}

// =============================================================================
// CONTROL MESSAGES
// =============================================================================

/// Kinds of control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    /// Handshake challenge from the initiator.
    Hello,
    /// Handshake response from the acceptor.
    HelloAck,
    /// Liveness probe from the acceptor.
    Ping,
    /// Liveness reply from the initiator.
    Pong,
    /// Close request.
    Close,
    /// Close acknowledgement.
    CloseAck,
}

impl ControlKind {
    /// Every control kind.
    pub const ALL: [ControlKind; 6] = [
        ControlKind::Hello,
        ControlKind::HelloAck,
        ControlKind::Ping,
        ControlKind::Pong,
        ControlKind::Close,
        ControlKind::CloseAck,
    ];

    /// Name without the namespace.
    pub fn bare_name(self) -> &'static str {
        match self {
            ControlKind::Hello => "hello",
            ControlKind::HelloAck => "hello-ack",
            ControlKind::Ping => "ping",
            ControlKind::Pong => "pong",
            ControlKind::Close => "close",
            ControlKind::CloseAck => "close-ack",
        }
    }

    /// Full event name on the wire.
    pub fn event_name(self) -> &'static str {
        match self {
            ControlKind::Hello => "cwdtp::hello",
            ControlKind::HelloAck => "cwdtp::hello-ack",
            ControlKind::Ping => "cwdtp::ping",
            ControlKind::Pong => "cwdtp::pong",
            ControlKind::Close => "cwdtp::close",
            ControlKind::CloseAck => "cwdtp::close-ack",
        }
    }

    /// Match a full wire event name.
    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.event_name() == name)
    }

    /// Match a bare name.
    pub fn from_bare_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.bare_name() == name)
    }
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// Whether an event name is reserved for control traffic.
///
/// Covers the whole `cwdtp::` namespace and the bare control words.
pub fn is_reserved_event(name: &str) -> bool {
    name.starts_with(CONTROL_PREFIX) || ControlKind::from_bare_name(name).is_some()
}

/// A parsed control message with its fixed field set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Handshake challenge.
    Hello {
        /// Random opaque request key.
        req_key: String,
    },
    /// Handshake response.
    HelloAck {
        /// Key derived from the request key.
        res_key: String,
        /// Connection identifier minted by the acceptor.
        cid: String,
    },
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Close request.
    Close {
        /// Whether the close is due to an error.
        error: bool,
        /// Human-readable reason.
        reason: String,
    },
    /// Close acknowledgement.
    CloseAck,
}

impl ControlMessage {
    /// Kind of this message.
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlMessage::Hello { .. } => ControlKind::Hello,
            ControlMessage::HelloAck { .. } => ControlKind::HelloAck,
            ControlMessage::Ping => ControlKind::Ping,
            ControlMessage::Pong => ControlKind::Pong,
            ControlMessage::Close { .. } => ControlKind::Close,
            ControlMessage::CloseAck => ControlKind::CloseAck,
        }
    }

    /// Build the envelope for this message.
    pub fn to_envelope(&self) -> Envelope {
        let meta = match self {
            ControlMessage::Hello { req_key } => Meta::new().with(MetaKey::ReqKey, req_key.clone()),
            ControlMessage::HelloAck { res_key, cid } => Meta::new()
                .with(MetaKey::ResKey, res_key.clone())
                .with(MetaKey::Cid, cid.clone()),
            ControlMessage::Close { error, reason } => Meta::new()
                .with(MetaKey::Error, error.to_string())
                .with(MetaKey::Reason, reason.clone()),
            ControlMessage::Ping | ControlMessage::Pong | ControlMessage::CloseAck => Meta::new(),
        };
        Envelope::new(self.kind().event_name(), meta, Vec::new())
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, CodecError> {
        self.to_envelope().encode()
    }

    fn from_envelope(kind: ControlKind, meta: &Meta) -> Result<Self, CodecError> {
        let require = |key: MetaKey| {
            meta.get(key).map(str::to_string).ok_or_else(|| {
                CodecError::Malformed(format!("{kind} is missing {}", key.as_str()))
            })
        };

        Ok(match kind {
            ControlKind::Hello => ControlMessage::Hello {
                req_key: require(MetaKey::ReqKey)?,
            },
            ControlKind::HelloAck => ControlMessage::HelloAck {
                res_key: require(MetaKey::ResKey)?,
                cid: require(MetaKey::Cid)?,
            },
            ControlKind::Ping => ControlMessage::Ping,
            ControlKind::Pong => ControlMessage::Pong,
            ControlKind::Close => {
                let error = match meta.get(MetaKey::Error) {
                    None | Some("false") => false,
                    Some("true") => true,
                    Some(other) => {
                        return Err(CodecError::Malformed(format!(
                            "close error flag must be true or false, got {other}"
                        )))
                    }
                };
                ControlMessage::Close {
                    error,
                    reason: meta.get(MetaKey::Reason).unwrap_or_default().to_string(),
                }
            }
            ControlKind::CloseAck => ControlMessage::CloseAck,
        })
    }
}

/// A received frame, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Protocol control traffic.
    Control(ControlMessage),
    /// Application event.
    Application {
        /// Event name.
        event: String,
        /// Payload values.
        data: Vec<Value>,
    },
}

/// Why a decoded envelope could not be classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The envelope itself failed to decode.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A peer used a reserved name that is not a known control message.
    #[error("reserved event name used by peer: {0}")]
    ReservedCollision(String),
}

impl Frame {
    /// Classify a decoded envelope.
    pub fn classify(envelope: Envelope) -> Result<Self, FrameError> {
        if let Some(kind) = ControlKind::from_event_name(&envelope.event) {
            return Ok(Frame::Control(ControlMessage::from_envelope(kind, &envelope.meta)?));
        }
        if is_reserved_event(&envelope.event) {
            return Err(FrameError::ReservedCollision(envelope.event));
        }
        Ok(Frame::Application {
            event: envelope.event,
            data: envelope.data,
        })
    }

    /// Decode and classify a text frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Self::classify(Envelope::decode(text)?)
    }
}
