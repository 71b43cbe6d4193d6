//! JSON envelopes and the reserved control fields.
//!
//! Reserved fields live at the top level of every JSON body:
//!
//! | Field      | Meaning                          |
//! |------------|----------------------------------|
//! | `_msgtype` | message type                     |
//! | `_sid`     | session id                       |
//! | `_seq`     | sequence number (reliable only)  |
//! | `_ack`     | next sequence expected from peer |
//!
//! They are stripped before a message reaches an application handler.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::{
    ACK_FIELD, MSGTYPE_FIELD, Protocol, SEQ_FIELD, SESSION_ID_FIELD, SessionError, SessionResult,
};
use crate::crypto::CipherType;

/// A JSON message body with typed access to the reserved fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    fields: Map<String, Value>,
}

impl Envelope {
    /// An envelope carrying only a message type.
    pub fn new(msg_type: &str) -> Self {
        let mut envelope = Self::default();
        envelope.set_msg_type(msg_type);
        envelope
    }

    /// Wrap an application body, which must be a JSON object or null.
    pub fn from_body(msg_type: &str, body: Value) -> SessionResult<Self> {
        let fields = match body {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(SessionError::Envelope(format!(
                    "body must be a JSON object, got {other}"
                )));
            }
        };
        let mut envelope = Self { fields };
        envelope.set_msg_type(msg_type);
        Ok(envelope)
    }

    /// Parse a received body.
    pub fn decode(bytes: &[u8]) -> SessionResult<Self> {
        match serde_json::from_slice(bytes) {
            Ok(Value::Object(fields)) => Ok(Self { fields }),
            Ok(other) => Err(SessionError::Envelope(format!("not a JSON object: {other}"))),
            Err(e) => Err(SessionError::Envelope(e.to_string())),
        }
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Vec<u8> {
        // A map of JSON values always serializes.
        serde_json::to_vec(&self.fields).unwrap_or_default()
    }

    /// The message type; empty for pure acknowledgments.
    pub fn msg_type(&self) -> &str {
        self.fields
            .get(MSGTYPE_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Set the message type.
    pub fn set_msg_type(&mut self, msg_type: &str) {
        if msg_type.is_empty() {
            self.fields.remove(MSGTYPE_FIELD);
        } else {
            self.fields
                .insert(MSGTYPE_FIELD.to_string(), Value::from(msg_type));
        }
    }

    /// The session id field.
    pub fn session_id(&self) -> Option<&str> {
        self.fields
            .get(SESSION_ID_FIELD)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Set or clear the session id field.
    pub fn set_session_id(&mut self, sid: Option<&str>) {
        match sid {
            Some(sid) => {
                self.fields
                    .insert(SESSION_ID_FIELD.to_string(), Value::from(sid));
            }
            None => {
                self.fields.remove(SESSION_ID_FIELD);
            }
        }
    }

    /// The sequence field.
    pub fn seq(&self) -> Option<u32> {
        self.u32_field(SEQ_FIELD)
    }

    /// Set the sequence field.
    pub fn set_seq(&mut self, seq: u32) {
        self.fields.insert(SEQ_FIELD.to_string(), Value::from(seq));
    }

    /// The ack field.
    pub fn ack(&self) -> Option<u32> {
        self.u32_field(ACK_FIELD)
    }

    /// Set the ack field.
    pub fn set_ack(&mut self, ack: u32) {
        self.fields.insert(ACK_FIELD.to_string(), Value::from(ack));
    }

    /// Remove the sequence and session fields before a resend.
    pub fn clear_stamps(&mut self) {
        self.fields.remove(SEQ_FIELD);
        self.fields.remove(SESSION_ID_FIELD);
    }

    /// Any field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// The body with every reserved field removed.
    pub fn into_body(mut self) -> Value {
        for name in [MSGTYPE_FIELD, SESSION_ID_FIELD, SEQ_FIELD, ACK_FIELD] {
            self.fields.remove(name);
        }
        Value::Object(self.fields)
    }

    fn u32_field(&self, name: &str) -> Option<u32> {
        self.fields
            .get(name)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }
}

/// A message held by the session for later sending or resending.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub(crate) envelope: Envelope,
    pub(crate) encryption: Option<CipherType>,
}

impl QueuedMessage {
    /// The message type.
    pub fn msg_type(&self) -> &str {
        self.envelope.msg_type()
    }

    /// A field of the body.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.envelope.get(name)
    }
}

/// A message delivered to an application handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Protocol it arrived on.
    pub protocol: Protocol,
    /// Message type.
    pub msg_type: String,
    /// Body without reserved fields.
    pub body: Value,
}

/// An application message to send.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub(crate) msg_type: String,
    pub(crate) body: Value,
    pub(crate) protocol: Option<Protocol>,
    pub(crate) encryption: Option<CipherType>,
    pub(crate) expected_reply: Option<(String, f32)>,
}

impl OutgoingMessage {
    /// A message with the given type and JSON object body.
    pub fn new(msg_type: impl Into<String>, body: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            body,
            protocol: None,
            encryption: None,
            expected_reply: None,
        }
    }

    /// Send over a specific protocol.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Override the cipher.
    pub fn encryption(mut self, cipher: CipherType) -> Self {
        self.encryption = Some(cipher);
        self
    }

    /// Expect `reply_type` within `timeout` seconds; the session's reply
    /// timeout callback fires otherwise.
    pub fn expect_reply(mut self, reply_type: impl Into<String>, timeout: f32) -> Self {
        self.expected_reply = Some((reply_type.into(), timeout));
        self
    }
}

/// Body of `_sc_redirect`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RedirectCommand {
    /// New server host.
    pub host: String,
    /// Token to present to the new server.
    pub token: String,
    /// Ports per protocol.
    #[serde(default)]
    pub ports: Vec<RedirectPort>,
}

/// One entry of [`RedirectCommand::ports`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RedirectPort {
    /// Protocol code: 1 TCP, 2 UDP, 3 HTTP.
    pub protocol: i64,
    /// Port on the new host.
    pub port: u16,
}

/// Body of the `_cs_redirect_connect` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RedirectResult {
    /// Zero on success.
    pub result: i64,
}

impl RedirectResult {
    /// Whether the new server accepted the token.
    pub fn is_success(self) -> bool {
        self.result == 0
    }
}
