//! The wire message catalog and its JSON codec (spec §4.6).
//!
//! Every message carries a monotonically increasing `index`, flat at the
//! same JSON level as its type-specific fields — not wrapped in an envelope
//! struct, since the wire traces in spec §8 show it inline. `Ping` always
//! carries `index: 0`; it is the one type never retransmitted by the
//! reliability layer (§4.8).

use jetstream_model::SyncFragment;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtocolError;

/// Either half of a `SessionCreateReply` (spec §4.6): "`replyTo`, either
/// `sessionToken` or `error`". An untagged inner enum flattened into the
/// outer tagged variant, rather than two `Option` fields, so the wire form
/// can never carry both or neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionCreateResult {
    Ok {
        #[serde(rename = "sessionToken")]
        session_token: String,
    },
    Err {
        error: String,
    },
}

/// Either half of a `ScopeFetchReply` (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeFetchResult {
    Ok {
        #[serde(rename = "scopeIndex")]
        scope_index: u32,
    },
    Err {
        error: String,
    },
}

/// Per-fragment outcome on the wire (spec §4.3: "`{ok}` or `{error}`").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum FragmentReplyWire {
    Ok { ok: bool },
    Err { error: String },
}

impl From<&jetstream_model::FragmentOutcome> for FragmentReplyWire {
    fn from(outcome: &jetstream_model::FragmentOutcome) -> Self {
        match outcome {
            jetstream_model::FragmentOutcome::Ok => FragmentReplyWire::Ok { ok: true },
            jetstream_model::FragmentOutcome::Error(msg) => {
                FragmentReplyWire::Err { error: msg.clone() }
            }
        }
    }
}

/// One wire message from spec §4.6's catalog table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    SessionCreate {
        index: u64,
        version: String,
        #[serde(default)]
        params: Value,
    },
    SessionCreateReply {
        index: u64,
        #[serde(rename = "replyTo")]
        reply_to: u64,
        #[serde(flatten)]
        result: SessionCreateResult,
    },
    ScopeFetch {
        index: u64,
        name: String,
        #[serde(default)]
        params: Value,
    },
    ScopeFetchReply {
        index: u64,
        #[serde(rename = "replyTo")]
        reply_to: u64,
        #[serde(flatten)]
        result: ScopeFetchResult,
    },
    ScopeState {
        index: u64,
        #[serde(rename = "scopeIndex")]
        scope_index: u32,
        #[serde(rename = "rootUUID")]
        root_uuid: Uuid,
        fragments: Vec<SyncFragment>,
    },
    ScopeSync {
        index: u64,
        #[serde(rename = "scopeIndex")]
        scope_index: u32,
        fragments: Vec<SyncFragment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        atomic: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        procedure: Option<String>,
    },
    ScopeSyncReply {
        index: u64,
        #[serde(rename = "replyTo")]
        reply_to: u64,
        #[serde(rename = "fragmentReplies")]
        fragment_replies: Vec<FragmentReplyWire>,
    },
    Ping {
        #[serde(default)]
        index: u64,
        ack: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[serde(rename = "resendMissing")]
        resend_missing: Option<bool>,
    },
    Reply {
        index: u64,
        #[serde(rename = "replyTo")]
        reply_to: u64,
        response: Value,
    },
}

impl Message {
    /// The common `index` field every variant carries (spec §4.6).
    pub fn index(&self) -> u64 {
        match self {
            Message::SessionCreate { index, .. }
            | Message::SessionCreateReply { index, .. }
            | Message::ScopeFetch { index, .. }
            | Message::ScopeFetchReply { index, .. }
            | Message::ScopeState { index, .. }
            | Message::ScopeSync { index, .. }
            | Message::ScopeSyncReply { index, .. }
            | Message::Ping { index, .. }
            | Message::Reply { index, .. } => *index,
        }
    }

    pub fn is_ping(&self) -> bool {
        matches!(self, Message::Ping { .. })
    }
}

/// Parse one frame's text into a batch of messages. Accepts either a single
/// JSON object or a JSON array (spec §4.6: "arrays of messages are
/// supported"). A `type` tag outside the wire catalog surfaces as
/// [`ProtocolError::UnknownMessageType`]; a recognized tag with a
/// missing/malformed field surfaces as [`ProtocolError::MalformedMessage`].
pub fn parse_batch(text: &str) -> Result<Vec<Message>, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
    parse_value_batch(value)
}

fn parse_value_batch(value: Value) -> Result<Vec<Message>, ProtocolError> {
    match value {
        Value::Array(items) => items.into_iter().map(parse_one).collect(),
        single => Ok(vec![parse_one(single)?]),
    }
}

/// Every `type` tag the wire catalog recognizes (spec §4.6), kept in sync
/// with [`Message`]'s variants so a malformed-but-recognized frame can be
/// told apart from a genuinely unknown one.
const KNOWN_MESSAGE_TYPES: &[&str] = &[
    "SessionCreate",
    "SessionCreateReply",
    "ScopeFetch",
    "ScopeFetchReply",
    "ScopeState",
    "ScopeSync",
    "ScopeSyncReply",
    "Ping",
    "Reply",
];

fn parse_one(value: Value) -> Result<Message, ProtocolError> {
    let type_tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MalformedJson("missing `type` field".to_string()))?
        .to_string();
    serde_json::from_value(value).map_err(|e| {
        if KNOWN_MESSAGE_TYPES.contains(&type_tag.as_str()) {
            ProtocolError::MalformedMessage { type_tag, reason: e.to_string() }
        } else {
            ProtocolError::UnknownMessageType(type_tag)
        }
    })
}

/// Small FIFO append buffer preserving outbound composition order even when
/// the underlying encoder/socket write is async (spec §4.6: "Composition of
/// outgoing messages preserves input order even when the underlying encoder
/// works asynchronously"). Guarded by a single mutex rather than an mpsc
/// channel, since a channel alone doesn't guarantee strict FIFO across
/// concurrent producers the way one mutex-serialized append-then-drain does.
#[derive(Default)]
pub struct OutboundQueue {
    pending: tokio::sync::Mutex<Vec<Message>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, msg: Message) {
        self.pending.lock().await.push(msg);
    }

    /// Drain everything queued so far, in the order it was pushed.
    pub async fn drain(&self) -> Vec<Message> {
        let mut guard = self.pending.lock().await;
        std::mem::take(&mut *guard)
    }
}
