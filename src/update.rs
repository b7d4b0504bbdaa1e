use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DispatchError;

/// Identifies the chat/session an update came from and replies go to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for SessionId {
    fn from(chat_id: i64) -> Self {
        Self(chat_id.to_string())
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Handler match key. Commands and update kinds are separate namespaces,
/// so `/text` never reaches the plain-text handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    /// `/name`, matched case-insensitively
    Command(String),
    /// `text`, `callback` or a platform event kind
    Kind(String),
}

impl RouteKey {
    /// `/name` is a command key, anything else is a kind key
    pub fn parse(key: &str) -> Self {
        let key = key.trim();
        match key.strip_prefix('/') {
            Some(name) => RouteKey::Command(name.to_lowercase()),
            None => RouteKey::Kind(key.to_string()),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKey::Command(name) => write!(f, "/{}", name),
            RouteKey::Kind(kind) => f.write_str(kind),
        }
    }
}

/// What the update carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// `/name args`
    Command { name: String, args: String },
    /// Plain text message
    Text { text: String },
    /// Inline button press
    Callback { data: String },
    /// Any other platform event
    Event { kind: String },
}

impl Payload {
    /// Classify a text message as a command or plain text.
    /// `/Start_Meal@MealBot now` becomes command `start_meal` with args `now`.
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        if let Some(rest) = trimmed.strip_prefix('/') {
            let (head, args) = match rest.split_once(char::is_whitespace) {
                Some((head, args)) => (head, args.trim()),
                None => (rest, ""),
            };
            let name = head.split('@').next().unwrap_or_default();
            if !name.is_empty() {
                return Payload::Command {
                    name: name.to_lowercase(),
                    args: args.to_string(),
                };
            }
        }
        Payload::Text {
            text: text.to_string(),
        }
    }

    /// The key handlers are registered under
    pub fn route_key(&self) -> RouteKey {
        match self {
            Payload::Command { name, .. } => RouteKey::Command(name.clone()),
            Payload::Text { .. } => RouteKey::Kind("text".to_string()),
            Payload::Callback { .. } => RouteKey::Kind("callback".to_string()),
            Payload::Event { kind } => RouteKey::Kind(kind.clone()),
        }
    }
}

/// One inbound event from the chat platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    /// Monotonic per-stream identifier, used for deduplication
    pub id: u64,
    pub source: SessionId,
    pub payload: Payload,
}

impl Update {
    pub fn new(id: u64, source: impl Into<SessionId>, payload: Payload) -> Self {
        Self {
            id,
            source: source.into(),
            payload,
        }
    }

    pub fn route_key(&self) -> RouteKey {
        self.payload.route_key()
    }

    /// Text of a plain message, if any
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Decode the platform-neutral JSON envelope
    pub fn from_json(raw: &[u8]) -> Result<Self, DispatchError> {
        let envelope: Envelope = serde_json::from_slice(raw).map_err(DispatchError::malformed)?;
        envelope.try_into()
    }
}

/// Wire shape: `{"id": 1, "kind": "text", "source": "42", "text": "/start"}`
#[derive(Debug, Deserialize)]
struct Envelope {
    id: u64,
    kind: String,
    source: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

impl TryFrom<Envelope> for Update {
    type Error = DispatchError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        if envelope.source.trim().is_empty() {
            return Err(DispatchError::malformed("empty source"));
        }

        let payload = match envelope.kind.as_str() {
            "" => return Err(DispatchError::malformed("empty kind")),
            "text" => {
                let text = envelope
                    .text
                    .ok_or_else(|| DispatchError::malformed("text update without 'text'"))?;
                Payload::from_text(&text)
            }
            "callback" => {
                let data = envelope
                    .data
                    .ok_or_else(|| DispatchError::malformed("callback update without 'data'"))?;
                Payload::Callback { data }
            }
            other => Payload::Event {
                kind: other.to_string(),
            },
        };

        Ok(Update {
            id: envelope.id,
            source: SessionId::new(envelope.source),
            payload,
        })
    }
}
