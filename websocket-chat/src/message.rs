use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientToServer {
    Chat { text: String },
    SetUsername { username: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerToClient {
    Chat {
        username: String,
        message: String,
        timestamp: String,
    },
    System {
        message: String,
        timestamp: String,
    },
    UserCount {
        count: usize,
        users: Vec<String>,
        timestamp: String,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload is not valid JSON for this protocol: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload has no string `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
}

impl ClientToServer {
    const TAGS: &'static [&'static str] = &["chat", "setUsername"];

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        decode_tagged(raw, Self::TAGS)
    }
}

impl ServerToClient {
    const TAGS: &'static [&'static str] = &["chat", "system", "userCount"];

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        decode_tagged(raw, Self::TAGS)
    }

    pub fn chat(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Chat {
            username: username.into(),
            message: message.into(),
            timestamp: timestamp(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
            timestamp: timestamp(),
        }
    }

    pub fn user_count(users: Vec<String>) -> Self {
        Self::UserCount {
            count: users.len(),
            users,
            timestamp: timestamp(),
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Server-assigned timestamp in RFC 3339 with millisecond precision, UTC.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// The tag is checked against the closed set before the variant body is
// deserialized so unknown types surface as their own error.
fn decode_tagged<T: DeserializeOwned>(raw: &str, tags: &[&str]) -> Result<T, ProtocolError> {
    let value: Value = serde_json::from_str(raw)?;
    let tag = match value.get("type") {
        Some(Value::String(tag)) => tag,
        _ => return Err(ProtocolError::MissingType),
    };
    if !tags.contains(&tag.as_str()) {
        return Err(ProtocolError::UnknownType(tag.clone()));
    }
    Ok(serde_json::from_value(value)?)
}
