//! Inbound chat messages and role normalization.
//!
//! Both wire protocols send `{role, content}` pairs but spell roles
//! differently (`human` / `bot` in older Claude and chat clients). Everything
//! downstream of [`normalize`] only sees [`Role`].

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: serde_json::Value },
    Other(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    String(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Accepts a plain string, an array of content parts, or null (empty).
    pub fn from_value(value: serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::Null => Ok(MessageContent::String(String::new())),
            serde_json::Value::String(s) => Ok(MessageContent::String(s)),
            serde_json::Value::Array(arr) => {
                let parts: Vec<ContentPart> = serde_json::from_value(serde_json::Value::Array(arr))
                    .map_err(|e| e.to_string())?;
                Ok(MessageContent::Parts(parts))
            }
            _ => Err("content must be string or array".to_string()),
        }
    }

    /// Text parts joined with newlines; images and unknown blocks are dropped.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::String(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A message exactly as the client sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub role: String,
    pub content: MessageContent,
}

impl RawMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::String(content.into()),
        }
    }
}

impl<'de> Deserialize<'de> for RawMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct MessageHelper {
            role: String,
            #[serde(default)]
            content: serde_json::Value,
        }

        let helper = MessageHelper::deserialize(deserializer)?;
        if helper.role.is_empty() {
            return Err(serde::de::Error::custom("message role must not be empty"));
        }
        let content =
            MessageContent::from_value(helper.content).map_err(serde::de::Error::custom)?;

        Ok(RawMessage {
            role: helper.role,
            content,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    /// Any role outside the canonical set, kept verbatim.
    Other(String),
}

impl Role {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "system" => Role::System,
            "user" | "human" => Role::User,
            "assistant" | "bot" => Role::Assistant,
            _ => Role::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Other(s) => s,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message after role normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

pub fn normalize(messages: &[RawMessage]) -> Vec<Message> {
    messages
        .iter()
        .map(|m| Message::new(Role::parse(&m.role), m.content.as_text()))
        .collect()
}
