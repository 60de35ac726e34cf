use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where an inbound message came from, which also decides the REST endpoint
/// family used for replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    /// Friend chat (openid-addressed, supports streaming).
    C2c,
    /// Guild direct message.
    Dm,
    /// Guild channel (@-mention).
    Guild,
    /// QQ group (@-mention, group_openid-addressed).
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub content_type: Option<String>,
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
}

/// Normalized inbound envelope handed to the reply pipeline. Raw gateway
/// payloads never cross this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub kind: ChatKind,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub content: String,
    pub message_id: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub group_openid: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl InboundEvent {
    /// The target string a reply to this event should address.
    pub fn reply_target(&self) -> SendTarget {
        match self.kind {
            ChatKind::C2c | ChatKind::Dm => SendTarget::C2c(self.sender_id.clone()),
            ChatKind::Group => {
                SendTarget::Group(self.group_openid.clone().unwrap_or_default())
            }
            ChatKind::Guild => {
                SendTarget::Channel(self.channel_id.clone().unwrap_or_default())
            }
        }
    }
}

/// Parsed outbound destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    C2c(String),
    Group(String),
    Channel(String),
}

impl SendTarget {
    /// Parse a target string: `[qqbot:](c2c:<openid>|group:<gOpenid>|channel:<cid>|<openid>)`.
    /// A bare 32-hex id is treated as a C2C openid.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.strip_prefix("qqbot:").unwrap_or(s);
        if let Some(id) = s.strip_prefix("c2c:") {
            return Ok(SendTarget::C2c(id.to_string()));
        }
        if let Some(id) = s.strip_prefix("group:") {
            return Ok(SendTarget::Group(id.to_string()));
        }
        if let Some(id) = s.strip_prefix("channel:") {
            return Ok(SendTarget::Channel(id.to_string()));
        }
        if is_bare_openid(s) {
            return Ok(SendTarget::C2c(s.to_string()));
        }
        Err(Error::PayloadInvalid(format!("unrecognized target: {}", s)))
    }

    pub fn format(&self) -> String {
        match self {
            SendTarget::C2c(id) => format!("qqbot:c2c:{}", id),
            SendTarget::Group(id) => format!("qqbot:group:{}", id),
            SendTarget::Channel(id) => format!("qqbot:channel:{}", id),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            SendTarget::C2c(id) | SendTarget::Group(id) | SendTarget::Channel(id) => id,
        }
    }
}

/// Openids are 32-char hex strings (the platform's opaque user ids).
fn is_bare_openid(s: &str) -> bool {
    s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// One image to deliver, classified by how it must reach the platform.
/// Only public URLs and data URLs go on the wire; local paths are read from
/// disk and rewritten to data URLs first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    PublicUrl(String),
    DataUrl(String),
    LocalPath(std::path::PathBuf),
}

/// A send request as the dispatcher sees it.
#[derive(Debug, Clone)]
pub struct OutboundIntent {
    pub target: SendTarget,
    pub text: Option<String>,
    pub media_sources: Vec<MediaSource>,
    /// Inbound message id this send replies to. Present → passive reply
    /// (subject to the reply window); absent → active message.
    pub reply_to: Option<String>,
    pub account_id: String,
}

impl OutboundIntent {
    pub fn text_to(target: SendTarget, account_id: &str, text: &str) -> Self {
        Self {
            target,
            text: Some(text.to_string()),
            media_sources: Vec::new(),
            reply_to: None,
            account_id: account_id.to_string(),
        }
    }
}

/// Outcome of one outbound send. Failures are values, not exceptions, so an
/// image-send failure can never mask a text-send failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OutboundResult {
    pub fn ok(message_id: Option<String>) -> Self {
        Self {
            message_id,
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            message_id: None,
            timestamp: None,
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
