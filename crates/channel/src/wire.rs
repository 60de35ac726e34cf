//! Typed gateway frames and intent bitmasks. Raw JSON is parsed into these
//! once, at the WebSocket boundary; nothing downstream touches untyped data.

use qqgate_core::{Attachment, ChatKind, InboundEvent};
use serde::{Deserialize, Serialize};

// Gateway opcodes (Discord-derived).
pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_RESUME: u8 = 6;
pub const OP_RECONNECT: u8 = 7;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

// Intent bits.
pub const INTENT_GUILDS: u32 = 1 << 0;
pub const INTENT_GUILD_MEMBERS: u32 = 1 << 1;
pub const INTENT_DIRECT_MESSAGE: u32 = 1 << 12;
pub const INTENT_GROUP_AND_C2C: u32 = 1 << 25;
pub const INTENT_PUBLIC_GUILD_MESSAGES: u32 = 1 << 30;

/// Capability downgrade ladder. Index 0 is the most privileged subscription;
/// an unresumable invalid-session advances one step. Accounts without the
/// group/C2C or DM capability land on the level their credentials support.
pub const INTENT_LEVELS: [u32; 3] = [
    INTENT_PUBLIC_GUILD_MESSAGES | INTENT_DIRECT_MESSAGE | INTENT_GROUP_AND_C2C,
    INTENT_PUBLIC_GUILD_MESSAGES | INTENT_GROUP_AND_C2C,
    INTENT_PUBLIC_GUILD_MESSAGES | INTENT_GUILD_MEMBERS,
];

/// Generic inbound frame. `d` stays raw until the op/t switch decides the
/// concrete payload type.
#[derive(Debug, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Option<serde_json::Value>,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HelloData {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Serialize)]
pub struct Identify {
    pub op: u8,
    pub d: IdentifyData,
}

#[derive(Debug, Serialize)]
pub struct IdentifyData {
    pub token: String,
    pub intents: u32,
    pub shard: [u32; 2],
}

impl Identify {
    pub fn new(access_token: &str, intents: u32) -> Self {
        Self {
            op: OP_IDENTIFY,
            d: IdentifyData {
                token: format!("QQBot {}", access_token),
                intents,
                shard: [0, 1],
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Resume {
    pub op: u8,
    pub d: ResumeData,
}

#[derive(Debug, Serialize)]
pub struct ResumeData {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

impl Resume {
    pub fn new(access_token: &str, session_id: &str, seq: u64) -> Self {
        Self {
            op: OP_RESUME,
            d: ResumeData {
                token: format!("QQBot {}", access_token),
                session_id: session_id.to_string(),
                seq,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Heartbeat {
    pub op: u8,
    pub d: Option<u64>,
}

impl Heartbeat {
    pub fn new(last_seq: Option<u64>) -> Self {
        Self {
            op: OP_HEARTBEAT,
            d: last_seq,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReadyData {
    pub session_id: String,
    #[serde(default)]
    pub user: Option<ReadyUser>,
}

#[derive(Debug, Deserialize)]
pub struct ReadyUser {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Author block of the four message-create events. Which id field is filled
/// depends on the event family; `openid()` picks the right one.
#[derive(Debug, Default, Deserialize)]
pub struct AuthorPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub user_openid: Option<String>,
    #[serde(default)]
    pub member_openid: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl AuthorPayload {
    pub fn openid(&self) -> Option<&str> {
        self.user_openid
            .as_deref()
            .or(self.member_openid.as_deref())
            .or(self.id.as_deref())
    }
}

#[derive(Debug, Deserialize)]
pub struct AttachmentPayload {
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

/// Union of the message-create payload fields across all four event types.
#[derive(Debug, Deserialize)]
pub struct MessageCreatePayload {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub author: AuthorPayload,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub group_openid: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
}

/// Map a dispatch event type string onto the chat kind it carries, or None
/// for event types this connector does not consume.
pub fn chat_kind_for_event(event_type: &str) -> Option<ChatKind> {
    match event_type {
        "C2C_MESSAGE_CREATE" => Some(ChatKind::C2c),
        "GROUP_AT_MESSAGE_CREATE" => Some(ChatKind::Group),
        "AT_MESSAGE_CREATE" => Some(ChatKind::Guild),
        "DIRECT_MESSAGE_CREATE" => Some(ChatKind::Dm),
        _ => None,
    }
}

/// Build the normalized inbound envelope from a dispatch payload. Returns
/// None when the payload has no usable sender.
pub fn normalize_event(kind: ChatKind, payload: MessageCreatePayload) -> Option<InboundEvent> {
    let sender_id = payload.author.openid()?.to_string();
    let timestamp_ms = payload
        .timestamp
        .as_deref()
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    let attachments = payload
        .attachments
        .into_iter()
        .filter_map(|a| {
            a.url.map(|url| Attachment {
                content_type: a.content_type,
                url,
                filename: a.filename,
            })
        })
        .collect();

    Some(InboundEvent {
        kind,
        sender_id,
        sender_name: payload.author.username,
        content: payload.content,
        message_id: payload.id,
        timestamp_ms,
        channel_id: payload.channel_id,
        guild_id: payload.guild_id,
        group_openid: payload.group_openid,
        attachments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_serialize() {
        let identify = Identify::new("tok123", INTENT_LEVELS[0]);
        let json = serde_json::to_string(&identify).unwrap();
        assert!(json.contains("\"op\":2"));
        assert!(json.contains("QQBot tok123"));
        assert!(json.contains("\"shard\":[0,1]"));
    }

    #[test]
    fn test_resume_serialize() {
        let resume = Resume::new("tok", "S1", 17);
        let json = serde_json::to_string(&resume).unwrap();
        assert!(json.contains("\"op\":6"));
        assert!(json.contains("\"session_id\":\"S1\""));
        assert!(json.contains("\"seq\":17"));
    }

    #[test]
    fn test_heartbeat_null_seq() {
        let hb = Heartbeat::new(None);
        assert_eq!(serde_json::to_string(&hb).unwrap(), r#"{"op":1,"d":null}"#);
        let hb = Heartbeat::new(Some(42));
        assert_eq!(serde_json::to_string(&hb).unwrap(), r#"{"op":1,"d":42}"#);
    }

    #[test]
    fn test_payload_deserialize() {
        let json = r#"{"op":0,"s":3,"t":"C2C_MESSAGE_CREATE","d":{"id":"m1","content":"hi","author":{"user_openid":"ABC"}}}"#;
        let p: GatewayPayload = serde_json::from_str(json).unwrap();
        assert_eq!(p.op, OP_DISPATCH);
        assert_eq!(p.s, Some(3));
        assert_eq!(p.t.as_deref(), Some("C2C_MESSAGE_CREATE"));
    }

    #[test]
    fn test_intent_ladder_strictly_narrows() {
        // Each downgrade step must drop capability, never add it.
        assert!(INTENT_LEVELS[0] & INTENT_DIRECT_MESSAGE != 0);
        assert!(INTENT_LEVELS[1] & INTENT_DIRECT_MESSAGE == 0);
        assert!(INTENT_LEVELS[1] & INTENT_GROUP_AND_C2C != 0);
        assert!(INTENT_LEVELS[2] & INTENT_GROUP_AND_C2C == 0);
        for level in INTENT_LEVELS {
            assert!(level & INTENT_PUBLIC_GUILD_MESSAGES != 0);
        }
    }

    #[test]
    fn test_normalize_c2c_event() {
        let payload: MessageCreatePayload = serde_json::from_str(
            r#"{"id":"m9","content":"你好","timestamp":"2024-05-01T12:00:00+08:00",
                "author":{"user_openid":"a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4"},
                "attachments":[{"content_type":"image/png","url":"https://x/y.png","filename":"y.png"}]}"#,
        )
        .unwrap();
        let ev = normalize_event(ChatKind::C2c, payload).unwrap();
        assert_eq!(ev.message_id, "m9");
        assert_eq!(ev.sender_id, "a1b2c3d4e5f6a1b2c3d4e5f6a1b2c3d4");
        assert_eq!(ev.attachments.len(), 1);
        assert!(ev.timestamp_ms > 0);
    }

    #[test]
    fn test_normalize_group_event() {
        let payload: MessageCreatePayload = serde_json::from_str(
            r#"{"id":"m2","content":"hello","group_openid":"G_OPENID",
                "author":{"member_openid":"M_OPENID"}}"#,
        )
        .unwrap();
        let ev = normalize_event(ChatKind::Group, payload).unwrap();
        assert_eq!(ev.sender_id, "M_OPENID");
        assert_eq!(ev.group_openid.as_deref(), Some("G_OPENID"));
    }

    #[test]
    fn test_normalize_guild_event() {
        let payload: MessageCreatePayload = serde_json::from_str(
            r#"{"id":"m3","content":"<@!bot> hi","channel_id":"CH","guild_id":"GU",
                "author":{"id":"U1","username":"alice"}}"#,
        )
        .unwrap();
        let ev = normalize_event(ChatKind::Guild, payload).unwrap();
        assert_eq!(ev.sender_id, "U1");
        assert_eq!(ev.sender_name.as_deref(), Some("alice"));
        assert_eq!(ev.channel_id.as_deref(), Some("CH"));
    }

    #[test]
    fn test_normalize_missing_sender_is_none() {
        let payload: MessageCreatePayload =
            serde_json::from_str(r#"{"id":"m4","content":"x","author":{}}"#).unwrap();
        assert!(normalize_event(ChatKind::C2c, payload).is_none());
    }

    #[test]
    fn test_unknown_event_type_ignored() {
        assert!(chat_kind_for_event("GUILD_MEMBER_ADD").is_none());
        assert_eq!(
            chat_kind_for_event("GROUP_AT_MESSAGE_CREATE"),
            Some(ChatKind::Group)
        );
    }
}
