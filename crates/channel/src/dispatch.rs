use std::sync::Arc;

use qqgate_core::{
    Account, ChatKind, Error, InboundEvent, MediaSource, OutboundIntent, OutboundResult,
    SendTarget,
};
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::images::resolve_images;
use crate::imgsize;
use crate::limiter::{FallbackReason, ReplyLimiter};
use crate::media::{normalize_source, MediaUploader};
use crate::rest::RestClient;
use crate::seq::MsgSeqCounter;

/// Routes outbound sends to the right endpoint family, enforcing the
/// passive-reply window with transparent fallback to active messages.
pub struct OutboundDispatcher {
    account: Account,
    rest: Arc<RestClient>,
    uploader: MediaUploader,
    seq: Arc<MsgSeqCounter>,
    limiter: Arc<ReplyLimiter>,
    /// Plain client for image size probes (no bot auth on third-party hosts).
    http: Client,
}

impl OutboundDispatcher {
    pub fn new(
        account: Account,
        rest: Arc<RestClient>,
        seq: Arc<MsgSeqCounter>,
        limiter: Arc<ReplyLimiter>,
        http: Client,
    ) -> Self {
        Self {
            uploader: MediaUploader::new(rest.clone()),
            account,
            rest,
            seq,
            limiter,
            http,
        }
    }

    pub fn seq(&self) -> &Arc<MsgSeqCounter> {
        &self.seq
    }

    pub fn account_id(&self) -> &str {
        &self.account.id
    }

    /// A streamed-reply sender for a C2C inbound event.
    pub fn stream_sender(&self, event: &InboundEvent) -> crate::stream::StreamSender {
        crate::stream::StreamSender::new(
            self.rest.clone(),
            self.seq.clone(),
            &event.sender_id,
            &event.message_id,
        )
    }

    /// Send one text message. Passive when `reply_to` survives the quota
    /// check, active otherwise; an active send with empty text fails before
    /// any REST call.
    pub async fn send_text(&self, intent: OutboundIntent) -> OutboundResult {
        let text = intent.text.as_deref().unwrap_or("").trim().to_string();
        let reply_to = self.resolve_reply_mode(intent.reply_to.as_deref());

        if reply_to.is_none() && text.is_empty() {
            return OutboundResult::err("content required for proactive message");
        }

        let msg_seq = reply_to.as_deref().map(|id| self.seq.next(id));
        let body = text_body(
            &text,
            self.account.markdown_support,
            msg_seq,
            reply_to.as_deref(),
        );
        let path = message_path(&intent.target);

        match self.rest.post_message(&path, &body).await {
            Ok(resp) => {
                if let Some(id) = reply_to.as_deref() {
                    self.limiter.record_reply(id);
                }
                debug!(target = %intent.target.format(), passive = reply_to.is_some(), "Text sent");
                OutboundResult::ok(extract_message_id(&resp))
            }
            Err(e) => OutboundResult::err(e.to_string()),
        }
    }

    /// Send one image (upload, then a `msg_type:7` message). Channel targets
    /// cannot carry rich media and degrade to a text with the URL appended.
    pub async fn send_media(
        &self,
        intent: &OutboundIntent,
        source: MediaSource,
    ) -> OutboundResult {
        if matches!(intent.target, SendTarget::Channel(_)) {
            return self.send_channel_media_fallback(intent, &source).await;
        }

        let source = match normalize_source(source).await {
            Ok(s) => s,
            Err(e) => return OutboundResult::err(e.to_string()),
        };

        let file_info = match self.uploader.upload(&intent.target, &source).await {
            Ok(info) => info,
            Err(e) => return OutboundResult::err(e.to_string()),
        };

        let reply_to = self.resolve_reply_mode(intent.reply_to.as_deref());
        let msg_seq = reply_to.as_deref().map(|id| self.seq.next(id));
        let body = media_body(&file_info, msg_seq, reply_to.as_deref());
        let path = message_path(&intent.target);

        match self.rest.post_message(&path, &body).await {
            Ok(resp) => {
                if let Some(id) = reply_to.as_deref() {
                    self.limiter.record_reply(id);
                }
                info!(target = %intent.target.format(), "Rich media sent");
                OutboundResult::ok(extract_message_id(&resp))
            }
            Err(e) => OutboundResult::err(e.to_string()),
        }
    }

    /// Full reply delivery: discover images in the reply, send each via the
    /// rich-media path, then the cleaned text. An image failure is reported
    /// but never blocks the text.
    pub async fn deliver_reply(
        &self,
        event: &InboundEvent,
        text: &str,
        media_urls: &[String],
    ) -> Vec<OutboundResult> {
        let target = event.reply_target();
        let resolved = resolve_images(text, media_urls);
        let mut results = Vec::new();

        let mut text_out = resolved.cleaned_text;
        let mut sources = resolved.sources;

        // Markdown C2C accounts can inline public URLs into the markdown
        // body instead of the two-step upload.
        if self.account.markdown_support && event.kind == ChatKind::C2c {
            let mut kept = Vec::new();
            for source in sources {
                match source {
                    MediaSource::PublicUrl(url) => {
                        let literal = self.markdown_image_literal(&url).await;
                        if text_out.is_empty() {
                            text_out = literal;
                        } else {
                            text_out = format!("{}\n{}", text_out, literal);
                        }
                    }
                    other => kept.push(other),
                }
            }
            sources = kept;
        }

        let intent = OutboundIntent {
            target: target.clone(),
            text: None,
            media_sources: Vec::new(),
            reply_to: Some(event.message_id.clone()),
            account_id: self.account.id.clone(),
        };

        for source in sources {
            results.push(self.send_media(&intent, source).await);
        }

        if !text_out.trim().is_empty() {
            results.push(
                self.send_text(OutboundIntent {
                    text: Some(text_out),
                    ..intent
                })
                .await,
            );
        }
        results
    }

    /// C2C typing indicator.
    pub async fn send_input_notify(
        &self,
        openid: &str,
        reply_to: &str,
        seconds: u32,
    ) -> OutboundResult {
        let body = serde_json::json!({
            "msg_type": 6,
            "input_notify": {"input_type": 1, "input_second": seconds},
            "msg_seq": self.seq.next(reply_to),
            "msg_id": reply_to,
        });
        let path = format!("/v2/users/{}/messages", openid);
        match self.rest.post_message(&path, &body).await {
            Ok(_) => OutboundResult::ok(None),
            Err(e) => OutboundResult::err(e.to_string()),
        }
    }

    /// Tell the user the pipeline failed instead of leaving them hanging.
    /// Credential problems are paraphrased as configuration hints — never
    /// surfaced raw.
    pub async fn notify_failure(&self, event: &InboundEvent, error: &Error) {
        let text = if error.is_auth_shaped() {
            "[ClawdBot] 出错: 机器人凭证校验失败，请检查 appId / clientSecret 配置".to_string()
        } else {
            format!("[ClawdBot] 出错: {}", error)
        };
        let result = self
            .send_text(OutboundIntent {
                target: event.reply_target(),
                text: Some(text),
                media_sources: Vec::new(),
                reply_to: Some(event.message_id.clone()),
                account_id: self.account.id.clone(),
            })
            .await;
        if let Some(e) = result.error {
            warn!(account = %self.account.id, error = %e, "Failed to deliver error notice");
        }
    }

    /// Watchdog expiry notice: the pipeline produced nothing in time.
    pub async fn notify_timeout(&self, event: &InboundEvent) {
        let result = self
            .send_text(OutboundIntent {
                target: event.reply_target(),
                text: Some("[ClawdBot] 响应超时，请稍后重试".to_string()),
                media_sources: Vec::new(),
                reply_to: Some(event.message_id.clone()),
                account_id: self.account.id.clone(),
            })
            .await;
        if let Some(e) = result.error {
            warn!(account = %self.account.id, error = %e, "Failed to deliver timeout notice");
        }
    }

    /// Apply the reply window: a consumed or expired quota downgrades the
    /// send to active by clearing `reply_to` (so the body carries no msg_id).
    fn resolve_reply_mode(&self, reply_to: Option<&str>) -> Option<String> {
        let id = reply_to?;
        match self.limiter.check(id) {
            crate::limiter::ReplyDecision::Allow { .. } => Some(id.to_string()),
            crate::limiter::ReplyDecision::Fallback { reason } => {
                let reason = match reason {
                    FallbackReason::Expired => "expired",
                    FallbackReason::LimitExceeded => "limit_exceeded",
                };
                info!(
                    message_id = %id,
                    reason,
                    "Passive reply window closed, falling back to active message"
                );
                None
            }
        }
    }

    async fn send_channel_media_fallback(
        &self,
        intent: &OutboundIntent,
        source: &MediaSource,
    ) -> OutboundResult {
        let suffix = match source {
            MediaSource::PublicUrl(url) => url.clone(),
            // Nothing a channel message could reference.
            MediaSource::DataUrl(_) | MediaSource::LocalPath(_) => "[图片]".to_string(),
        };
        let text = match intent.text.as_deref() {
            Some(t) if !t.trim().is_empty() => format!("{}\n{}", t.trim(), suffix),
            _ => suffix,
        };
        self.send_text(OutboundIntent {
            text: Some(text),
            media_sources: Vec::new(),
            ..intent.clone()
        })
        .await
    }

    /// QQ's markdown dialect sizes images explicitly: `![#Wpx #Hpx](url)`.
    async fn markdown_image_literal(&self, url: &str) -> String {
        let (w, h) = match imgsize::fetch_image_size(&self.http, url).await {
            Ok(Some(size)) => size,
            _ => imgsize::DEFAULT_SIZE,
        };
        format!("![#{}px #{}px]({})", w, h, url)
    }
}

/// `/v2/users` and `/v2/groups` serve both active and passive sends (the
/// body's msg_id decides); guild channels have a single endpoint either way.
fn message_path(target: &SendTarget) -> String {
    match target {
        SendTarget::C2c(openid) => format!("/v2/users/{}/messages", openid),
        SendTarget::Group(group) => format!("/v2/groups/{}/messages", group),
        SendTarget::Channel(channel) => format!("/channels/{}/messages", channel),
    }
}

fn text_body(
    text: &str,
    markdown: bool,
    msg_seq: Option<u64>,
    reply_to: Option<&str>,
) -> serde_json::Value {
    let mut body = if markdown {
        serde_json::json!({
            "markdown": {"content": text},
            "msg_type": 2,
        })
    } else {
        serde_json::json!({
            "content": text,
            "msg_type": 0,
        })
    };
    if let Some(seq) = msg_seq {
        body["msg_seq"] = serde_json::json!(seq);
    }
    if let Some(id) = reply_to {
        body["msg_id"] = serde_json::json!(id);
    }
    body
}

fn media_body(file_info: &str, msg_seq: Option<u64>, reply_to: Option<&str>) -> serde_json::Value {
    // The platform requires non-empty content alongside media; a single
    // space is the documented filler.
    let mut body = serde_json::json!({
        "content": " ",
        "msg_type": 7,
        "media": {"file_info": file_info},
    });
    if let Some(seq) = msg_seq {
        body["msg_seq"] = serde_json::json!(seq);
    }
    if let Some(id) = reply_to {
        body["msg_id"] = serde_json::json!(id);
    }
    body
}

fn extract_message_id(resp: &serde_json::Value) -> Option<String> {
    resp.get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenStore;
    use qqgate_core::SecretSource;

    fn account(markdown: bool) -> Account {
        Account {
            id: "acct".into(),
            name: "acct".into(),
            enabled: true,
            app_id: "1".into(),
            client_secret: "s".into(),
            secret_source: SecretSource::Config,
            system_prompt: None,
            image_server_base: None,
            markdown_support: markdown,
            proxy: None,
        }
    }

    fn dispatcher(markdown: bool) -> OutboundDispatcher {
        let client = Client::new();
        let tokens = Arc::new(TokenStore::new(&account(markdown), client.clone()));
        let rest = Arc::new(RestClient::new(tokens, client.clone()));
        OutboundDispatcher::new(
            account(markdown),
            rest,
            Arc::new(MsgSeqCounter::with_base(1000)),
            Arc::new(ReplyLimiter::new()),
            client,
        )
    }

    #[test]
    fn test_message_path_per_target() {
        assert_eq!(
            message_path(&SendTarget::C2c("U".into())),
            "/v2/users/U/messages"
        );
        assert_eq!(
            message_path(&SendTarget::Group("G".into())),
            "/v2/groups/G/messages"
        );
        assert_eq!(
            message_path(&SendTarget::Channel("C".into())),
            "/channels/C/messages"
        );
    }

    #[test]
    fn test_text_body_plain_passive() {
        let body = text_body("hi", false, Some(1001), Some("m1"));
        assert_eq!(body["content"], "hi");
        assert_eq!(body["msg_type"], 0);
        assert_eq!(body["msg_seq"], 1001);
        assert_eq!(body["msg_id"], "m1");
    }

    #[test]
    fn test_text_body_markdown() {
        let body = text_body("**hi**", true, Some(7), Some("m1"));
        assert_eq!(body["markdown"]["content"], "**hi**");
        assert_eq!(body["msg_type"], 2);
        assert!(body.get("content").is_none());
    }

    #[test]
    fn test_active_body_has_no_msg_id() {
        let body = text_body("hi", false, None, None);
        assert!(body.get("msg_id").is_none());
        assert!(body.get("msg_seq").is_none());
    }

    #[test]
    fn test_media_body_shape() {
        let body = media_body("FILEINFO", Some(3), Some("m1"));
        assert_eq!(body["msg_type"], 7);
        assert_eq!(body["media"]["file_info"], "FILEINFO");
        assert_eq!(body["content"], " ");
        assert_eq!(body["msg_id"], "m1");
    }

    #[tokio::test]
    async fn test_empty_active_send_fails_without_rest_call() {
        let d = dispatcher(false);
        let result = d
            .send_text(OutboundIntent {
                target: SendTarget::C2c("openid".into()),
                text: Some("   ".into()),
                media_sources: vec![],
                reply_to: None,
                account_id: "acct".into(),
            })
            .await;
        assert_eq!(
            result.error.as_deref(),
            Some("content required for proactive message")
        );
    }

    #[tokio::test]
    async fn test_fallback_clears_reply_to() {
        let d = dispatcher(false);
        for _ in 0..4 {
            d.limiter.record_reply("m-full");
        }
        // Quota exhausted: mode resolves to active (no msg_id in the body).
        assert_eq!(d.resolve_reply_mode(Some("m-full")), None);
        // Untouched quota: passive survives.
        assert_eq!(
            d.resolve_reply_mode(Some("m-fresh")),
            Some("m-fresh".to_string())
        );
        assert_eq!(d.resolve_reply_mode(None), None);
    }

    #[tokio::test]
    async fn test_fallback_with_empty_text_is_payload_error() {
        let d = dispatcher(false);
        for _ in 0..4 {
            d.limiter.record_reply("m");
        }
        let result = d
            .send_text(OutboundIntent {
                target: SendTarget::C2c("openid".into()),
                text: Some(String::new()),
                media_sources: vec![],
                reply_to: Some("m".into()),
                account_id: "acct".into(),
            })
            .await;
        // The downgraded send has no content to carry; it must fail locally.
        assert!(result.error.is_some());
    }

    #[test]
    fn test_extract_message_id() {
        let resp = serde_json::json!({"id": "MSG9", "timestamp": 1});
        assert_eq!(extract_message_id(&resp), Some("MSG9".to_string()));
        assert_eq!(extract_message_id(&serde_json::json!({})), None);
    }
}
