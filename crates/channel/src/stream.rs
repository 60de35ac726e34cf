//! Incremental ("streamed") C2C replies. The platform renders a message that
//! keeps growing as chunks arrive: `stream.state = 1` continues, `10` ends,
//! and anything idle longer than 10 s is killed server-side — hence the 8 s
//! keepalive.

use std::sync::Arc;
use std::time::{Duration, Instant};

use qqgate_core::Result;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::rest::RestClient;
use crate::seq::MsgSeqCounter;

pub const STREAM_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(8);

const STATE_STREAMING: u8 = 1;
const STATE_END: u8 = 10;

#[derive(Debug)]
struct StreamState {
    index: u32,
    stream_id: Option<String>,
    ended: bool,
    /// Prefix of the accumulated reply already on the wire.
    sent_len: usize,
    /// A chunk POST is in flight; newcomers stash instead of interleaving.
    in_flight: bool,
    pending_full_text: Option<String>,
    last_chunk_at: Instant,
}

impl StreamState {
    fn new() -> Self {
        Self {
            index: 0,
            stream_id: None,
            ended: false,
            sent_len: 0,
            in_flight: false,
            pending_full_text: None,
            last_chunk_at: Instant::now(),
        }
    }

    /// The unsent suffix of `full_text`, or None when nothing new arrived.
    fn take_delta(&mut self, full_text: &str) -> Option<String> {
        if full_text.len() <= self.sent_len {
            return None;
        }
        let delta = full_text[self.sent_len..].to_string();
        self.sent_len = full_text.len();
        Some(delta)
    }
}

/// One in-progress streamed message to one C2C recipient.
pub struct StreamSender {
    rest: Arc<RestClient>,
    seq: Arc<MsgSeqCounter>,
    openid: String,
    reply_to: String,
    state: Mutex<StreamState>,
}

impl StreamSender {
    pub fn new(
        rest: Arc<RestClient>,
        seq: Arc<MsgSeqCounter>,
        openid: &str,
        reply_to: &str,
    ) -> Self {
        Self {
            rest,
            seq,
            openid: openid.to_string(),
            reply_to: reply_to.to_string(),
            state: Mutex::new(StreamState::new()),
        }
    }

    /// Feed the accumulated reply text so far. Sends the unsent suffix as the
    /// next chunk; if a chunk is already in flight the text is stashed and
    /// sent as soon as the wire frees up.
    pub async fn push_text(&self, full_text: String) {
        {
            let mut state = self.state.lock().await;
            if state.ended {
                return;
            }
            if state.in_flight {
                state.pending_full_text = Some(full_text);
                return;
            }
            state.in_flight = true;
        }
        self.drain(full_text).await;
    }

    async fn drain(&self, mut full_text: String) {
        loop {
            let delta = {
                let mut state = self.state.lock().await;
                state.take_delta(&full_text)
            };
            if let Some(delta) = delta {
                if let Err(e) = self.send_chunk(&delta, STATE_STREAMING).await {
                    warn!(openid = %self.openid, error = %e, "Stream chunk failed");
                }
            }
            let mut state = self.state.lock().await;
            match state.pending_full_text.take() {
                Some(next) => {
                    drop(state);
                    full_text = next;
                }
                None => {
                    state.in_flight = false;
                    return;
                }
            }
        }
    }

    /// Close the stream with the final text. Waits out any chunk already in
    /// flight (one chunk on the wire at a time), then sends the END chunk
    /// exactly once; later calls are no-ops.
    pub async fn end(&self, final_text: String) {
        let delta = loop {
            let mut state = self.state.lock().await;
            if state.ended {
                return;
            }
            if state.in_flight {
                drop(state);
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }
            state.ended = true;
            state.pending_full_text = None;
            break state.take_delta(&final_text).unwrap_or_default();
        };
        if let Err(e) = self.send_chunk(&delta, STATE_END).await {
            warn!(openid = %self.openid, error = %e, "Stream end chunk failed");
        }
    }

    /// Mark the stream dead without a final chunk (pipeline timeout path).
    pub async fn abandon(&self) {
        self.state.lock().await.ended = true;
    }

    pub async fn is_ended(&self) -> bool {
        self.state.lock().await.ended
    }

    async fn send_chunk(&self, content: &str, stream_state: u8) -> Result<()> {
        let (index, stream_id) = {
            let state = self.state.lock().await;
            (state.index, state.stream_id.clone())
        };
        let body = build_chunk_body(
            content,
            self.seq.next(&self.reply_to),
            &self.reply_to,
            stream_state,
            index,
            stream_id.as_deref(),
        );
        let path = format!("/v2/users/{}/messages", self.openid);
        let resp = self.rest.post_message(&path, &body).await?;

        let mut state = self.state.lock().await;
        state.index += 1;
        state.last_chunk_at = Instant::now();
        if state.stream_id.is_none() {
            state.stream_id = resp
                .get("stream_id")
                .or_else(|| resp.get("id"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
        }
        debug!(openid = %self.openid, index, state = stream_state, "Stream chunk sent");
        Ok(())
    }

    /// Keepalive ticker: while the stream lives, any >8 s gap between chunks
    /// is plugged with an empty continuation so the platform does not kill
    /// the message. Exits once the stream ends.
    pub async fn run_keepalive(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let due = {
                let state = self.state.lock().await;
                if state.ended {
                    return;
                }
                !state.in_flight
                    && state.last_chunk_at.elapsed() >= STREAM_KEEPALIVE_INTERVAL
                    && state.index > 0
            };
            if due {
                {
                    let mut state = self.state.lock().await;
                    if state.ended || state.in_flight {
                        continue;
                    }
                    state.in_flight = true;
                }
                if let Err(e) = self.send_chunk("", STATE_STREAMING).await {
                    warn!(openid = %self.openid, error = %e, "Stream keepalive failed");
                }
                self.state.lock().await.in_flight = false;
            }
        }
    }
}

fn build_chunk_body(
    content: &str,
    msg_seq: u64,
    reply_to: &str,
    stream_state: u8,
    index: u32,
    stream_id: Option<&str>,
) -> serde_json::Value {
    let mut stream = serde_json::json!({
        "state": stream_state,
        "index": index,
    });
    if let Some(id) = stream_id {
        stream["id"] = serde_json::Value::String(id.to_string());
    }
    serde_json::json!({
        "content": content,
        "msg_type": 0,
        "msg_seq": msg_seq,
        "msg_id": reply_to,
        "stream": stream,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_body_first_has_no_stream_id() {
        let body = build_chunk_body("你好", 17, "m1", STATE_STREAMING, 0, None);
        assert_eq!(body["stream"]["state"], 1);
        assert_eq!(body["stream"]["index"], 0);
        assert!(body["stream"].get("id").is_none());
        assert_eq!(body["msg_id"], "m1");
        assert_eq!(body["msg_seq"], 17);
    }

    #[test]
    fn test_chunk_body_end_state() {
        let body = build_chunk_body("", 18, "m1", STATE_END, 3, Some("sid"));
        assert_eq!(body["stream"]["state"], 10);
        assert_eq!(body["stream"]["id"], "sid");
    }

    #[test]
    fn test_take_delta_tracks_watermark() {
        let mut state = StreamState::new();
        assert_eq!(state.take_delta("你好"), Some("你好".to_string()));
        // Same text again: nothing new.
        assert_eq!(state.take_delta("你好"), None);
        assert_eq!(state.take_delta("你好，世界"), Some("，世界".to_string()));
        assert_eq!(state.sent_len, "你好，世界".len());
    }

    #[test]
    fn test_take_delta_ignores_shrinking_text() {
        let mut state = StreamState::new();
        state.take_delta("abcdef");
        assert_eq!(state.take_delta("abc"), None);
        assert_eq!(state.sent_len, 6);
    }

    #[tokio::test]
    async fn test_end_is_idempotent_on_state() {
        // No server behind it, so the chunk POST fails, but the ended flag
        // must flip exactly once and stay.
        let rest = Arc::new(RestClient::new(
            Arc::new(crate::token::TokenStore::new(
                &test_account(),
                reqwest::Client::new(),
            )),
            reqwest::Client::new(),
        ));
        let sender = StreamSender::new(rest, Arc::new(MsgSeqCounter::with_base(0)), "openid", "m1");
        sender.abandon().await;
        assert!(sender.is_ended().await);
        // push after end is a no-op.
        sender.push_text("ignored".to_string()).await;
        assert_eq!(sender.state.lock().await.sent_len, 0);
    }

    fn test_account() -> qqgate_core::Account {
        qqgate_core::Account {
            id: "t".into(),
            name: "t".into(),
            enabled: true,
            app_id: "1".into(),
            client_secret: "s".into(),
            secret_source: qqgate_core::SecretSource::Config,
            system_prompt: None,
            image_server_base: None,
            markdown_support: false,
            proxy: None,
        }
    }
}
