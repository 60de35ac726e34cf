use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use qqgate_core::{Account, Error, HostServices, Result};
use qqgate_storage::{SessionState, SessionStore};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::dispatch::OutboundDispatcher;
use crate::limiter::ReplyLimiter;
use crate::queue::{run_worker, InboundQueue};
use crate::reconnect::{CloseEvent, ReconnectAction, ReconnectPolicy};
use crate::rest::{build_http_client, RestClient};
use crate::seq::MsgSeqCounter;
use crate::token::TokenStore;
use crate::wire::{
    chat_kind_for_event, normalize_event, GatewayPayload, Heartbeat, HelloData, Identify,
    MessageCreatePayload, ReadyData, Resume, INTENT_LEVELS, OP_DISPATCH, OP_HEARTBEAT_ACK,
    OP_HELLO, OP_INVALID_SESSION, OP_RECONNECT,
};

/// One bot account's gateway: WebSocket lifecycle, handshake, heartbeat,
/// dispatch, and the reconnect loop around all of it.
pub struct AccountGateway {
    account: Account,
    host: Arc<dyn HostServices>,
    tokens: Arc<TokenStore>,
    rest: Arc<RestClient>,
    dispatcher: Arc<OutboundDispatcher>,
    queue: Arc<InboundQueue>,
    sessions: Arc<SessionStore>,
    shutdown: broadcast::Sender<()>,
    /// Held for the duration of a connection attempt; a second connect while
    /// one is in flight is a no-op.
    connecting: tokio::sync::Mutex<()>,
}

impl AccountGateway {
    pub fn new(
        account: Account,
        host: Arc<dyn HostServices>,
        sessions: Arc<SessionStore>,
    ) -> Arc<Self> {
        let client = build_http_client(account.proxy.as_deref());
        let tokens = Arc::new(TokenStore::new(&account, client.clone()));
        let rest = Arc::new(RestClient::new(tokens.clone(), client.clone()));
        let seq = Arc::new(MsgSeqCounter::new());
        let limiter = Arc::new(ReplyLimiter::new());
        let dispatcher = Arc::new(OutboundDispatcher::new(
            account.clone(),
            rest.clone(),
            seq,
            limiter,
            client,
        ));
        let (shutdown, _) = broadcast::channel(4);

        Arc::new(Self {
            account,
            host,
            tokens,
            rest,
            dispatcher,
            queue: Arc::new(InboundQueue::new()),
            sessions,
            shutdown,
            connecting: tokio::sync::Mutex::new(()),
        })
    }

    /// Stop every task belonging to this account.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn queue(&self) -> &Arc<InboundQueue> {
        &self.queue
    }

    pub fn dispatcher(&self) -> &Arc<OutboundDispatcher> {
        &self.dispatcher
    }

    /// Run until shutdown or a terminal platform verdict. Spawns the inbound
    /// worker and the token refresh loop, then drives connect/reconnect.
    pub async fn run(self: Arc<Self>) {
        if !self.account.is_configured() {
            warn!(account = %self.account.id, "Account has no usable credentials, not starting");
            return;
        }
        info!(account = %self.account.id, name = %self.account.name, "Gateway starting");

        let worker = tokio::spawn(run_worker(
            self.queue.clone(),
            self.account.clone(),
            self.host.clone(),
            self.dispatcher.clone(),
            self.shutdown.subscribe(),
        ));
        let refresher = {
            let gateway = self.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { gateway.tokens.run_refresh_loop(shutdown).await })
        };

        let mut policy = ReconnectPolicy::new();
        let mut refresh_token_next = false;
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let close_event = tokio::select! {
                result = self.connect_and_run(refresh_token_next, &mut policy) => match result {
                    Ok(event) => event,
                    Err(e) => CloseEvent::TransportError(e.to_string()),
                },
                _ = shutdown.recv() => CloseEvent::Shutdown,
            };
            refresh_token_next = false;

            // Intent downgrade happens on the unresumable verdict, before
            // the policy decides the delay.
            if let CloseEvent::InvalidSession { resumable: false } = close_event {
                if self.advance_intent_level() {
                    refresh_token_next = true;
                }
            }

            match policy.decide(&close_event) {
                ReconnectAction::Stop => {
                    info!(account = %self.account.id, "Gateway stopped");
                    break;
                }
                ReconnectAction::StopFatal { banned } => {
                    error!(
                        account = %self.account.id,
                        banned,
                        "Gateway terminated by the platform; manual intervention required"
                    );
                    break;
                }
                ReconnectAction::Retry {
                    delay,
                    refresh_token,
                    clear_session,
                } => {
                    refresh_token_next = refresh_token_next || refresh_token;
                    if clear_session {
                        if let Err(e) = self.sessions.clear_session(&self.account.id) {
                            warn!(account = %self.account.id, error = %e, "Failed to clear session state");
                        }
                    }
                    debug!(
                        account = %self.account.id,
                        delay_secs = delay.as_secs(),
                        "Reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }

        worker.abort();
        refresher.abort();
    }

    /// One full connection: token → gateway URL → WebSocket → handshake →
    /// dispatch loop. Returns how the connection ended.
    async fn connect_and_run(
        &self,
        refresh_token: bool,
        policy: &mut ReconnectPolicy,
    ) -> Result<CloseEvent> {
        // No-op when a connect is already in flight.
        let _guard = match self.connecting.try_lock() {
            Ok(g) => g,
            Err(_) => return Ok(CloseEvent::Shutdown),
        };

        if refresh_token {
            self.tokens.clear().await;
        }
        let access_token = self.tokens.access_token().await?;
        let ws_url = self.rest.gateway_url().await?;
        url::Url::parse(&ws_url)
            .map_err(|e| Error::ProtocolDecode(format!("gateway URL {}: {}", ws_url, e)))?;

        info!(account = %self.account.id, url = %ws_url, "Connecting to gateway");
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| Error::Network(format!("WebSocket connect: {}", e)))?;
        policy.on_open();

        let (mut write, mut read) = ws_stream.split();
        let sequence: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let saved = self.sessions.load(&self.account.id);
        if let Some(state) = &saved {
            *sequence.lock().unwrap() = state.last_seq;
        }

        // First frame must be Hello with the heartbeat cadence.
        let heartbeat_interval_ms = match read.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let payload: GatewayPayload = serde_json::from_str(&text)?;
                if payload.op != OP_HELLO {
                    return Err(Error::ProtocolDecode(format!(
                        "expected Hello, got op {}",
                        payload.op
                    )));
                }
                let hello: HelloData =
                    serde_json::from_value(payload.d.unwrap_or_default())
                        .unwrap_or(HelloData {
                            heartbeat_interval: 41_250,
                        });
                hello.heartbeat_interval
            }
            Some(Ok(WsMessage::Close(frame))) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                return Ok(CloseEvent::Closed(code));
            }
            Some(Err(e)) => return Ok(CloseEvent::TransportError(e.to_string())),
            _ => {
                return Ok(CloseEvent::TransportError(
                    "connection ended before Hello".to_string(),
                ))
            }
        };

        // Resume when we have a session, otherwise identify at the seeded
        // capability level.
        let attempted_level = intent_seed(saved.as_ref());
        let resuming = saved.as_ref().map(|s| s.can_resume()).unwrap_or(false);
        let first_frame = if resuming {
            let state = saved.as_ref().unwrap();
            info!(
                account = %self.account.id,
                session = %state.session_id.as_deref().unwrap_or(""),
                seq = state.last_seq.unwrap_or(0),
                "Resuming session"
            );
            serde_json::to_string(&Resume::new(
                &access_token,
                state.session_id.as_deref().unwrap_or(""),
                state.last_seq.unwrap_or(0),
            ))?
        } else {
            info!(
                account = %self.account.id,
                level = attempted_level,
                intents = INTENT_LEVELS[attempted_level],
                "Identifying"
            );
            serde_json::to_string(&Identify::new(&access_token, INTENT_LEVELS[attempted_level]))?
        };
        write
            .send(WsMessage::Text(first_frame))
            .await
            .map_err(|e| Error::Network(format!("handshake send: {}", e)))?;

        // Heartbeat ticker runs apart from the receive loop and hands frames
        // over a channel, so a stalled pipeline can never delay it.
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<String>(8);
        let heartbeat_task = tokio::spawn({
            let sequence = sequence.clone();
            let interval = std::time::Duration::from_millis(heartbeat_interval_ms);
            async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let seq = *sequence.lock().unwrap();
                    let frame = match serde_json::to_string(&Heartbeat::new(seq)) {
                        Ok(f) => f,
                        Err(_) => continue,
                    };
                    if heartbeat_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut shutdown = self.shutdown.subscribe();
        let close_event = loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<GatewayPayload>(&text) {
                            Ok(payload) => {
                                if let Some(event) = self.handle_payload(payload, &sequence, attempted_level) {
                                    break event;
                                }
                            }
                            Err(e) => debug!(error = %e, "Undecodable gateway frame, skipping"),
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        info!(account = %self.account.id, code = ?code, "Gateway closed the connection");
                        break CloseEvent::Closed(code);
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = write.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break CloseEvent::TransportError(e.to_string()),
                    None => break CloseEvent::Closed(None),
                },
                Some(frame) = heartbeat_rx.recv() => {
                    if let Err(e) = write.send(WsMessage::Text(frame)).await {
                        break CloseEvent::TransportError(format!("heartbeat send: {}", e));
                    }
                }
                _ = shutdown.recv() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    break CloseEvent::Shutdown;
                }
            }
        };

        heartbeat_task.abort();
        Ok(close_event)
    }

    /// Op-code switch. Returns Some when the connection must end. Dispatch
    /// handling parses and enqueues only — never awaits user code — so the
    /// receive loop gets straight back to the socket.
    fn handle_payload(
        &self,
        payload: GatewayPayload,
        sequence: &Arc<Mutex<Option<u64>>>,
        attempted_level: usize,
    ) -> Option<CloseEvent> {
        if let Some(s) = payload.s {
            *sequence.lock().unwrap() = Some(s);
            self.sessions.update_seq(&self.account.id, s);
        }

        match payload.op {
            OP_DISPATCH => {
                let event_type = payload.t.as_deref().unwrap_or("");
                match event_type {
                    "READY" => self.on_ready(payload.d, attempted_level),
                    "RESUMED" => {
                        info!(account = %self.account.id, "Session resumed");
                        self.sessions.update(&self.account.id, |s| {
                            s.last_connected_at = chrono::Utc::now().timestamp_millis();
                        });
                        let _ = self.sessions.save_now(&self.account.id);
                    }
                    other => {
                        if let Some(kind) = chat_kind_for_event(other) {
                            let Some(d) = payload.d else { return None };
                            match serde_json::from_value::<MessageCreatePayload>(d) {
                                Ok(msg) => {
                                    if let Some(event) = normalize_event(kind, msg) {
                                        debug!(
                                            account = %self.account.id,
                                            message_id = %event.message_id,
                                            kind = ?event.kind,
                                            "Inbound message"
                                        );
                                        self.queue.push(event);
                                    }
                                }
                                Err(e) => {
                                    warn!(event_type = %other, error = %e, "Malformed dispatch payload")
                                }
                            }
                        } else {
                            debug!(event_type = %other, "Unhandled dispatch event");
                        }
                    }
                }
                None
            }
            OP_HEARTBEAT_ACK => None,
            OP_RECONNECT => {
                info!(account = %self.account.id, "Server requested reconnect (op 7)");
                Some(CloseEvent::ServerReconnect)
            }
            OP_INVALID_SESSION => {
                let resumable = payload
                    .d
                    .as_ref()
                    .and_then(|d| d.as_bool())
                    .unwrap_or(false);
                warn!(account = %self.account.id, resumable, "Invalid session (op 9)");
                Some(CloseEvent::InvalidSession { resumable })
            }
            other => {
                debug!(op = other, "Unhandled gateway op");
                None
            }
        }
    }

    fn on_ready(&self, d: Option<serde_json::Value>, attempted_level: usize) {
        let ready: ReadyData = match d.and_then(|d| serde_json::from_value(d).ok()) {
            Some(r) => r,
            None => {
                warn!(account = %self.account.id, "READY without session_id");
                return;
            }
        };
        info!(
            account = %self.account.id,
            session = %ready.session_id,
            bot = %ready.user.as_ref().and_then(|u| u.username.as_deref()).unwrap_or("?"),
            "Gateway ready"
        );
        self.sessions.update(&self.account.id, |s| {
            s.session_id = Some(ready.session_id.clone());
            s.last_connected_at = chrono::Utc::now().timestamp_millis();
            s.intent_level_index = attempted_level;
            s.last_successful_intent_level = Some(attempted_level);
        });
        if let Err(e) = self.sessions.save_now(&self.account.id) {
            warn!(account = %self.account.id, error = %e, "Failed to persist session state");
        }

        let host = self.host.clone();
        let account = self.account.clone();
        tokio::spawn(async move { host.on_ready(&account).await });
    }

    /// Move one step down the capability ladder. Returns true when already at
    /// the bottom (which forces a token refresh on the next connect instead).
    fn advance_intent_level(&self) -> bool {
        let mut capped = false;
        self.sessions.update(&self.account.id, |s| {
            // The old success level no longer holds.
            s.last_successful_intent_level = None;
            if s.intent_level_index + 1 < INTENT_LEVELS.len() {
                s.intent_level_index += 1;
            } else {
                capped = true;
            }
        });
        let _ = self.sessions.save_now(&self.account.id);
        let state = self.sessions.get(&self.account.id);
        warn!(
            account = %self.account.id,
            level = state.map(|s| s.intent_level_index).unwrap_or(0),
            capped,
            "Downgrading intent level"
        );
        capped
    }
}

/// Which capability level the next Identify should attempt: the last level
/// that worked, else the persisted running index, else the top.
fn intent_seed(saved: Option<&SessionState>) -> usize {
    saved
        .map(|s| {
            s.last_successful_intent_level
                .unwrap_or(s.intent_level_index)
        })
        .unwrap_or(0)
        .min(INTENT_LEVELS.len() - 1)
}
