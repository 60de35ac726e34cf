use std::time::{Duration, Instant};

use tracing::{error, warn};

/// Delay schedule in seconds; later attempts saturate at the last entry.
pub const BACKOFF_SCHEDULE: [u64; 6] = [1, 2, 5, 10, 30, 60];
/// Give up after this many consecutive failed attempts.
pub const MAX_ATTEMPTS: u32 = 100;
/// A connection dying this quickly after opening counts as a quick
/// disconnect; three in a row back way off.
const QUICK_DISCONNECT_WINDOW: Duration = Duration::from_secs(5);
const QUICK_DISCONNECT_LIMIT: u32 = 3;
/// Delay when the platform sheds load or connections churn.
const LONG_DELAY: Duration = Duration::from_secs(60);
/// Delay after an invalid-session verdict before the next handshake.
const INVALID_SESSION_DELAY: Duration = Duration::from_secs(3);

// Close codes with defined semantics.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_SESSION_EXPIRED: u16 = 4009;
const CLOSE_INTERNAL_LO: u16 = 4900;
const CLOSE_INTERNAL_HI: u16 = 4913;
const CLOSE_BOT_OFFLINE: u16 = 4914;
const CLOSE_BOT_BANNED: u16 = 4915;

/// Why the connection (or connection attempt) ended.
#[derive(Debug, Clone)]
pub enum CloseEvent {
    /// WebSocket closed, optionally with a close code.
    Closed(Option<u16>),
    /// Transport or handshake failure before/while connected.
    TransportError(String),
    /// Server asked us to reconnect (op 7).
    ServerReconnect,
    /// Server invalidated the session (op 9).
    InvalidSession { resumable: bool },
    /// Local shutdown.
    Shutdown,
}

/// What to do about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Clean stop, no reconnect.
    Stop,
    /// Terminal platform verdict; never reconnect this process.
    StopFatal { banned: bool },
    Retry {
        delay: Duration,
        /// Clear the token cache before the next connect.
        refresh_token: bool,
        /// Drop session_id / last_seq so the next handshake identifies.
        clear_session: bool,
    },
}

/// Decides whether and when to reconnect. One instance per account gateway;
/// the connect loop feeds it opens and closes, it hands back actions. The
/// loop structure itself guarantees a single pending reconnect at a time.
pub struct ReconnectPolicy {
    attempts: u32,
    quick_disconnects: u32,
    opened_at: Option<Instant>,
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            quick_disconnects: 0,
            opened_at: None,
        }
    }

    /// The WebSocket opened; the attempt counter starts over.
    pub fn on_open(&mut self) {
        self.attempts = 0;
        self.opened_at = Some(Instant::now());
    }

    pub fn decide(&mut self, event: &CloseEvent) -> ReconnectAction {
        let was_quick = self
            .opened_at
            .take()
            .map(|t| t.elapsed() < QUICK_DISCONNECT_WINDOW)
            .unwrap_or(false);

        let action = self.decide_inner(event, was_quick);
        if let ReconnectAction::Retry { .. } = action {
            self.attempts += 1;
            if self.attempts >= MAX_ATTEMPTS {
                error!(attempts = self.attempts, "Reconnect attempt cap reached, giving up");
                return ReconnectAction::Stop;
            }
        }
        action
    }

    fn decide_inner(&mut self, event: &CloseEvent, was_quick: bool) -> ReconnectAction {
        match event {
            CloseEvent::Shutdown => ReconnectAction::Stop,

            CloseEvent::Closed(Some(CLOSE_NORMAL)) => ReconnectAction::Stop,
            CloseEvent::Closed(Some(CLOSE_BOT_OFFLINE)) => {
                error!("Bot taken offline by the platform (close 4914); stopping permanently");
                ReconnectAction::StopFatal { banned: false }
            }
            CloseEvent::Closed(Some(CLOSE_BOT_BANNED)) => {
                error!("Bot banned by the platform (close 4915); stopping permanently");
                ReconnectAction::StopFatal { banned: true }
            }
            CloseEvent::Closed(Some(CLOSE_SESSION_EXPIRED)) => ReconnectAction::Retry {
                delay: self.next_backoff(was_quick),
                refresh_token: true,
                clear_session: false,
            },
            CloseEvent::Closed(Some(code))
                if (CLOSE_INTERNAL_LO..=CLOSE_INTERNAL_HI).contains(code) =>
            {
                warn!(code, "Gateway internal close; dropping session and re-identifying");
                ReconnectAction::Retry {
                    delay: self.next_backoff(was_quick),
                    refresh_token: true,
                    clear_session: true,
                }
            }
            CloseEvent::Closed(_) => ReconnectAction::Retry {
                delay: self.next_backoff(was_quick),
                refresh_token: false,
                clear_session: false,
            },

            CloseEvent::TransportError(msg) => {
                if msg.contains("Too many requests") || msg.contains("100001") {
                    warn!("Connect rate-limited; backing off 60s");
                    ReconnectAction::Retry {
                        delay: LONG_DELAY,
                        refresh_token: false,
                        clear_session: false,
                    }
                } else {
                    ReconnectAction::Retry {
                        delay: self.next_backoff(was_quick),
                        refresh_token: false,
                        clear_session: false,
                    }
                }
            }

            CloseEvent::ServerReconnect => ReconnectAction::Retry {
                delay: self.next_backoff(was_quick),
                refresh_token: false,
                clear_session: false,
            },

            CloseEvent::InvalidSession { resumable } => ReconnectAction::Retry {
                delay: INVALID_SESSION_DELAY,
                refresh_token: false,
                clear_session: !resumable,
            },
        }
    }

    fn next_backoff(&mut self, was_quick: bool) -> Duration {
        if was_quick {
            self.quick_disconnects += 1;
            if self.quick_disconnects >= QUICK_DISCONNECT_LIMIT {
                warn!(
                    count = self.quick_disconnects,
                    "Repeated quick disconnects; backing off 60s"
                );
                self.quick_disconnects = 0;
                return LONG_DELAY;
            }
        } else {
            self.quick_disconnects = 0;
        }
        let idx = (self.attempts as usize).min(BACKOFF_SCHEDULE.len() - 1);
        Duration::from_secs(BACKOFF_SCHEDULE[idx])
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_delay(action: &ReconnectAction) -> Duration {
        match action {
            ReconnectAction::Retry { delay, .. } => *delay,
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_backoff_schedule_saturates() {
        let mut policy = ReconnectPolicy::new();
        let event = CloseEvent::TransportError("connection refused".to_string());
        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(retry_delay(&policy.decide(&event)).as_secs());
        }
        assert_eq!(delays, vec![1, 2, 5, 10, 30, 60, 60, 60]);
    }

    #[test]
    fn test_open_resets_attempts() {
        let mut policy = ReconnectPolicy::new();
        let event = CloseEvent::TransportError("refused".to_string());
        for _ in 0..5 {
            policy.decide(&event);
        }
        policy.on_open();
        // Next close is not quick only if the window elapsed; we bypass the
        // quick path by clearing opened_at through decide's take().
        policy.opened_at = None;
        assert_eq!(retry_delay(&policy.decide(&event)).as_secs(), 1);
    }

    #[test]
    fn test_clean_close_stops() {
        let mut policy = ReconnectPolicy::new();
        assert_eq!(
            policy.decide(&CloseEvent::Closed(Some(1000))),
            ReconnectAction::Stop
        );
        assert_eq!(policy.decide(&CloseEvent::Shutdown), ReconnectAction::Stop);
    }

    #[test]
    fn test_terminal_close_codes() {
        let mut policy = ReconnectPolicy::new();
        assert_eq!(
            policy.decide(&CloseEvent::Closed(Some(4914))),
            ReconnectAction::StopFatal { banned: false }
        );
        assert_eq!(
            policy.decide(&CloseEvent::Closed(Some(4915))),
            ReconnectAction::StopFatal { banned: true }
        );
    }

    #[test]
    fn test_4009_preserves_session_refreshes_token() {
        let mut policy = ReconnectPolicy::new();
        match policy.decide(&CloseEvent::Closed(Some(4009))) {
            ReconnectAction::Retry {
                refresh_token,
                clear_session,
                ..
            } => {
                assert!(refresh_token);
                assert!(!clear_session);
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_internal_close_codes_drop_session() {
        for code in [4900u16, 4907, 4913] {
            let mut policy = ReconnectPolicy::new();
            match policy.decide(&CloseEvent::Closed(Some(code))) {
                ReconnectAction::Retry {
                    refresh_token,
                    clear_session,
                    ..
                } => {
                    assert!(refresh_token, "code {}", code);
                    assert!(clear_session, "code {}", code);
                }
                other => panic!("expected retry for {}, got {:?}", code, other),
            }
        }
    }

    #[test]
    fn test_rate_limited_connect_backs_off_60s() {
        let mut policy = ReconnectPolicy::new();
        let action = policy.decide(&CloseEvent::TransportError(
            "HTTP 429: Too many requests".to_string(),
        ));
        assert_eq!(retry_delay(&action).as_secs(), 60);

        let action = policy.decide(&CloseEvent::TransportError(
            "api error code 100001".to_string(),
        ));
        assert_eq!(retry_delay(&action).as_secs(), 60);
    }

    #[test]
    fn test_invalid_session_delays_3s() {
        let mut policy = ReconnectPolicy::new();
        let action = policy.decide(&CloseEvent::InvalidSession { resumable: true });
        match action {
            ReconnectAction::Retry {
                delay,
                clear_session,
                ..
            } => {
                assert_eq!(delay.as_secs(), 3);
                assert!(!clear_session);
            }
            other => panic!("{:?}", other),
        }
        let action = policy.decide(&CloseEvent::InvalidSession { resumable: false });
        match action {
            ReconnectAction::Retry { clear_session, .. } => assert!(clear_session),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_quick_disconnects_trigger_long_delay() {
        let mut policy = ReconnectPolicy::new();
        let event = CloseEvent::Closed(None);
        for i in 0..2 {
            policy.on_open();
            let d = retry_delay(&policy.decide(&event));
            assert!(d.as_secs() < 60, "attempt {} delayed {:?}", i, d);
        }
        // Third quick disconnect in a row.
        policy.on_open();
        assert_eq!(retry_delay(&policy.decide(&event)).as_secs(), 60);
        // Counter reset afterwards.
        policy.on_open();
        assert!(retry_delay(&policy.decide(&event)).as_secs() < 60);
    }

    #[test]
    fn test_attempt_cap_stops() {
        let mut policy = ReconnectPolicy::new();
        let event = CloseEvent::TransportError("refused".to_string());
        let mut last = ReconnectAction::Stop;
        for _ in 0..MAX_ATTEMPTS + 1 {
            last = policy.decide(&event);
            if last == ReconnectAction::Stop {
                break;
            }
        }
        assert_eq!(last, ReconnectAction::Stop);
    }
}
