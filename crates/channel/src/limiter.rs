use std::collections::HashMap;
use std::sync::Mutex;

/// Passive replies allowed per inbound message.
const REPLY_LIMIT: u32 = 4;
/// Reply window: the platform stops accepting the inbound msg_id after this.
const REPLY_TTL_MS: i64 = 60 * 60 * 1000;
/// Lazy prune threshold for the record map.
const PRUNE_ABOVE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The 1-hour reply window has closed.
    Expired,
    /// All 4 passive replies were used.
    LimitExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDecision {
    Allow { remaining: u32 },
    Fallback { reason: FallbackReason },
}

#[derive(Debug, Clone, Copy)]
struct QuotaRecord {
    count: u32,
    first_reply_at: i64,
}

/// Tracks the platform's passive-reply window per inbound message id.
/// `check` decides allow vs. fall-back-to-active; callers report each
/// successful passive send through `record_reply`.
pub struct ReplyLimiter {
    records: Mutex<HashMap<String, QuotaRecord>>,
}

impl ReplyLimiter {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, message_id: &str) -> ReplyDecision {
        self.check_at(message_id, chrono::Utc::now().timestamp_millis())
    }

    fn check_at(&self, message_id: &str, now_ms: i64) -> ReplyDecision {
        let records = self.records.lock().unwrap();
        match records.get(message_id) {
            None => ReplyDecision::Allow {
                remaining: REPLY_LIMIT,
            },
            Some(rec) if now_ms - rec.first_reply_at > REPLY_TTL_MS => ReplyDecision::Fallback {
                reason: FallbackReason::Expired,
            },
            Some(rec) if rec.count >= REPLY_LIMIT => ReplyDecision::Fallback {
                reason: FallbackReason::LimitExceeded,
            },
            Some(rec) => ReplyDecision::Allow {
                remaining: REPLY_LIMIT - rec.count,
            },
        }
    }

    /// Count a successful passive send against `message_id`'s quota.
    pub fn record_reply(&self, message_id: &str) {
        self.record_reply_at(message_id, chrono::Utc::now().timestamp_millis());
    }

    fn record_reply_at(&self, message_id: &str, now_ms: i64) {
        let mut records = self.records.lock().unwrap();
        if records.len() > PRUNE_ABOVE {
            records.retain(|_, rec| now_ms - rec.first_reply_at <= REPLY_TTL_MS);
        }
        records
            .entry(message_id.to_string())
            .and_modify(|rec| rec.count += 1)
            .or_insert(QuotaRecord {
                count: 1,
                first_reply_at: now_ms,
            });
    }
}

impl Default for ReplyLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_message_allows_full_quota() {
        let limiter = ReplyLimiter::new();
        assert_eq!(
            limiter.check("m1"),
            ReplyDecision::Allow {
                remaining: REPLY_LIMIT
            }
        );
    }

    #[test]
    fn test_quota_counts_down_then_falls_back() {
        let limiter = ReplyLimiter::new();
        for expected_remaining in (1..=REPLY_LIMIT).rev() {
            assert_eq!(
                limiter.check("m"),
                ReplyDecision::Allow {
                    remaining: expected_remaining
                }
            );
            limiter.record_reply("m");
        }
        // Fifth attempt must not pass.
        assert_eq!(
            limiter.check("m"),
            ReplyDecision::Fallback {
                reason: FallbackReason::LimitExceeded
            }
        );
    }

    #[test]
    fn test_expired_window_falls_back() {
        let limiter = ReplyLimiter::new();
        let t0 = 1_700_000_000_000i64;
        limiter.record_reply_at("m", t0);
        assert!(matches!(
            limiter.check_at("m", t0 + REPLY_TTL_MS),
            ReplyDecision::Allow { remaining: 3 }
        ));
        assert_eq!(
            limiter.check_at("m", t0 + REPLY_TTL_MS + 1),
            ReplyDecision::Fallback {
                reason: FallbackReason::Expired
            }
        );
    }

    #[test]
    fn test_record_reply_is_cumulative() {
        let limiter = ReplyLimiter::new();
        let t0 = 1_700_000_000_000i64;
        limiter.record_reply_at("m", t0);
        limiter.record_reply_at("m", t0 + 10);
        let records = limiter.records.lock().unwrap();
        let rec = records.get("m").unwrap();
        assert_eq!(rec.count, 2);
        // first_reply_at anchors at the first send.
        assert_eq!(rec.first_reply_at, t0);
    }

    #[test]
    fn test_prune_drops_stale_records() {
        let limiter = ReplyLimiter::new();
        let t0 = 1_700_000_000_000i64;
        for i in 0..=PRUNE_ABOVE {
            limiter.record_reply_at(&format!("old-{}", i), t0);
        }
        // A record landing after the TTL triggers the prune sweep.
        limiter.record_reply_at("fresh", t0 + REPLY_TTL_MS + 1);
        let records = limiter.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records.contains_key("fresh"));
    }
}
