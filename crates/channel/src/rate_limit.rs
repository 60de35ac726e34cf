//! Outbound send pacing. Callers `await` on `acquire()` before each message
//! POST; one instance lives in each REST client, so the limit is per-account
//! (5 msg/s with a 5-message burst, the Open Platform recommendation).
//!
//! Rather than counting refillable tokens, the pacer tracks the theoretical
//! instant the next send becomes conforming and lets it run a bounded
//! distance ahead of the wall clock — same admissions as a token bucket,
//! with a single `Instant` of state.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct SendPacer {
    /// Spacing between sends at the sustained rate.
    interval: Duration,
    /// How far `next_free` may run ahead of now (the burst allowance).
    headroom: Duration,
    /// Theoretical instant the next send is conforming.
    next_free: Instant,
}

impl SendPacer {
    fn new(burst: u32, per_second: f64) -> Self {
        let interval = Duration::from_secs_f64(1.0 / per_second);
        Self {
            interval,
            // N sends pass back-to-back when the pacer is at most N-1
            // intervals ahead.
            headroom: interval * burst.saturating_sub(1),
            next_free: Instant::now(),
        }
    }

    /// Admit one send at `now`, or say how long to wait. Admission advances
    /// `next_free` by one interval; a denied call leaves the state untouched
    /// so the caller can sleep and retry.
    fn admit(&mut self, now: Instant) -> Option<Duration> {
        let due = self.next_free.max(now);
        let ahead = due - now;
        if ahead > self.headroom {
            return Some(ahead - self.headroom);
        }
        self.next_free = due + self.interval;
        None
    }
}

/// Thread-safe send pacer.
pub struct SendLimiter(Mutex<SendPacer>);

impl SendLimiter {
    pub fn new(burst: u32, per_second: f64) -> Self {
        Self(Mutex::new(SendPacer::new(burst, per_second)))
    }

    /// Acquire one send slot, sleeping if necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = self.0.lock().await.admit(Instant::now());
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

impl Default for SendLimiter {
    fn default() -> Self {
        Self::new(5, 5.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_admits_back_to_back() {
        let mut pacer = SendPacer::new(5, 5.0);
        let now = Instant::now();
        for i in 0..5 {
            assert!(pacer.admit(now).is_none(), "send {} should pass", i);
        }
    }

    #[test]
    fn test_exhausted_burst_reports_wait() {
        let mut pacer = SendPacer::new(2, 1.0);
        let now = Instant::now();
        assert!(pacer.admit(now).is_none());
        assert!(pacer.admit(now).is_none());
        let wait = pacer.admit(now).expect("third send must wait");
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_secs(1));
    }

    #[test]
    fn test_denied_admit_does_not_advance_state() {
        let mut pacer = SendPacer::new(1, 1.0);
        let now = Instant::now();
        assert!(pacer.admit(now).is_none());
        let first = pacer.admit(now).unwrap();
        let second = pacer.admit(now).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_elapsed_time_restores_headroom() {
        let mut pacer = SendPacer::new(2, 2.0);
        let now = Instant::now();
        assert!(pacer.admit(now).is_none());
        assert!(pacer.admit(now).is_none());
        assert!(pacer.admit(now).is_some());
        // A full second at 2/s pays back both slots.
        let later = now + Duration::from_secs(1);
        assert!(pacer.admit(later).is_none());
        assert!(pacer.admit(later).is_none());
    }

    #[tokio::test]
    async fn test_send_limiter_acquire() {
        let limiter = SendLimiter::new(3, 100.0); // high rate so test is fast
        for _ in 0..3 {
            limiter.acquire().await;
        }
    }
}
