use chrono::{DateTime, Duration as ChronoDuration, Utc};
use qqgate_core::{Account, Error, Result};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TOKEN_ENDPOINT: &str = "https://bots.qq.com/app/getAppAccessToken";
/// Refresh 5 minutes before expiry.
const REFRESH_MARGIN_SECS: i64 = 300;
/// Upper bound of the random refresh lead, spreading replicas apart.
const REFRESH_JITTER_MS: u64 = 30_000;
/// Retry delay after a failed background refresh.
const REFRESH_RETRY_SECS: u64 = 5;

/// One fetched token together with the two deadlines derived from it at
/// fetch time: when on-demand callers must stop trusting it, and when the
/// platform actually kills it (the refresh loop aims between the two).
#[derive(Debug, Clone)]
struct TokenEntry {
    access_token: String,
    /// Past this point, callers fetch anew (expiry minus the margin).
    stale_after: DateTime<Utc>,
    /// Hard expiry as reported by the platform.
    expires_at: DateTime<Utc>,
}

impl TokenEntry {
    fn issue(access_token: String, expires_in_secs: i64, issued_at: DateTime<Utc>) -> Self {
        let expires_at = issued_at + ChronoDuration::seconds(expires_in_secs);
        Self {
            access_token,
            stale_after: expires_at - ChronoDuration::seconds(REFRESH_MARGIN_SECS),
            expires_at,
        }
    }

    fn fresh(&self) -> bool {
        self.fresh_at(Utc::now())
    }

    fn fresh_at(&self, at: DateTime<Utc>) -> bool {
        at < self.stale_after
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    /// The platform has been observed returning this both as a number and
    /// as a string.
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

fn parse_expires_in(v: &Option<serde_json::Value>) -> i64 {
    v.as_ref()
        .and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(7200)
}

/// Cached app access token for one account. The fetch happens while holding
/// the cache lock, so concurrent callers collapse onto a single in-flight
/// request and then read the fresh cache. `clear()` takes the same lock and
/// therefore never interrupts a fetch already running.
pub struct TokenStore {
    app_id: String,
    client_secret: String,
    client: Client,
    cache: Mutex<Option<TokenEntry>>,
}

impl TokenStore {
    pub fn new(account: &Account, client: Client) -> Self {
        Self {
            app_id: account.app_id.clone(),
            client_secret: account.client_secret.clone(),
            client,
            cache: Mutex::new(None),
        }
    }

    /// Current access token, fetching a fresh one when the cache is empty or
    /// past its staleness deadline.
    pub async fn access_token(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.as_ref() {
            if entry.fresh() {
                return Ok(entry.access_token.clone());
            }
        }
        let fetched = self.fetch().await?;
        let token = fetched.access_token.clone();
        *cache = Some(fetched);
        Ok(token)
    }

    /// Drop the cached token. The next caller fetches a new one.
    pub async fn clear(&self) {
        *self.cache.lock().await = None;
        debug!(app_id = %self.app_id, "Access token cache cleared");
    }

    async fn fetch(&self) -> Result<TokenEntry> {
        let resp = self
            .client
            .post(TOKEN_ENDPOINT)
            .json(&serde_json::json!({
                "appId": self.app_id,
                "clientSecret": self.client_secret,
            }))
            .send()
            .await
            .map_err(|e| Error::Network(format!("token request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                code: 0,
                message: format!("token endpoint: {}", truncate(&body, 200)),
            });
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::ProtocolDecode(format!("token response: {}", e)))?;

        let token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::ProtocolDecode("no access_token in response".to_string()))?;
        let expires_in = parse_expires_in(&body.expires_in);

        info!(app_id = %self.app_id, expires_in, "Access token refreshed");
        Ok(TokenEntry::issue(token, expires_in, Utc::now()))
    }

    /// Unconditional refresh used by the background loop (the ordinary getter
    /// would just return the still-fresh cache at the jittered lead time).
    async fn refresh_now(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let fetched = self.fetch().await?;
        *cache = Some(fetched);
        Ok(())
    }

    /// Proactive refresh loop: sleeps until the staleness deadline (minus up
    /// to 30 s of jitter), refreshes, and retries after 5 s on failure.
    /// Exits when the account shuts down.
    pub async fn run_refresh_loop(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        loop {
            let sleep_for = {
                let cache = self.cache.lock().await;
                match cache.as_ref() {
                    Some(entry) => {
                        let jitter_ms = rand::thread_rng().gen_range(0..=REFRESH_JITTER_MS);
                        let due_ms = entry.expires_at.timestamp_millis()
                            - REFRESH_MARGIN_SECS * 1000
                            - jitter_ms as i64;
                        let delta = due_ms - Utc::now().timestamp_millis();
                        Duration::from_millis(delta.max(1000) as u64)
                    }
                    // Nothing cached yet; check back shortly rather than
                    // racing the first on-demand fetch.
                    None => Duration::from_secs(REFRESH_RETRY_SECS),
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.recv() => break,
            }

            // Skip the refresh when nothing is cached (no consumer yet).
            let has_token = self.cache.lock().await.is_some();
            if !has_token {
                continue;
            }

            if let Err(e) = self.refresh_now().await {
                warn!(app_id = %self.app_id, error = %e, "Background token refresh failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(REFRESH_RETRY_SECS)) => {}
                    _ = shutdown.recv() => break,
                }
            }
        }
        debug!(app_id = %self.app_id, "Token refresh loop stopped");
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_goes_stale_at_margin() {
        let issued = Utc::now();
        let entry = TokenEntry::issue("t".to_string(), 7200, issued);
        assert!(entry.fresh_at(issued));
        let margin = ChronoDuration::seconds(REFRESH_MARGIN_SECS);
        assert!(entry.fresh_at(entry.expires_at - margin - ChronoDuration::seconds(1)));
        assert!(!entry.fresh_at(entry.expires_at - margin));
        assert!(!entry.fresh_at(entry.expires_at));
    }

    #[test]
    fn test_short_lived_token_is_born_stale() {
        // expires_in below the margin: no window in which callers may use it
        // from cache, every call re-fetches.
        let issued = Utc::now();
        let entry = TokenEntry::issue("t".to_string(), 60, issued);
        assert!(!entry.fresh_at(issued));
    }

    #[test]
    fn test_expires_in_number_or_string() {
        let r: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_in":7200}"#).unwrap();
        assert_eq!(parse_expires_in(&r.expires_in), 7200);

        let r: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_in":"3600"}"#).unwrap();
        assert_eq!(parse_expires_in(&r.expires_in), 3600);

        let r: TokenResponse = serde_json::from_str(r#"{"access_token":"a"}"#).unwrap();
        assert_eq!(parse_expires_in(&r.expires_in), 7200);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("机器人错误信息", 2), "机器");
        assert_eq!(truncate("ok", 200), "ok");
    }
}
