use std::sync::Arc;
use std::time::Duration;

use qqgate_core::{Error, Result};
use reqwest::{Client, Method, Proxy};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::rate_limit::SendLimiter;
use crate::token::TokenStore;

pub const API_BASE: &str = "https://api.sgroup.qq.com";

#[derive(Debug, Deserialize, Default)]
struct ApiErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Build the HTTP client an account's REST and token traffic share. When the
/// account configures a forward proxy, everything (token endpoint included)
/// tunnels through it.
pub fn build_http_client(proxy: Option<&str>) -> Client {
    let mut builder = Client::builder().timeout(Duration::from_secs(30));
    if let Some(proxy_url) = proxy {
        match Proxy::all(proxy_url) {
            Ok(p) => {
                info!(proxy = %proxy_url, "HTTP proxy configured");
                builder = builder.proxy(p);
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy_url, "Invalid proxy URL, using direct connect");
            }
        }
    }
    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client, using default");
        Client::new()
    })
}

/// Bot-authenticated JSON client for the platform API host.
pub struct RestClient {
    client: Client,
    token_store: Arc<TokenStore>,
    limiter: SendLimiter,
    base: String,
}

impl RestClient {
    pub fn new(token_store: Arc<TokenStore>, client: Client) -> Self {
        Self {
            client,
            token_store,
            limiter: SendLimiter::default(),
            base: API_BASE.to_string(),
        }
    }

    pub async fn get(&self, path: &str) -> Result<serde_json::Value> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    /// Message POST: rate-limited, and on an auth-shaped failure the token
    /// cache is cleared and the call retried exactly once.
    pub async fn post_message(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.limiter.acquire().await;
        match self.post(path, body).await {
            Err(e) if e.is_auth_shaped() => {
                warn!(path = %path, error = %e, "Auth-shaped send failure, refreshing token and retrying once");
                self.token_store.clear().await;
                self.post(path, body).await
            }
            other => other,
        }
    }

    /// GET /gateway → the WebSocket URL to connect to.
    pub async fn gateway_url(&self) -> Result<String> {
        let body = self.get("/gateway").await?;
        body.get("url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::ProtocolDecode("no url in /gateway response".to_string()))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let token = self.token_store.access_token().await?;
        let url = format!("{}{}", self.base, path);

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", format!("QQBot {}", token))
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            debug!(method = %method, path = %path, body = %redacted(body), "API request");
            req = req.json(body);
        } else {
            debug!(method = %method, path = %path, "API request");
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::Network(format!("{} {}: {}", method, path, e)))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Network(format!("{} {}: read body: {}", method, path, e)))?;

        if !status.is_success() {
            let err: ApiErrorBody = serde_json::from_str(&text).unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                code: err.code,
                message: if err.message.is_empty() {
                    text.chars().take(200).collect()
                } else {
                    err.message
                },
            });
        }

        if text.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| Error::ProtocolDecode(format!("{} {}: {}", method, path, e)))
    }
}

/// Copy of a JSON body with credential-bearing values masked, safe to log.
fn redacted(body: &serde_json::Value) -> serde_json::Value {
    const SENSITIVE: [&str; 3] = ["access_token", "clientSecret", "token"];
    match body {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if SENSITIVE.contains(&k.as_str()) {
                    out.insert(k.clone(), serde_json::Value::String("***".to_string()));
                } else {
                    out.insert(k.clone(), redacted(v));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redacted).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_masks_credentials() {
        let body = serde_json::json!({
            "appId": "102001234",
            "clientSecret": "verysecret",
            "nested": {"access_token": "tok", "content": "hello"},
            "list": [{"token": "QQBot abc"}],
        });
        let clean = redacted(&body);
        let text = clean.to_string();
        assert!(!text.contains("verysecret"));
        assert!(!text.contains("tok\""));
        assert!(!text.contains("QQBot abc"));
        assert!(text.contains("hello"));
        assert!(text.contains("102001234"));
    }

    #[test]
    fn test_api_error_body_parse() {
        let err: ApiErrorBody =
            serde_json::from_str(r#"{"code":11244,"message":"token expired"}"#).unwrap();
        assert_eq!(err.code, 11244);
        assert_eq!(err.message, "token expired");

        let err: ApiErrorBody = serde_json::from_str("{}").unwrap();
        assert_eq!(err.code, 0);
    }

    #[test]
    fn test_build_http_client_bad_proxy_falls_back() {
        // An invalid proxy URL must not panic; the client still builds.
        let _client = build_http_client(Some("::not a url::"));
    }
}
