use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("API error {status} (code {code}): {message}")]
    Api {
        status: u16,
        code: i64,
        message: String,
    },

    #[error("Auth expired: {0}")]
    AuthExpired(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid session (resumable: {resumable})")]
    InvalidSession { resumable: bool },

    #[error("Bot terminated ({})", if *.banned { "banned" } else { "offline" })]
    BotTerminated { banned: bool },

    #[error("Reply quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Invalid payload: {0}")]
    PayloadInvalid(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ProtocolDecode(e.to_string())
    }
}

impl Error {
    /// True for errors that indicate the cached access token went stale.
    /// The platform reports these inconsistently (HTTP 401, or an error body
    /// mentioning the token), so this matches on both.
    pub fn is_auth_shaped(&self) -> bool {
        match self {
            Error::AuthExpired(_) => true,
            Error::Api {
                status, message, ..
            } => {
                *status == 401
                    || message.contains("401")
                    || message.contains("access_token")
                    || message.contains("token")
            }
            _ => false,
        }
    }

    /// True when the platform is shedding load (connect path backs off 60s).
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Error::RateLimited(_) => true,
            Error::Api { code, message, .. } => {
                *code == 100001 || message.contains("Too many requests")
            }
            Error::Network(msg) => msg.contains("Too many requests"),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_shaped() {
        let e = Error::Api {
            status: 401,
            code: 11244,
            message: "invalid".to_string(),
        };
        assert!(e.is_auth_shaped());

        let e = Error::Api {
            status: 400,
            code: 11243,
            message: "access_token invalid".to_string(),
        };
        assert!(e.is_auth_shaped());

        let e = Error::Network("connection reset".to_string());
        assert!(!e.is_auth_shaped());
    }

    #[test]
    fn test_rate_limited() {
        let e = Error::Api {
            status: 429,
            code: 100001,
            message: "frequency limited".to_string(),
        };
        assert!(e.is_rate_limited());

        let e = Error::Network("Too many requests".to_string());
        assert!(e.is_rate_limited());

        let e = Error::PayloadInvalid("empty".to_string());
        assert!(!e.is_rate_limited());
    }

    #[test]
    fn test_bot_terminated_display() {
        let e = Error::BotTerminated { banned: true };
        assert_eq!(e.to_string(), "Bot terminated (banned)");
        let e = Error::BotTerminated { banned: false };
        assert_eq!(e.to_string(), "Bot terminated (offline)");
    }
}
