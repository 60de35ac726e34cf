use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::paths::Paths;

/// Where an account's client secret comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecretSource {
    #[default]
    Config,
    File,
    Env,
    None,
}

/// Raw per-account block as it appears in config.json. Every field is
/// optional-tolerant; normalization produces the fully-populated `Account`
/// that the rest of the code consumes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub client_secret_file: Option<String>,
    #[serde(default)]
    pub secret_source: Option<SecretSource>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub image_server_base: Option<String>,
    #[serde(default)]
    pub markdown_support: bool,
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageServerConfig {
    #[serde(default = "default_image_server_port")]
    pub port: u16,
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_image_server_port() -> u16 {
    18765
}

impl Default for ImageServerConfig {
    fn default() -> Self {
        Self {
            port: default_image_server_port(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default)]
    pub accounts: Vec<RawAccount>,
    #[serde(default)]
    pub image_server: ImageServerConfig,
}

/// A fully-resolved bot account. Immutable while its gateway runs.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub app_id: String,
    pub client_secret: String,
    pub secret_source: SecretSource,
    pub system_prompt: Option<String>,
    pub image_server_base: Option<String>,
    pub markdown_support: bool,
    pub proxy: Option<String>,
}

impl Account {
    pub fn is_configured(&self) -> bool {
        !self.app_id.is_empty() && !self.client_secret.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub accounts: Vec<Account>,
    pub image_server: ImageServerConfig,
}

impl Config {
    pub fn load(paths: &Paths) -> Result<Self> {
        let file = Self::read_file(&paths.config_file())?;
        Self::normalize(file)
    }

    fn read_file(path: &Path) -> Result<ConfigFile> {
        if !path.exists() {
            return Ok(ConfigFile::default());
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Resolve every raw account block into a fully-populated `Account`.
    /// When the file names no accounts but QQBOT_APP_ID / QQBOT_CLIENT_SECRET
    /// are set, a single "default" account is synthesized from them.
    pub fn normalize(mut file: ConfigFile) -> Result<Self> {
        if file.accounts.is_empty() {
            if let (Ok(app_id), Ok(secret)) = (
                std::env::var("QQBOT_APP_ID"),
                std::env::var("QQBOT_CLIENT_SECRET"),
            ) {
                if !app_id.is_empty() {
                    file.accounts.push(RawAccount {
                        id: "default".to_string(),
                        app_id,
                        client_secret: Some(secret),
                        secret_source: Some(SecretSource::Env),
                        ..Default::default()
                    });
                }
            }
        }

        if let Ok(port) = std::env::var("QQBOT_IMAGE_SERVER_PORT") {
            if let Ok(port) = port.parse() {
                file.image_server.port = port;
            }
        }
        if let Ok(dir) = std::env::var("QQBOT_IMAGE_SERVER_DIR") {
            if !dir.is_empty() {
                file.image_server.dir = Some(dir);
            }
        }

        let mut accounts = Vec::with_capacity(file.accounts.len());
        for raw in file.accounts {
            accounts.push(normalize_account(raw)?);
        }
        Ok(Self {
            accounts,
            image_server: file.image_server,
        })
    }

    pub fn account(&self, id: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn enabled_accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.iter().filter(|a| a.enabled)
    }
}

fn normalize_account(raw: RawAccount) -> Result<Account> {
    let id = if raw.id.is_empty() {
        raw.app_id.clone()
    } else {
        raw.id
    };
    if id.is_empty() {
        return Err(Error::Config("account without id or appId".to_string()));
    }

    // Secret source precedence: explicit declaration, else inferred from
    // which field is present.
    let source = raw.secret_source.unwrap_or({
        if raw.client_secret.is_some() {
            SecretSource::Config
        } else if raw.client_secret_file.is_some() {
            SecretSource::File
        } else if std::env::var("QQBOT_CLIENT_SECRET").is_ok() {
            SecretSource::Env
        } else {
            SecretSource::None
        }
    });

    let client_secret = match source {
        SecretSource::Config => raw.client_secret.clone().unwrap_or_default(),
        SecretSource::File => match &raw.client_secret_file {
            Some(p) => std::fs::read_to_string(p)
                .map_err(|e| Error::Config(format!("clientSecretFile {}: {}", p, e)))?
                .trim()
                .to_string(),
            None => String::new(),
        },
        SecretSource::Env => std::env::var("QQBOT_CLIENT_SECRET").unwrap_or_default(),
        SecretSource::None => String::new(),
    };

    let name = raw.name.unwrap_or_else(|| id.clone());
    let proxy = resolve_proxy(raw.proxy.as_deref());

    Ok(Account {
        id,
        name,
        enabled: raw.enabled,
        app_id: raw.app_id,
        client_secret,
        secret_source: source,
        system_prompt: raw.system_prompt,
        image_server_base: raw.image_server_base,
        markdown_support: raw.markdown_support,
        proxy,
    })
}

/// Account-level proxy wins; otherwise fall back to the conventional
/// environment variables (uppercase first, then lowercase).
fn resolve_proxy(account_proxy: Option<&str>) -> Option<String> {
    if let Some(p) = account_proxy {
        if p.is_empty() {
            // Explicit empty string forces direct connect.
            return None;
        }
        return Some(p.to_string());
    }
    for var in ["HTTPS_PROXY", "HTTP_PROXY", "https_proxy", "http_proxy"] {
        if let Ok(v) = std::env::var(var) {
            if !v.is_empty() {
                return Some(v);
            }
        }
    }
    None
}
