//! Client configuration and credential loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    BATCH_EXECUTE_PATH, BATCH_EXECUTE_URL, GENERATE_PATH, GENERATE_URL, INIT_PATH, INIT_URL,
    ROTATE_COOKIES_PATH, ROTATE_COOKIES_URL, UPLOAD_PATH, UPLOAD_URL,
};
use crate::error::{GeminiError, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(540);

pub const ENV_SECURE_1PSID: &str = "GEMINI_SECURE_1PSID";
pub const ENV_SECURE_1PSIDTS: &str = "GEMINI_SECURE_1PSIDTS";
pub const ENV_PROXY: &str = "GEMINI_PROXY";

/// Service URLs used by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Bootstrap page scraped for session values.
    pub init: String,
    /// Streaming generate endpoint.
    pub generate: String,
    /// Cookie rotation endpoint.
    pub rotate_cookies: String,
    /// Multipart file upload endpoint.
    pub upload: String,
    /// Batched RPC endpoint.
    pub batch_execute: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            init: INIT_URL.to_string(),
            generate: GENERATE_URL.to_string(),
            rotate_cookies: ROTATE_COOKIES_URL.to_string(),
            upload: UPLOAD_URL.to_string(),
            batch_execute: BATCH_EXECUTE_URL.to_string(),
        }
    }
}

impl Endpoints {
    /// All endpoints rebased onto one origin, keeping the upstream paths.
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            init: format!("{base}{INIT_PATH}"),
            generate: format!("{base}{GENERATE_PATH}"),
            rotate_cookies: format!("{base}{ROTATE_COOKIES_PATH}"),
            upload: format!("{base}{UPLOAD_PATH}"),
            batch_execute: format!("{base}{BATCH_EXECUTE_PATH}"),
        }
    }
}

/// Settings for a [`crate::GeminiClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `__Secure-1PSID` cookie. Required.
    pub secure_1psid: String,
    /// `__Secure-1PSIDTS` cookie, if the account issues one.
    pub secure_1psidts: Option<String>,
    /// HTTP or SOCKS proxy URL.
    pub proxy: Option<String>,
    /// Deadline for bootstrap, rotation, batch calls and generate response headers.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Rotate cookies in the background after `initialize`.
    pub auto_refresh: bool,
    /// Interval between background rotations.
    #[serde(with = "duration_secs")]
    pub refresh_interval: Duration,
    /// Service URLs; rebased in tests.
    pub endpoints: Endpoints,
}

impl ClientConfig {
    pub fn builder(secure_1psid: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(secure_1psid)
    }

    /// Config built from resolved credentials with every other setting at its default.
    pub fn from_credentials(credentials: Credentials) -> Self {
        ClientConfigBuilder::new(credentials.secure_1psid)
            .secure_1psidts(credentials.secure_1psidts)
            .proxy(credentials.proxy)
            .build()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new(secure_1psid: impl Into<String>) -> Self {
        Self {
            config: ClientConfig {
                secure_1psid: secure_1psid.into(),
                secure_1psidts: None,
                proxy: None,
                timeout: DEFAULT_TIMEOUT,
                auto_refresh: true,
                refresh_interval: DEFAULT_REFRESH_INTERVAL,
                endpoints: Endpoints::default(),
            },
        }
    }

    pub fn secure_1psidts(mut self, value: impl Into<Option<String>>) -> Self {
        self.config.secure_1psidts = value.into().filter(|v| !v.is_empty());
        self
    }

    pub fn proxy(mut self, proxy: impl Into<Option<String>>) -> Self {
        self.config.proxy = proxy.into().filter(|v| !v.is_empty());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn auto_refresh(mut self, enabled: bool) -> Self {
        self.config.auto_refresh = enabled;
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.refresh_interval = interval;
        self
    }

    pub fn endpoints(mut self, endpoints: Endpoints) -> Self {
        self.config.endpoints = endpoints;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Cookie values and proxy as stored in the credentials file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// `__Secure-1PSID` cookie value.
    pub secure_1psid: String,
    /// `__Secure-1PSIDTS` cookie value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_1psidts: Option<String>,
    /// Proxy URL to route requests through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl Credentials {
    /// Read credentials through an arbitrary variable lookup. Returns `None`
    /// when the PSID variable is unset or empty.
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secure_1psid = non_empty(ENV_SECURE_1PSID)?;
        Some(Self {
            secure_1psid,
            secure_1psidts: non_empty(ENV_SECURE_1PSIDTS),
            proxy: non_empty(ENV_PROXY),
        })
    }

    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GeminiError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let credentials: Credentials = serde_json::from_str(&raw).map_err(|e| {
            GeminiError::Config(format!("invalid credentials file {}: {e}", path.display()))
        })?;
        if credentials.secure_1psid.trim().is_empty() {
            return Err(GeminiError::Config(format!(
                "{} has an empty secure_1psid",
                path.display()
            )));
        }
        Ok(credentials)
    }

    /// `<config dir>/gemini-webapi/credentials.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gemini-webapi").join("credentials.json"))
    }

    /// Environment first, then the credentials file.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with(|key| std::env::var(key).ok(), Self::default_path())
    }

    pub fn resolve_with<F>(lookup: F, file: Option<PathBuf>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(credentials) = Self::from_lookup(lookup) {
            tracing::debug!("credentials loaded from environment");
            return Ok(credentials);
        }
        match file {
            Some(path) if path.exists() => {
                tracing::debug!(path = %path.display(), "credentials loaded from file");
                Self::from_file(&path)
            }
            _ => Err(GeminiError::Config(format!(
                "__Secure-1PSID not found; set {ENV_SECURE_1PSID} or write a credentials file"
            ))),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
