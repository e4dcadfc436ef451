//! Session configuration.

use std::{fmt, path::PathBuf};

use url::Url;
use worker_bridge_core::outbox::DEFAULT_CAPACITY;
use worker_bridge_transport::ReconnectPolicy;

pub const API_URL_VAR: &str = "WORKER_BRIDGE_API_URL";
pub const ACCESS_TOKEN_VAR: &str = "WORKER_BRIDGE_ACCESS_TOKEN";
pub const PROJECT_VAR: &str = "WORKER_BRIDGE_PROJECT";
pub const ENV_FILE_VAR: &str = "WORKER_BRIDGE_ENV_FILE";

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Invalid API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
}

/// Everything a session needs to know about its environment.
#[derive(Clone)]
pub struct SessionConfig {
    pub api_url: String,
    pub access_token: String,
    pub project_ref: String,
    /// Project root the builder runs in.
    pub working_dir: PathBuf,
    /// Env file to load; the source's default location when `None`.
    pub env_file: Option<PathBuf>,
    /// Packages the worker process instruments at import time.
    pub instrumented_packages: Vec<String>,
    pub reconnect: ReconnectPolicy,
    pub max_queued_messages: usize,
    pub cli_version: String,
}

impl SessionConfig {
    /// Create a configuration with default transport settings.
    pub fn new(
        api_url: impl Into<String>,
        access_token: impl Into<String>,
        project_ref: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            access_token: access_token.into(),
            project_ref: project_ref.into(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_file: None,
            instrumented_packages: Vec::new(),
            reconnect: ReconnectPolicy::default(),
            max_queued_messages: DEFAULT_CAPACITY,
            cli_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Read the configuration from process environment variables.
    ///
    /// # Errors
    /// Returns error if a required variable is unset or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`.
    ///
    /// # Errors
    /// Returns error if a required variable is unset or empty.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let mut config = Self::new(
            required(API_URL_VAR)?,
            required(ACCESS_TOKEN_VAR)?,
            required(PROJECT_VAR)?,
        );
        config.env_file = lookup(ENV_FILE_VAR)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Ok(config)
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_instrumented_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instrumented_packages = packages.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    #[must_use]
    pub const fn with_max_queued_messages(mut self, max: usize) -> Self {
        self.max_queued_messages = max;
        self
    }

    #[must_use]
    pub fn with_cli_version(mut self, version: impl Into<String>) -> Self {
        self.cli_version = version.into();
        self
    }

    /// Socket endpoint derived from the API URL.
    ///
    /// # Errors
    /// Returns error if the API URL does not parse or is not HTTP(S)/WS(S).
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.api_url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        url.set_scheme(scheme)
            .map_err(|()| ConfigError::UnsupportedScheme(url.scheme().to_string()))?;
        url.set_path("/ws");
        url.set_query(None);
        Ok(url)
    }

    /// `User-Agent` sent on the socket handshake.
    #[must_use]
    pub fn user_agent(&self) -> String {
        format!("worker-bridge/{}", self.cli_version)
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("api_url", &self.api_url)
            .field("access_token", &"<redacted>")
            .field("project_ref", &self.project_ref)
            .field("working_dir", &self.working_dir)
            .field("env_file", &self.env_file)
            .field("instrumented_packages", &self.instrumented_packages)
            .field("reconnect", &self.reconnect)
            .field("max_queued_messages", &self.max_queued_messages)
            .field("cli_version", &self.cli_version)
            .finish()
    }
}
