//! Configuration storage

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::auth::{HandlerConfig, RefreshEncoding};

pub const APP_NAME: &str = "tokenward";

/// Per-service settings, loaded from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Namespace for stored tokens
    pub service_name: String,
    /// Endpoint that exchanges a refresh token for a new access token
    pub refresh_url: Option<String>,
    /// Default access token lifetime; 0 means no expiry
    pub access_token_ttl_secs: u64,
    /// Derive access token lifetime from the token's `exp` claim
    pub per_token_ttl: bool,
    /// Refresh credential is a transport cookie, not a stored token
    pub credentials: bool,
    /// `Cookie` header value carrying the refresh credential in credentials
    /// mode, e.g. `refresh_session=abc123`
    pub refresh_cookie: Option<String>,
    pub encoding: RefreshEncoding,
    pub request_timeout_secs: u64,
    /// Extra fields merged into the refresh request body. Kept last so it
    /// serializes as a trailing table.
    pub extra_params: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "default".to_string(),
            refresh_url: None,
            access_token_ttl_secs: 0,
            per_token_ttl: false,
            credentials: false,
            refresh_cookie: None,
            encoding: RefreshEncoding::Json,
            request_timeout_secs: 30,
            extra_params: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", APP_NAME, APP_NAME)
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // Extra params may carry client secrets
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Handler settings for this service. Fails without a refresh URL.
    pub fn handler_config(&self) -> Result<HandlerConfig> {
        let refresh_url = self
            .refresh_url
            .as_deref()
            .context("No refresh_url configured. Add it to config.toml.")?;
        url::Url::parse(refresh_url)
            .with_context(|| format!("Invalid refresh_url: {}", refresh_url))?;
        if self.credentials && self.refresh_cookie.is_none() {
            anyhow::bail!(
                "credentials = true needs a refresh_cookie to send. Add it to config.toml."
            );
        }

        let mut config = HandlerConfig::new(self.service_name.clone(), refresh_url);
        config.access_token_ttl = Some(Duration::from_secs(self.access_token_ttl_secs));
        config.per_token_ttl = self.per_token_ttl;
        config.credentials = self.credentials;
        config.encoding = self.encoding;
        config.extra_params = self.extra_params.clone();
        Ok(config)
    }
}
