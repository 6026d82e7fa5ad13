use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

use crate::auth::AuthConfig;

/// Upper bound on session lifetime, roughly a century.
const MAX_SESSION_DAYS: u32 = 36_500;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Name shown on pages and in validation emails
    #[serde(default = "default_site_name")]
    pub site_name: String,
    #[serde(default = "default_true")]
    pub cookie_secure: bool,
    /// Absent means mail is logged rather than sent
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub auth: SessionConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
}

#[derive(Debug, Deserialize)]
pub struct SmtpConfig {
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub password: SecretString,
    pub sender: String,
    #[serde(default = "default_sender_name")]
    pub sender_name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_session_max_age_days")]
    pub session_max_age_days: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_max_age_days: default_session_max_age_days(),
        }
    }
}

impl SessionConfig {
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.session_max_age_days as i64)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    /// Per-source timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_concurrent: default_max_concurrent(),
            user_agent: default_user_agent(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn deserialize_secret<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

fn default_listen() -> String {
    "0.0.0.0:9004".to_string()
}

fn default_database_url() -> String {
    "sqlite:feedmerge.db?mode=rwc".to_string()
}

fn default_site_name() -> String {
    "feedmerge".to_string()
}

fn default_true() -> bool {
    true
}

fn default_smtp_port() -> u16 {
    587
}

fn default_sender_name() -> String {
    "feedmerge email validator".to_string()
}

fn default_session_max_age_days() -> u32 {
    365
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    8
}

fn default_user_agent() -> String {
    "feedmerge/0.1 (Feed Aggregator)".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.fetch.max_concurrent == 0 {
            anyhow::bail!("fetch.max_concurrent must be at least 1");
        }
        if config.fetch.timeout_secs == 0 {
            anyhow::bail!("fetch.timeout_secs must be at least 1");
        }
        if config.auth.session_max_age_days > MAX_SESSION_DAYS {
            anyhow::bail!(
                "auth.session_max_age_days must be at most {}",
                MAX_SESSION_DAYS
            );
        }
        Ok(config)
    }

    pub fn auth_config(&self) -> AuthConfig {
        let (sender, sender_name) = match &self.smtp {
            Some(smtp) => (smtp.sender.clone(), smtp.sender_name.clone()),
            None => (
                format!("noreply@{}.invalid", self.site_name),
                default_sender_name(),
            ),
        };
        AuthConfig {
            site_name: self.site_name.clone(),
            sender,
            sender_name,
        }
    }
}
