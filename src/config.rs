use crate::session::SessionTimings;
use anyhow::Error;
use clap::Parser;
use serde::Deserialize;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "callbridge.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub http_addr: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub assistant_id: String,
    pub phone_number_id: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WebhookConfig {
    /// Shared secret for HMAC verification of webhook bodies. Ingress is
    /// unauthenticated when unset (dev only; warned at startup).
    pub secret: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    pub poll_interval_secs: u64,
    pub max_poll_attempts: u32,
    pub terminal_grace_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.vapi.ai".to_string(),
            api_key: String::new(),
            assistant_id: String::new(),
            phone_number_id: String::new(),
            timeout_secs: 30,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            max_poll_attempts: 30,
            terminal_grace_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn timings(&self) -> SessionTimings {
        SessionTimings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_poll_attempts: self.max_poll_attempts,
            terminal_grace: Duration::from_secs(self.terminal_grace_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            log_level: Some("info".to_string()),
            log_file: None,
            provider: ProviderConfig::default(),
            webhook: WebhookConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    /// Secrets come from the environment when present, so a checked-in
    /// config file never has to carry them.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("VOICE_API_KEY") {
            self.provider.api_key = key;
        }
        if let Ok(id) = std::env::var("VOICE_ASSISTANT_ID") {
            self.provider.assistant_id = id;
        }
        if let Ok(id) = std::env::var("VOICE_PHONE_NUMBER_ID") {
            self.provider.phone_number_id = id;
        }
        if let Ok(secret) = std::env::var("WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret);
        }
    }
}
