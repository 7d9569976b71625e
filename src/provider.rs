use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::ProviderConfig;

/// Faults talking to the voice provider, split by what the caller may do
/// about them: retrying helps for some, never for others.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Network fault or provider 5xx; the user may retry.
    #[error("voice provider unavailable: {0}")]
    Unavailable(String),
    /// Provider rejected the request (bad number, missing field).
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
    /// The call already ended; its control endpoint no longer exists.
    #[error("call already ended")]
    ControlEndpointGone,
    /// Transient fault reaching the control endpoint, after one retry.
    #[error("control endpoint unreachable: {0}")]
    ControlEndpointUnavailable(String),
    /// Endpoint resolution never completed for this call.
    #[error("no control endpoint for this call")]
    NoControlEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferDestination {
    pub r#type: String,
    pub number: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum AssistantControl {
    MuteAssistant,
    UnmuteAssistant,
}

/// Command objects posted to a per-call control endpoint. The wire shapes
/// are the provider's contract; keep them in one place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlCommand {
    AddMessage { message: ControlMessage },
    Say { content: String },
    Transfer { destination: TransferDestination },
    Control { control: AssistantControl },
    EndCall,
}

impl ControlCommand {
    /// Whisper: a system instruction only the AI assistant hears.
    pub fn whisper(content: &str) -> Self {
        ControlCommand::AddMessage {
            message: ControlMessage {
                role: "system".to_string(),
                content: content.to_string(),
            },
        }
    }

    /// Barge: an utterance the assistant speaks aloud to the customer.
    pub fn barge(content: &str) -> Self {
        ControlCommand::Say {
            content: content.to_string(),
        }
    }

    pub fn transfer(destination: &str) -> Self {
        ControlCommand::Transfer {
            destination: TransferDestination {
                r#type: "number".to_string(),
                number: destination.to_string(),
            },
        }
    }

    pub fn mute(muted: bool) -> Self {
        ControlCommand::Control {
            control: if muted {
                AssistantControl::MuteAssistant
            } else {
                AssistantControl::UnmuteAssistant
            },
        }
    }

    pub fn end() -> Self {
        ControlCommand::EndCall
    }
}

/// Call metadata passed along to the provider on creation.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    pub lead_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct CreatedCall {
    pub external_call_id: String,
    pub listen_url: Option<String>,
}

/// Point-in-time provider view of a call; used both by the endpoint
/// resolution poll and for webhook corroboration.
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    pub status: String,
    pub listen_url: Option<String>,
    pub control_endpoint: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_reason: Option<String>,
}

impl CallSnapshot {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "ended" | "completed" | "failed")
    }
}

/// The listen URL published by the provider is a WebSocket monitor URL;
/// the control endpoint lives at the same host/path family with a
/// `control` segment and an HTTP scheme. This transform is load-bearing
/// for every control operation, so it lives here and nowhere else.
pub fn derive_control_url(listen_url: &str) -> Result<String> {
    let url = Url::parse(listen_url)?;
    let scheme = match url.scheme() {
        "wss" | "https" => "https",
        "ws" | "http" => "http",
        other => return Err(anyhow!("unexpected monitor URL scheme: {}", other)),
    };
    let path = url
        .path()
        .split('/')
        .map(|seg| if seg == "listen" { "control" } else { seg })
        .collect::<Vec<_>>()
        .join("/");
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("monitor URL has no host: {}", listen_url))?;
    let mut out = format!("{}://{}", scheme, host);
    if let Some(port) = url.port() {
        out.push_str(&format!(":{}", port));
    }
    out.push_str(&path);
    Ok(out)
}

/// Outbound HTTP surface to the voice provider. A trait so the session
/// tracker and handlers can run against a fake in tests.
#[async_trait]
pub trait VoiceProvider: Send + Sync {
    async fn create_call(
        &self,
        phone: &str,
        context: CallContext,
    ) -> Result<CreatedCall, ProviderError>;

    async fn get_call(&self, external_call_id: &str) -> Result<CallSnapshot, ProviderError>;

    /// Post a command to the per-call control endpoint. Retries once on
    /// transient failure; a gone endpoint is reported as such and must
    /// not be retried by the caller.
    async fn send_control(
        &self,
        control_url: &str,
        command: &ControlCommand,
    ) -> Result<(), ProviderError>;

    /// Tear the call down via the provider API (works even when no
    /// control endpoint ever resolved).
    async fn end_call(&self, external_call_id: &str) -> Result<(), ProviderError>;
}

pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    assistant_id: String,
    phone_number_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderCallBody {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    ended_reason: Option<String>,
    #[serde(default)]
    monitor: Option<MonitorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitorBody {
    #[serde(default)]
    listen_url: Option<String>,
    #[serde(default)]
    control_url: Option<String>,
}

impl ProviderClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            assistant_id: config.assistant_id.clone(),
            phone_number_id: config.phone_number_id.clone(),
        })
    }

    fn snapshot_from(body: ProviderCallBody) -> CallSnapshot {
        let (listen_url, control_url) = match body.monitor {
            Some(m) => (m.listen_url, m.control_url),
            None => (None, None),
        };
        // Providers that only publish a listen URL still get a control
        // endpoint through the derivation.
        let control_endpoint = control_url.or_else(|| {
            listen_url
                .as_deref()
                .and_then(|u| derive_control_url(u).ok())
        });
        CallSnapshot {
            status: body.status.unwrap_or_default(),
            listen_url,
            control_endpoint,
            started_at: body.started_at,
            ended_at: body.ended_at,
            ended_reason: body.ended_reason,
        }
    }

    async fn read_error(resp: reqwest::Response) -> String {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str().map(String::from)))
            .unwrap_or(body);
        format!("{}: {}", status, message)
    }
}

#[async_trait]
impl VoiceProvider for ProviderClient {
    async fn create_call(
        &self,
        phone: &str,
        context: CallContext,
    ) -> Result<CreatedCall, ProviderError> {
        let payload = json!({
            "assistantId": self.assistant_id,
            "phoneNumberId": self.phone_number_id,
            "customer": { "number": phone },
            "metadata": context,
        });
        info!(phone = %phone, "creating provider call");
        let resp = self
            .http
            .post(format!("{}/call", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        if resp.status().is_client_error() {
            return Err(ProviderError::InvalidDestination(
                Self::read_error(resp).await,
            ));
        }
        if !resp.status().is_success() {
            return Err(ProviderError::Unavailable(Self::read_error(resp).await));
        }
        let body: ProviderCallBody = resp
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        let listen_url = body.monitor.and_then(|m| m.listen_url);
        Ok(CreatedCall {
            external_call_id: body.id,
            listen_url,
        })
    }

    async fn get_call(&self, external_call_id: &str) -> Result<CallSnapshot, ProviderError> {
        let resp = self
            .http
            .get(format!("{}/call/{}", self.base_url, external_call_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ProviderError::Unavailable(Self::read_error(resp).await));
        }
        let body: ProviderCallBody = resp
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        Ok(Self::snapshot_from(body))
    }

    async fn send_control(
        &self,
        control_url: &str,
        command: &ControlCommand,
    ) -> Result<(), ProviderError> {
        let mut last_err = None;
        // one bounded retry on transient failure
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            let result = self
                .http
                .post(control_url)
                .bearer_auth(&self.api_key)
                .json(command)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status().is_client_error() => {
                    // the endpoint only 4xxes once the call is over
                    warn!(url = %control_url, status = %resp.status(), "control endpoint gone");
                    return Err(ProviderError::ControlEndpointGone);
                }
                Ok(resp) => {
                    last_err = Some(Self::read_error(resp).await);
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                }
            }
        }
        Err(ProviderError::ControlEndpointUnavailable(
            last_err.unwrap_or_else(|| "unknown".to_string()),
        ))
    }

    async fn end_call(&self, external_call_id: &str) -> Result<(), ProviderError> {
        let resp = self
            .http
            .delete(format!("{}/call/{}", self.base_url, external_call_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        if resp.status().is_client_error() {
            return Err(ProviderError::ControlEndpointGone);
        }
        if !resp.status().is_success() {
            return Err(ProviderError::Unavailable(Self::read_error(resp).await));
        }
        Ok(())
    }
}
