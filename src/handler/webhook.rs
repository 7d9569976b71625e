use crate::app::AppState;
use crate::event::{CallEvent, TranscriptTurn};
use crate::relay::EventHub;
use crate::session::TranscriptUpdate;
use crate::store::{AgentStatus, Call, CallOutcome, CallStatus};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

const SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookCall {
    pub id: String,
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub customer: Option<CustomerInfo>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_reason: Option<String>,
    #[serde(default)]
    pub monitor: Option<MonitorInfo>,
}

#[derive(Debug, Deserialize)]
pub struct CustomerInfo {
    #[serde(default)]
    pub number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorInfo {
    #[serde(default)]
    pub listen_url: Option<String>,
}

/// Transcript webhooks arrive either as a full snapshot or as a single
/// appended turn depending on provider mood; both are folded into the
/// session's rolling transcript, and clients always receive the full
/// snapshot.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TranscriptPayload {
    Snapshot(Vec<TranscriptTurn>),
    Single(TranscriptTurn),
    Text(String),
}

/// The closed set of webhook kinds this service reacts to. Anything else
/// is acknowledged and dropped with a log line; ingestion never throws.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookEvent {
    #[serde(rename = "call-started")]
    CallStarted { call: WebhookCall },
    #[serde(rename = "call-ended")]
    CallEnded { call: WebhookCall },
    #[serde(rename = "transcript")]
    Transcript {
        call: WebhookCall,
        transcript: TranscriptPayload,
    },
    #[serde(rename = "speech-update")]
    SpeechUpdate {
        call: WebhookCall,
        role: String,
        status: String,
    },
}

/// Provider webhook ingress. Failures inside reconciliation are logged
/// and acknowledged; a non-2xx would only provoke a provider retry storm.
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(ref secret) = state.config.webhook.secret {
        if !verify_signature(secret, &body, &headers) {
            warn!("webhook rejected: bad or missing signature");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "success": false, "error": "invalid signature" })),
            )
                .into_response();
        }
    }

    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(_) => {
            let kind = serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str().map(String::from)))
                .unwrap_or_else(|| "<unparseable>".to_string());
            info!(kind = %kind, "ignoring unrecognized webhook");
            return Json(json!({ "success": true })).into_response();
        }
    };

    if let Err(e) = apply_event(&state, event).await {
        warn!("webhook reconciliation failed: {:#}", e);
    }
    Json(json!({ "success": true })).into_response()
}

fn verify_signature(secret: &str, body: &[u8], headers: &HeaderMap) -> bool {
    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| hex::decode(v).ok())
    else {
        return false;
    };
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Normalize one webhook into store writes and room broadcasts. This is
/// the single ingress into the relay for provider events, which is what
/// preserves per-call broadcast order.
pub async fn apply_event(state: &AppState, event: WebhookEvent) -> anyhow::Result<()> {
    match event {
        WebhookEvent::CallStarted { call } => on_call_started(state, call).await,
        WebhookEvent::CallEnded { call } => on_call_ended(state, call).await,
        WebhookEvent::Transcript { call, transcript } => {
            on_transcript(state, call, transcript).await
        }
        WebhookEvent::SpeechUpdate { call, role, status } => {
            on_speech_update(state, call, role, status).await
        }
    }
}

async fn on_call_started(state: &AppState, webhook: WebhookCall) -> anyhow::Result<()> {
    match state.store.get_by_external_id(&webhook.id).await {
        Some(call) => on_known_call_started(state, call, webhook).await,
        None => on_inbound_call_started(state, webhook).await,
    }
}

async fn on_known_call_started(
    state: &AppState,
    call: Call,
    webhook: WebhookCall,
) -> anyhow::Result<()> {
    let answered_at = webhook.started_at.unwrap_or_else(Utc::now);
    let transitioned = state.store.mark_connected(call.id, answered_at).await?;

    // the webhook usually carries the monitor URL before the poll finds it
    let listen_url = webhook.monitor.and_then(|m| m.listen_url);
    let control_url = match listen_url.as_deref() {
        Some(url) => state.sessions.resolve_from_listen_url(&webhook.id, url).await,
        None => None,
    };
    state
        .sessions
        .set_last_status(&webhook.id, CallStatus::InProgress)
        .await;

    if !transitioned {
        info!(call = %call.id, "duplicate call-started ignored");
        return Ok(());
    }
    state
        .hub
        .publish(
            &EventHub::call_room(call.id),
            CallEvent::Connected {
                external_call_id: webhook.id,
                listen_url,
                control_url,
            },
        )
        .await;
    Ok(())
}

async fn on_inbound_call_started(state: &AppState, webhook: WebhookCall) -> anyhow::Result<()> {
    let inbound = webhook
        .r#type
        .as_deref()
        .map(|t| t.to_ascii_lowercase().contains("inbound"))
        .unwrap_or(false);
    if !inbound {
        info!(external = %webhook.id, "call-started for unknown non-inbound call ignored");
        return Ok(());
    }
    let Some(phone) = webhook.customer.as_ref().and_then(|c| c.number.clone()) else {
        warn!(external = %webhook.id, "inbound call without customer number ignored");
        return Ok(());
    };

    // unmatched is a valid outcome, never a failure
    let matched_lead = state.leads.find_by_phone(&phone).await;

    let mut call = Call::inbound(&phone);
    call.external_call_id = Some(webhook.id.clone());
    call.lead_id = matched_lead.as_ref().map(|l| l.id);
    call.status = CallStatus::InProgress;
    call.answered_at = webhook.started_at.or_else(|| Some(Utc::now()));
    state.store.insert(call.clone()).await?;

    let listen_url = webhook.monitor.and_then(|m| m.listen_url);
    state
        .sessions
        .register(call.id, &webhook.id, listen_url)
        .await;
    state
        .sessions
        .set_last_status(&webhook.id, CallStatus::InProgress)
        .await;

    info!(call = %call.id, external = %webhook.id, phone = %phone, "inbound call created");
    state
        .hub
        .publish(
            &EventHub::role_room(crate::store::Role::Agent),
            CallEvent::Inbound {
                call_id: call.id,
                external_call_id: webhook.id,
                phone,
                matched_lead,
            },
        )
        .await;
    Ok(())
}

async fn on_call_ended(state: &AppState, webhook: WebhookCall) -> anyhow::Result<()> {
    let Some(call) = state.store.get_by_external_id(&webhook.id).await else {
        info!(external = %webhook.id, "call-ended for unknown call ignored");
        return Ok(());
    };

    let ended_at = webhook.ended_at.unwrap_or_else(Utc::now);
    let started_at = webhook.started_at.or(call.started_at);
    let duration = started_at
        .map(|t| (ended_at - t).num_seconds().max(0))
        .unwrap_or(0);
    let talk_time = call
        .answered_at
        .or(started_at)
        .map(|t| (ended_at - t).num_seconds().max(0))
        .unwrap_or(0);
    let status = terminal_status(webhook.ended_reason.as_deref());

    let finished = state
        .store
        .finish(
            call.id,
            CallOutcome {
                status,
                ended_at,
                duration,
                talk_time,
                reason: webhook.ended_reason.clone(),
            },
        )
        .await?;
    if !finished {
        // repeated call-ended: no write, no broadcast
        info!(call = %call.id, "duplicate call-ended ignored");
        return Ok(());
    }

    state
        .hub
        .publish(
            &EventHub::call_room(call.id),
            CallEvent::Ended {
                external_call_id: webhook.id.clone(),
                duration,
                reason: webhook.ended_reason,
            },
        )
        .await;
    if let Some(agent_id) = call.agent_id {
        if let Err(e) = state
            .presence
            .set_status(agent_id, AgentStatus::Available)
            .await
        {
            warn!(agent = %agent_id, "failed to free agent after call end: {:#}", e);
        }
    }
    state.sessions.release(&webhook.id).await;
    Ok(())
}

/// Map the provider's ended reason onto a terminal status.
fn terminal_status(reason: Option<&str>) -> CallStatus {
    let Some(reason) = reason else {
        return CallStatus::Completed;
    };
    let reason = reason.to_ascii_lowercase();
    if reason.contains("no-answer") || reason.contains("did-not-answer") {
        CallStatus::NoAnswer
    } else if reason.contains("busy") {
        CallStatus::Busy
    } else if reason.contains("error") || reason.contains("failed") {
        CallStatus::Failed
    } else {
        CallStatus::Completed
    }
}

async fn on_transcript(
    state: &AppState,
    webhook: WebhookCall,
    payload: TranscriptPayload,
) -> anyhow::Result<()> {
    let update = match payload {
        TranscriptPayload::Snapshot(turns) => TranscriptUpdate::Snapshot(turns),
        TranscriptPayload::Single(turn) => TranscriptUpdate::Append(turn),
        TranscriptPayload::Text(content) => TranscriptUpdate::Append(TranscriptTurn {
            role: "assistant".to_string(),
            content,
        }),
    };
    // fold and broadcast happen under the session lock; concurrent
    // transcript webhooks for one call cannot publish out of order
    if !state.sessions.publish_transcript(&webhook.id, update).await {
        info!(external = %webhook.id, "transcript for unknown or ended call ignored");
    }
    Ok(())
}

async fn on_speech_update(
    state: &AppState,
    webhook: WebhookCall,
    role: String,
    status: String,
) -> anyhow::Result<()> {
    let Some(call) = state.store.get_by_external_id(&webhook.id).await else {
        return Ok(());
    };
    state
        .hub
        .publish(
            &EventHub::call_room(call.id),
            CallEvent::Speech {
                external_call_id: webhook.id,
                role,
                status,
            },
        )
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppState, AppStateBuilder};
    use crate::config::Config;
    use crate::provider::{
        CallContext, CallSnapshot, ControlCommand, CreatedCall, ProviderError, VoiceProvider,
    };
    use crate::store::{LeadRef, MemoryLeadDirectory};
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use chrono::TimeZone;
    use std::sync::Arc;
    use uuid::Uuid;

    struct IdleProvider;

    #[async_trait]
    impl VoiceProvider for IdleProvider {
        async fn create_call(
            &self,
            _phone: &str,
            _context: CallContext,
        ) -> Result<CreatedCall, ProviderError> {
            Ok(CreatedCall {
                external_call_id: "abc123".to_string(),
                listen_url: None,
            })
        }
        async fn get_call(&self, _id: &str) -> Result<CallSnapshot, ProviderError> {
            Ok(CallSnapshot {
                status: "queued".to_string(),
                ..Default::default()
            })
        }
        async fn send_control(
            &self,
            _url: &str,
            _command: &ControlCommand,
        ) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn end_call(&self, _id: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn state_with(leads: Arc<MemoryLeadDirectory>) -> AppState {
        AppStateBuilder::new()
            .config(Config::default())
            .provider(Arc::new(IdleProvider))
            .leads(leads)
            .build()
            .unwrap()
    }

    async fn seed_outbound(state: &AppState, external_id: &str) -> Uuid {
        let mut call = Call::outbound("+15551234567", Uuid::new_v4(), None);
        call.external_call_id = Some(external_id.to_string());
        call.started_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let id = call.id;
        state.store.insert(call).await.unwrap();
        state.sessions.register(id, external_id, None).await;
        id
    }

    fn started(id: &str, listen_url: Option<&str>) -> WebhookEvent {
        serde_json::from_value(json!({
            "type": "call-started",
            "call": { "id": id, "monitor": listen_url.map(|u| json!({ "listenUrl": u })) }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_call_started_transitions_and_broadcasts() {
        let state = state_with(Arc::new(MemoryLeadDirectory::new()));
        let id = seed_outbound(&state, "abc123").await;

        let conn = Uuid::new_v4();
        let mut rx = state.hub.register(conn).await;
        state.hub.subscribe(conn, &EventHub::call_room(id)).await;

        apply_event(&state, started("abc123", Some("wss://x/listen/abc123")))
            .await
            .unwrap();

        let call = state.store.get(id).await.unwrap();
        assert_eq!(call.status, CallStatus::InProgress);
        match rx.recv().await.unwrap() {
            CallEvent::Connected {
                external_call_id,
                control_url,
                ..
            } => {
                assert_eq!(external_call_id, "abc123");
                assert_eq!(control_url.as_deref(), Some("https://x/control/abc123"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // duplicate start changes nothing and broadcasts nothing
        apply_event(&state, started("abc123", None)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_call_ended_is_idempotent() {
        let state = state_with(Arc::new(MemoryLeadDirectory::new()));
        let id = seed_outbound(&state, "abc123").await;
        apply_event(&state, started("abc123", None)).await.unwrap();

        let conn = Uuid::new_v4();
        let mut rx = state.hub.register(conn).await;
        state.hub.subscribe(conn, &EventHub::call_room(id)).await;

        let ended: WebhookEvent = serde_json::from_value(json!({
            "type": "call-ended",
            "call": {
                "id": "abc123",
                "endedReason": "customer-hangup",
                "startedAt": "2024-05-01T12:00:00Z",
                "endedAt": "2024-05-01T12:00:42Z"
            }
        }))
        .unwrap();
        apply_event(&state, ended).await.unwrap();

        let call = state.store.get(id).await.unwrap();
        assert_eq!(call.status, CallStatus::Completed);
        assert_eq!(call.duration, Some(42));
        assert!(matches!(
            rx.recv().await.unwrap(),
            CallEvent::Ended { duration: 42, .. }
        ));

        // identical second webhook: no write, no broadcast
        let again: WebhookEvent = serde_json::from_value(json!({
            "type": "call-ended",
            "call": {
                "id": "abc123",
                "endedReason": "customer-hangup",
                "startedAt": "2024-05-01T12:00:00Z",
                "endedAt": "2024-05-01T12:01:30Z"
            }
        }))
        .unwrap();
        apply_event(&state, again).await.unwrap();
        let call = state.store.get(id).await.unwrap();
        assert_eq!(call.duration, Some(42));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_inbound_call_creates_record() {
        let leads = Arc::new(MemoryLeadDirectory::new());
        let state = state_with(leads.clone());

        let conn = Uuid::new_v4();
        let mut rx = state.hub.register(conn).await;
        state
            .hub
            .subscribe(conn, &EventHub::role_room(crate::store::Role::Agent))
            .await;

        let event: WebhookEvent = serde_json::from_value(json!({
            "type": "call-started",
            "call": {
                "id": "in-789",
                "type": "inboundPhoneCall",
                "customer": { "number": "+15559876543" }
            }
        }))
        .unwrap();
        apply_event(&state, event).await.unwrap();

        let call = state.store.get_by_external_id("in-789").await.unwrap();
        assert_eq!(call.direction, crate::store::Direction::Inbound);
        assert_eq!(call.lead_id, None);
        assert_eq!(call.agent_id, None);
        match rx.recv().await.unwrap() {
            CallEvent::Inbound {
                phone, matched_lead, ..
            } => {
                assert_eq!(phone, "+15559876543");
                assert!(matched_lead.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_call_matches_lead_by_phone() {
        let leads = Arc::new(MemoryLeadDirectory::new());
        let lead = LeadRef {
            id: Uuid::new_v4(),
            name: "Ada".to_string(),
            phone: "+15559876543".to_string(),
        };
        leads.add(lead.clone()).await;
        let state = state_with(leads);

        let event: WebhookEvent = serde_json::from_value(json!({
            "type": "call-started",
            "call": {
                "id": "in-790",
                "type": "inboundPhoneCall",
                "customer": { "number": "+15559876543" }
            }
        }))
        .unwrap();
        apply_event(&state, event).await.unwrap();
        let call = state.store.get_by_external_id("in-790").await.unwrap();
        assert_eq!(call.lead_id, Some(lead.id));
    }

    #[tokio::test]
    async fn test_transcript_folds_and_broadcasts_snapshot() {
        let state = state_with(Arc::new(MemoryLeadDirectory::new()));
        let id = seed_outbound(&state, "abc123").await;
        apply_event(&state, started("abc123", None)).await.unwrap();

        let conn = Uuid::new_v4();
        let mut rx = state.hub.register(conn).await;
        state.hub.subscribe(conn, &EventHub::call_room(id)).await;

        // incremental single-turn shape
        let one: WebhookEvent = serde_json::from_value(json!({
            "type": "transcript",
            "call": { "id": "abc123" },
            "transcript": { "role": "assistant", "content": "hello" }
        }))
        .unwrap();
        apply_event(&state, one).await.unwrap();
        // full snapshot shape
        let full: WebhookEvent = serde_json::from_value(json!({
            "type": "transcript",
            "call": { "id": "abc123" },
            "transcript": [
                { "role": "assistant", "content": "hello" },
                { "role": "user", "content": "hi there" }
            ]
        }))
        .unwrap();
        apply_event(&state, full).await.unwrap();

        match rx.recv().await.unwrap() {
            CallEvent::Transcript { transcript, .. } => assert_eq!(transcript.len(), 1),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            CallEvent::Transcript { transcript, .. } => {
                assert_eq!(transcript.len(), 2);
                assert_eq!(transcript[1].content, "hi there");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transcript_after_call_end_is_suppressed() {
        let state = state_with(Arc::new(MemoryLeadDirectory::new()));
        let id = seed_outbound(&state, "abc123").await;
        apply_event(&state, started("abc123", None)).await.unwrap();

        let conn = Uuid::new_v4();
        let mut rx = state.hub.register(conn).await;
        state.hub.subscribe(conn, &EventHub::call_room(id)).await;

        let ended: WebhookEvent = serde_json::from_value(json!({
            "type": "call-ended",
            "call": { "id": "abc123", "endedReason": "customer-hangup" }
        }))
        .unwrap();
        apply_event(&state, ended).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), CallEvent::Ended { .. }));

        // a straggler transcript webhook after teardown broadcasts nothing
        let late: WebhookEvent = serde_json::from_value(json!({
            "type": "transcript",
            "call": { "id": "abc123" },
            "transcript": { "role": "assistant", "content": "goodbye" }
        }))
        .unwrap();
        apply_event(&state, late).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unrecognized_webhook_is_acknowledged() {
        let state = state_with(Arc::new(MemoryLeadDirectory::new()));
        let body = Bytes::from(r#"{"type":"assistant-request","call":{"id":"x"}}"#);
        let response = handle_webhook(State(state), HeaderMap::new(), body).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_signature_verification() {
        let mut config = Config::default();
        config.webhook.secret = Some("s3cret".to_string());
        let state = AppStateBuilder::new()
            .config(config)
            .provider(Arc::new(IdleProvider))
            .build()
            .unwrap();

        let body = Bytes::from(r#"{"type":"speech-update","call":{"id":"x"},"role":"assistant","status":"started"}"#);

        // unsigned: rejected
        let response = handle_webhook(State(state.clone()), HeaderMap::new(), body.clone()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // properly signed: accepted
        let mut mac = Hmac::<Sha256>::new_from_slice(b"s3cret").unwrap();
        mac.update(&body);
        let signature = hex::encode(mac.finalize().into_bytes());
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, signature.parse().unwrap());
        let response = handle_webhook(State(state), headers, body).await;
        assert_eq!(response.status(), StatusCode::OK);
        let payload = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["success"], true);
    }
}
