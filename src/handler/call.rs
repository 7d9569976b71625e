use crate::app::AppState;
use crate::error::ApiError;
use crate::event::CallEvent;
use crate::handler::auth::AuthAgent;
use crate::provider::ControlCommand;
use crate::relay::EventHub;
use crate::session::{Dispatch, EndpointState};
use crate::store::{AgentStatus, Call, CallOutcome, CallStatus, Role};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCallRequest {
    pub lead_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub message: String,
    pub control_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub destination: String,
    pub control_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantControlRequest {
    pub control: String,
    pub control_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispositionRequest {
    pub disposition: Option<String>,
    pub notes: Option<String>,
}

/// Initiate an outbound call. Returns immediately with what is known so
/// far; the control endpoint, once resolved, reaches the caller through
/// the call room as `call:connected`.
pub async fn initiate_call(
    State(state): State<AppState>,
    AuthAgent(agent): AuthAgent,
    Json(req): Json<InitiateCallRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let campaign_id = req
        .campaign_id
        .ok_or_else(|| ApiError::Validation("campaignId is required".to_string()))?;

    let lead = match req.lead_id {
        Some(lead_id) => Some(
            state
                .leads
                .get(lead_id)
                .await
                .ok_or(ApiError::NotFound("lead"))?,
        ),
        None => None,
    };
    let phone = req
        .phone_number
        .or_else(|| lead.as_ref().map(|l| l.phone.clone()))
        .ok_or_else(|| ApiError::Validation("phoneNumber is required".to_string()))?;

    let created = state
        .provider
        .create_call(
            &phone,
            crate::provider::CallContext {
                lead_id: req.lead_id,
                campaign_id: Some(campaign_id),
                agent_id: Some(agent.id),
            },
        )
        .await?;

    let mut call = Call::outbound(&phone, agent.id, Some(campaign_id));
    call.lead_id = req.lead_id;
    call.external_call_id = Some(created.external_call_id.clone());
    state.store.insert(call.clone()).await?;

    let session = state
        .sessions
        .register(call.id, &created.external_call_id, created.listen_url.clone())
        .await;
    let control_url = match &session.lock().await.endpoint {
        EndpointState::Resolved(url) => Some(url.clone()),
        _ => None,
    };

    // best effort; a lead-store hiccup must not fail the dial
    if let Some(lead_id) = req.lead_id {
        if let Err(e) = state.leads.record_attempt(lead_id, Utc::now()).await {
            warn!(lead = %lead_id, "failed to record dial attempt: {:#}", e);
        }
    }
    if let Err(e) = state.presence.set_status(agent.id, AgentStatus::Busy).await {
        warn!(agent = %agent.id, "failed to mark agent busy: {:#}", e);
    }

    info!(call = %call.id, external = %created.external_call_id, phone = %phone, "outbound call initiated");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "call": call,
            "externalCall": created.external_call_id,
            "listenUrl": created.listen_url,
            "controlUrl": control_url,
        })),
    ))
}

pub async fn get_call(
    State(state): State<AppState>,
    _auth: AuthAgent,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let call = load_call(&state, id).await?;
    // point-in-time provider view; degrades to the stored record alone
    let detail = match call.external_call_id.as_deref() {
        Some(external_id) => match state.provider.get_call(external_id).await {
            Ok(snapshot) => Some(json!({
                "status": snapshot.status,
                "listenUrl": snapshot.listen_url,
                "controlUrl": snapshot.control_endpoint,
                "endedReason": snapshot.ended_reason,
            })),
            Err(e) => {
                warn!(call = %id, "could not fetch provider call detail: {}", e);
                None
            }
        },
        None => None,
    };
    Ok(Json(json!({
        "success": true,
        "call": call,
        "providerDetail": detail,
    })))
}

pub async fn end_call(
    State(state): State<AppState>,
    _auth: AuthAgent,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let call = load_call(&state, id).await?;
    if call.status.is_terminal() {
        return Err(ApiError::Conflict("call already ended".to_string()));
    }
    if let Some(external_id) = call.external_call_id.as_deref() {
        match state.sessions.dispatch(external_id, ControlCommand::end()).await {
            Ok(Dispatch::Sent) => {}
            // no control channel; the provider API can still tear it down
            _ => {
                if let Err(e) = state.provider.end_call(external_id).await {
                    warn!(call = %id, "provider end_call failed: {}", e);
                }
            }
        }
    }

    let ended_at = Utc::now();
    let duration = call
        .started_at
        .map(|t| (ended_at - t).num_seconds())
        .unwrap_or(0);
    let talk_time = call
        .answered_at
        .map(|t| (ended_at - t).num_seconds())
        .unwrap_or(0);
    let finished = state
        .store
        .finish(
            id,
            CallOutcome {
                status: CallStatus::Completed,
                ended_at,
                duration,
                talk_time,
                reason: Some("ended-by-agent".to_string()),
            },
        )
        .await?;

    if finished {
        if let Some(external_id) = call.external_call_id.as_deref() {
            state
                .hub
                .publish(
                    &EventHub::call_room(id),
                    CallEvent::Ended {
                        external_call_id: external_id.to_string(),
                        duration,
                        reason: Some("ended-by-agent".to_string()),
                    },
                )
                .await;
            state.sessions.release(external_id).await;
        }
        if let Some(agent_id) = call.agent_id {
            let _ = state
                .presence
                .set_status(agent_id, AgentStatus::Available)
                .await;
        }
    }
    let call = load_call(&state, id).await?;
    Ok(Json(json!({ "success": true, "call": call })))
}

pub async fn whisper(
    State(state): State<AppState>,
    _auth: AuthAgent,
    Path(id): Path<Uuid>,
    Json(req): Json<MessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_message(&req.message)?;
    let call = load_call(&state, id).await?;
    run_control(
        &state,
        &call,
        req.control_url,
        ControlCommand::whisper(&req.message),
    )
    .await?;
    info!(call = %id, "whisper delivered");
    Ok(Json(json!({ "success": true })))
}

pub async fn barge(
    State(state): State<AppState>,
    _auth: AuthAgent,
    Path(id): Path<Uuid>,
    Json(req): Json<MessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_message(&req.message)?;
    let call = load_call(&state, id).await?;
    run_control(
        &state,
        &call,
        req.control_url,
        ControlCommand::barge(&req.message),
    )
    .await?;
    info!(call = %id, "barge delivered");
    Ok(Json(json!({ "success": true })))
}

pub async fn transfer(
    State(state): State<AppState>,
    _auth: AuthAgent,
    Path(id): Path<Uuid>,
    Json(req): Json<TransferRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.destination.trim().is_empty() {
        return Err(ApiError::Validation("destination is required".to_string()));
    }
    let call = load_call(&state, id).await?;
    run_control(
        &state,
        &call,
        req.control_url,
        ControlCommand::transfer(&req.destination),
    )
    .await?;

    // ownership moved externally; terminal from our perspective
    if state.store.transition(id, CallStatus::Transferred).await? {
        if let Some(external_id) = call.external_call_id.as_deref() {
            state
                .hub
                .publish(
                    &EventHub::call_room(id),
                    CallEvent::Transferred {
                        external_call_id: external_id.to_string(),
                        destination: req.destination.clone(),
                    },
                )
                .await;
            state.sessions.release(external_id).await;
        }
    }
    info!(call = %id, destination = %req.destination, "call transferred");
    Ok(Json(json!({ "success": true })))
}

pub async fn control(
    State(state): State<AppState>,
    _auth: AuthAgent,
    Path(id): Path<Uuid>,
    Json(req): Json<AssistantControlRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let command = match req.control.as_str() {
        "mute" => ControlCommand::mute(true),
        "unmute" => ControlCommand::mute(false),
        other => {
            return Err(ApiError::Validation(format!(
                "unknown control: {}",
                other
            )))
        }
    };
    let call = load_call(&state, id).await?;
    run_control(&state, &call, req.control_url, command).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn set_disposition(
    State(state): State<AppState>,
    _auth: AuthAgent,
    Path(id): Path<Uuid>,
    Json(req): Json<DispositionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let call = load_call(&state, id).await?;
    if !call.status.is_terminal() {
        return Err(ApiError::Conflict(
            "disposition can only be set after the call ends".to_string(),
        ));
    }
    state
        .store
        .set_disposition(id, req.disposition, req.notes)
        .await?;
    let call = load_call(&state, id).await?;
    Ok(Json(json!({ "success": true, "call": call })))
}

pub async fn get_transcript(
    State(state): State<AppState>,
    _auth: AuthAgent,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let call = load_call(&state, id).await?;
    let transcript = match call.external_call_id.as_deref() {
        Some(external_id) => match state.sessions.get(external_id) {
            Some(session) => session.lock().await.transcript.clone(),
            None => Vec::new(),
        },
        None => Vec::new(),
    };
    Ok(Json(json!({ "success": true, "transcript": transcript })))
}

pub async fn get_listen_url(
    State(state): State<AppState>,
    _auth: AuthAgent,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let call = load_call(&state, id).await?;
    if call.status != CallStatus::InProgress {
        return Err(ApiError::Conflict("call is not in progress".to_string()));
    }
    let external_id = require_external(&call)?;
    let listen_url = match state.sessions.get(&external_id) {
        Some(session) => session.lock().await.listen_url.clone(),
        None => None,
    };
    // session may predate the monitor URL; fall back to a provider fetch
    let listen_url = match listen_url {
        Some(url) => Some(url),
        None => state
            .provider
            .get_call(&external_id)
            .await
            .ok()
            .and_then(|s| s.listen_url),
    };
    Ok(Json(json!({
        "success": true,
        "callId": id,
        "listenUrl": listen_url,
    })))
}

pub async fn active_calls(
    State(state): State<AppState>,
    AuthAgent(agent): AuthAgent,
) -> Result<impl IntoResponse, ApiError> {
    if !matches!(agent.role, Role::Supervisor | Role::Admin) {
        return Err(ApiError::Forbidden);
    }
    let calls = state.store.active().await;
    Ok(Json(json!({
        "success": true,
        "count": calls.len(),
        "calls": calls,
    })))
}

async fn load_call(state: &AppState, id: Uuid) -> Result<Call, ApiError> {
    state.store.get(id).await.ok_or(ApiError::NotFound("call"))
}

fn require_external(call: &Call) -> Result<String, ApiError> {
    call.external_call_id
        .clone()
        .ok_or_else(|| ApiError::Validation("call has no provider call attached".to_string()))
}

fn require_message(message: &str) -> Result<(), ApiError> {
    if message.trim().is_empty() {
        return Err(ApiError::Validation("message is required".to_string()));
    }
    Ok(())
}

/// Route a control command: an explicit controlUrl wins, otherwise it
/// goes through the session tracker, which may queue it until the
/// endpoint resolves. A queued command answers when replayed; a command
/// displaced from the latest-wins slot answers 409.
async fn run_control(
    state: &AppState,
    call: &Call,
    control_url: Option<String>,
    command: ControlCommand,
) -> Result<(), ApiError> {
    if let Some(url) = control_url {
        state.provider.send_control(&url, &command).await?;
        return Ok(());
    }
    let external_id = require_external(call)?;
    match state.sessions.dispatch(&external_id, command).await? {
        Dispatch::Sent => Ok(()),
        Dispatch::Queued(rx) => match rx.await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(ApiError::Conflict(
                "superseded by a newer control command".to_string(),
            )),
        },
    }
}
