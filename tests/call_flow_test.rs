use async_trait::async_trait;
use axum::body::to_bytes;
use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use callbridge::app::{AppState, AppStateBuilder};
use callbridge::config::Config;
use callbridge::handler::auth::AuthAgent;
use callbridge::handler::call::{
    active_calls, end_call, initiate_call, set_disposition, whisper, AssistantControlRequest,
    DispositionRequest, InitiateCallRequest, MessageRequest,
};
use callbridge::handler::webhook::{apply_event, WebhookEvent};
use callbridge::provider::{
    CallContext, CallSnapshot, ControlCommand, CreatedCall, ProviderError, VoiceProvider,
};
use callbridge::store::{
    Agent, AgentDirectory, AgentStatus, CallStatus, LeadRef, MemoryAgentDirectory,
    MemoryLeadDirectory, Role,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Stand-in provider: answers creations with a fixed external id and
/// records every control command posted to it.
struct FakeProvider {
    listen_url: Option<String>,
    sent: Mutex<Vec<(String, ControlCommand)>>,
    ended: Mutex<Vec<String>>,
}

impl FakeProvider {
    fn new(listen_url: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            listen_url: listen_url.map(String::from),
            sent: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<(String, ControlCommand)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl VoiceProvider for FakeProvider {
    async fn create_call(
        &self,
        _phone: &str,
        _context: CallContext,
    ) -> Result<CreatedCall, ProviderError> {
        Ok(CreatedCall {
            external_call_id: "ext-1".to_string(),
            listen_url: self.listen_url.clone(),
        })
    }

    async fn get_call(&self, _id: &str) -> Result<CallSnapshot, ProviderError> {
        Ok(CallSnapshot {
            status: "ringing".to_string(),
            ..Default::default()
        })
    }

    async fn send_control(
        &self,
        control_url: &str,
        command: &ControlCommand,
    ) -> Result<(), ProviderError> {
        self.sent
            .lock()
            .unwrap()
            .push((control_url.to_string(), command.clone()));
        Ok(())
    }

    async fn end_call(&self, id: &str) -> Result<(), ProviderError> {
        self.ended.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

struct Fixture {
    state: AppState,
    provider: Arc<FakeProvider>,
    agents: Arc<MemoryAgentDirectory>,
    leads: Arc<MemoryLeadDirectory>,
    agent: Agent,
    supervisor: Agent,
    lead: LeadRef,
}

async fn fixture(listen_url: Option<&str>) -> Fixture {
    let provider = FakeProvider::new(listen_url);
    let agents = Arc::new(MemoryAgentDirectory::new());
    let agent = Agent {
        id: Uuid::new_v4(),
        name: "Pat".to_string(),
        role: Role::Agent,
        status: AgentStatus::Available,
    };
    let supervisor = Agent {
        id: Uuid::new_v4(),
        name: "Sam".to_string(),
        role: Role::Supervisor,
        status: AgentStatus::Available,
    };
    agents.add(agent.clone(), "token-pat").await;
    agents.add(supervisor.clone(), "token-sam").await;

    let leads = Arc::new(MemoryLeadDirectory::new());
    let lead = LeadRef {
        id: Uuid::new_v4(),
        name: "Ada".to_string(),
        phone: "+15551234567".to_string(),
    };
    leads.add(lead.clone()).await;

    let mut config = Config::default();
    config.session = callbridge::config::SessionConfig {
        poll_interval_secs: 60, // tests resolve through webhooks, not polling
        max_poll_attempts: 2,
        terminal_grace_secs: 60,
    };
    let state = AppStateBuilder::new()
        .config(config)
        .provider(provider.clone())
        .agents(agents.clone())
        .leads(leads.clone())
        .build()
        .unwrap();
    Fixture {
        state,
        provider,
        agents,
        leads,
        agent,
        supervisor,
        lead,
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn dial(fx: &Fixture) -> Uuid {
    let response = initiate_call(
        State(fx.state.clone()),
        AuthAgent(fx.agent.clone()),
        Json(InitiateCallRequest {
            lead_id: Some(fx.lead.id),
            campaign_id: Some(Uuid::new_v4()),
            phone_number: None,
        }),
    )
    .await
    .unwrap()
    .into_response();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["externalCall"], "ext-1");
    body["call"]["id"].as_str().unwrap().parse().unwrap()
}

fn started_webhook(external_id: &str, listen_url: &str) -> WebhookEvent {
    serde_json::from_value(json!({
        "type": "call-started",
        "call": { "id": external_id, "monitor": { "listenUrl": listen_url } }
    }))
    .unwrap()
}

#[tokio::test]
async fn test_initiate_call_creates_record_and_marks_agent_busy() {
    let fx = fixture(None).await;
    let call_id = dial(&fx).await;

    let call = fx.state.store.get(call_id).await.unwrap();
    assert_eq!(call.status, CallStatus::Initiated);
    assert_eq!(call.external_call_id.as_deref(), Some("ext-1"));
    assert_eq!(call.phone, "+15551234567");
    assert_eq!(call.lead_id, Some(fx.lead.id));

    assert_eq!(
        fx.agents.get(fx.agent.id).await.unwrap().status,
        AgentStatus::Busy
    );
    assert_eq!(fx.leads.attempts(fx.lead.id).await, Some(1));
}

#[tokio::test]
async fn test_initiate_call_requires_campaign() {
    let fx = fixture(None).await;
    let result = initiate_call(
        State(fx.state.clone()),
        AuthAgent(fx.agent.clone()),
        Json(InitiateCallRequest {
            lead_id: Some(fx.lead.id),
            campaign_id: None,
            phone_number: None,
        }),
    )
    .await;
    let response = result.err().unwrap().into_response();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_whisper_queues_until_webhook_resolves_endpoint() {
    let fx = fixture(None).await;
    let call_id = dial(&fx).await;

    // whisper blocks while the endpoint is pending
    let state = fx.state.clone();
    let agent = fx.agent.clone();
    let pending = tokio::spawn(async move {
        whisper(
            State(state),
            AuthAgent(agent),
            Path(call_id),
            Json(MessageRequest {
                message: "offer a discount".to_string(),
                control_url: None,
            }),
        )
        .await
        .map(|r| r.into_response().status())
    });
    tokio::task::yield_now().await;

    apply_event(&fx.state, started_webhook("ext-1", "wss://x/listen/ext-1"))
        .await
        .unwrap();

    let status = pending.await.unwrap().unwrap();
    assert_eq!(status, StatusCode::OK);
    let sent = fx.provider.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "https://x/control/ext-1");
    assert_eq!(sent[0].1, ControlCommand::whisper("offer a discount"));
}

#[tokio::test]
async fn test_whisper_goes_straight_through_once_resolved() {
    let fx = fixture(Some("wss://x/listen/ext-1")).await;
    let call_id = dial(&fx).await;

    let response = whisper(
        State(fx.state.clone()),
        AuthAgent(fx.agent.clone()),
        Path(call_id),
        Json(MessageRequest {
            message: "wrap it up".to_string(),
            control_url: None,
        }),
    )
    .await
    .unwrap()
    .into_response();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(fx.provider.sent().len(), 1);
}

#[tokio::test]
async fn test_end_call_completes_and_repeat_conflicts() {
    let fx = fixture(Some("wss://x/listen/ext-1")).await;
    let call_id = dial(&fx).await;
    apply_event(&fx.state, started_webhook("ext-1", "wss://x/listen/ext-1"))
        .await
        .unwrap();

    let response = end_call(
        State(fx.state.clone()),
        AuthAgent(fx.agent.clone()),
        Path(call_id),
    )
    .await
    .unwrap()
    .into_response();
    assert_eq!(response.status(), StatusCode::OK);

    let call = fx.state.store.get(call_id).await.unwrap();
    assert_eq!(call.status, CallStatus::Completed);
    assert!(call.ended_at.is_some());
    // teardown went through the control channel, not the provider API
    assert!(fx.provider.ended.lock().unwrap().is_empty());
    assert_eq!(fx.provider.sent().last().unwrap().1, ControlCommand::end());
    // the agent is freed for the next dial
    assert_eq!(
        fx.agents.get(fx.agent.id).await.unwrap().status,
        AgentStatus::Available
    );

    let result = end_call(
        State(fx.state.clone()),
        AuthAgent(fx.agent.clone()),
        Path(call_id),
    )
    .await;
    let response = result.err().unwrap().into_response();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_disposition_requires_terminal_call() {
    let fx = fixture(Some("wss://x/listen/ext-1")).await;
    let call_id = dial(&fx).await;

    let result = set_disposition(
        State(fx.state.clone()),
        AuthAgent(fx.agent.clone()),
        Path(call_id),
        Json(DispositionRequest {
            disposition: Some("interested".to_string()),
            notes: None,
        }),
    )
    .await;
    let response = result.err().unwrap().into_response();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    end_call(
        State(fx.state.clone()),
        AuthAgent(fx.agent.clone()),
        Path(call_id),
    )
    .await
    .unwrap();

    let response = set_disposition(
        State(fx.state.clone()),
        AuthAgent(fx.agent.clone()),
        Path(call_id),
        Json(DispositionRequest {
            disposition: Some("interested".to_string()),
            notes: Some("call back friday".to_string()),
        }),
    )
    .await
    .unwrap()
    .into_response();
    assert_eq!(response.status(), StatusCode::OK);
    let call = fx.state.store.get(call_id).await.unwrap();
    assert_eq!(call.disposition.as_deref(), Some("interested"));
    assert_eq!(call.notes.as_deref(), Some("call back friday"));
}

#[tokio::test]
async fn test_active_calls_is_supervisor_only() {
    let fx = fixture(None).await;
    let call_id = dial(&fx).await;

    let result = active_calls(State(fx.state.clone()), AuthAgent(fx.agent.clone())).await;
    let response = result.err().unwrap().into_response();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = active_calls(State(fx.state.clone()), AuthAgent(fx.supervisor.clone()))
        .await
        .unwrap()
        .into_response();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["calls"][0]["id"], call_id.to_string());
}

#[tokio::test]
async fn test_explicit_control_url_bypasses_session() {
    let fx = fixture(None).await;
    let call_id = dial(&fx).await;

    let response = whisper(
        State(fx.state.clone()),
        AuthAgent(fx.agent.clone()),
        Path(call_id),
        Json(MessageRequest {
            message: "hello".to_string(),
            control_url: Some("https://x/control/ext-1".to_string()),
        }),
    )
    .await
    .unwrap()
    .into_response();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(fx.provider.sent()[0].0, "https://x/control/ext-1");
}

#[tokio::test]
async fn test_full_lifecycle_duration_comes_from_webhook_timestamps() {
    let fx = fixture(None).await;
    let call_id = dial(&fx).await;

    apply_event(&fx.state, started_webhook("ext-1", "wss://x/listen/ext-1"))
        .await
        .unwrap();
    let ended: WebhookEvent = serde_json::from_value(json!({
        "type": "call-ended",
        "call": {
            "id": "ext-1",
            "endedReason": "customer-hangup",
            "startedAt": "2024-05-01T12:00:00Z",
            "endedAt": "2024-05-01T12:00:42Z"
        }
    }))
    .unwrap();
    apply_event(&fx.state, ended).await.unwrap();

    let call = fx.state.store.get(call_id).await.unwrap();
    assert_eq!(call.status, CallStatus::Completed);
    assert_eq!(call.duration, Some(42));
    assert_eq!(call.ended_reason.as_deref(), Some("customer-hangup"));
}

#[tokio::test]
async fn test_control_rejects_unknown_action() {
    let fx = fixture(Some("wss://x/listen/ext-1")).await;
    let call_id = dial(&fx).await;

    let result = callbridge::handler::call::control(
        State(fx.state.clone()),
        AuthAgent(fx.agent.clone()),
        Path(call_id),
        Json(AssistantControlRequest {
            control: "self-destruct".to_string(),
            control_url: None,
        }),
    )
    .await;
    let response = result.err().unwrap().into_response();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
