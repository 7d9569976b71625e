use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Call lifecycle status. Transitions are monotonic: once a call reaches a
/// terminal status it never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    InProgress,
    Transferred,
    Completed,
    Failed,
    NoAnswer,
    Busy,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Transferred
                | CallStatus::Completed
                | CallStatus::Failed
                | CallStatus::NoAnswer
                | CallStatus::Busy
        )
    }

    /// Whether `next` is a valid forward transition from this status.
    /// Self-transitions are not forward moves; callers use the `false`
    /// return as an idempotency guard.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        use CallStatus::*;
        match (self, next) {
            (Initiated, Ringing) => true,
            (Initiated, InProgress) | (Ringing, InProgress) => true,
            // Calls can die before being answered.
            (Initiated | Ringing, Completed | Failed | NoAnswer | Busy) => true,
            (InProgress, Transferred | Completed | Failed | NoAnswer | Busy) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub id: Uuid,
    /// Provider call id; set at most once, never changed afterwards.
    pub external_call_id: Option<String>,
    pub direction: Direction,
    pub phone: String,
    pub status: CallStatus,
    pub agent_id: Option<Uuid>,
    pub lead_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub talk_time: Option<i64>,
    pub ended_reason: Option<String>,
    pub disposition: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Call {
    pub fn outbound(phone: &str, agent_id: Uuid, campaign_id: Option<Uuid>) -> Self {
        Self::new(Direction::Outbound, phone, Some(agent_id), campaign_id)
    }

    pub fn inbound(phone: &str) -> Self {
        Self::new(Direction::Inbound, phone, None, None)
    }

    fn new(
        direction: Direction,
        phone: &str,
        agent_id: Option<Uuid>,
        campaign_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_call_id: None,
            direction,
            phone: phone.to_string(),
            status: CallStatus::Initiated,
            agent_id,
            lead_id: None,
            campaign_id,
            started_at: Some(Utc::now()),
            answered_at: None,
            ended_at: None,
            duration: None,
            talk_time: None,
            ended_reason: None,
            disposition: None,
            notes: None,
            created_at: Utc::now(),
        }
    }
}

/// Persisted call records. Status writes go through conditional updates so
/// out-of-order webhook delivery can never move a call backwards.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn insert(&self, call: Call) -> Result<()>;
    async fn get(&self, id: Uuid) -> Option<Call>;
    async fn get_by_external_id(&self, external_id: &str) -> Option<Call>;
    /// Calls not yet in a terminal status, newest first.
    async fn active(&self) -> Vec<Call>;

    /// Conditional forward transition; returns false when the move is not
    /// valid per the state machine (including repeats).
    async fn transition(&self, id: Uuid, next: CallStatus) -> Result<bool>;

    /// Record the answer timestamp together with the move to in-progress.
    async fn mark_connected(&self, id: Uuid, answered_at: DateTime<Utc>) -> Result<bool>;

    /// Terminal write: status, end timestamp and derived durations in one
    /// guarded update. Returns false (and writes nothing) when the call is
    /// already terminal, which makes repeated call-ended webhooks no-ops.
    async fn finish(&self, id: Uuid, outcome: CallOutcome) -> Result<bool>;

    async fn set_external_id(&self, id: Uuid, external_id: &str) -> Result<()>;
    async fn set_disposition(
        &self,
        id: Uuid,
        disposition: Option<String>,
        notes: Option<String>,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub status: CallStatus,
    pub ended_at: DateTime<Utc>,
    pub duration: i64,
    pub talk_time: i64,
    pub reason: Option<String>,
}

#[derive(Default)]
pub struct MemoryCallStore {
    calls: RwLock<HashMap<Uuid, Call>>,
    by_external: RwLock<HashMap<String, Uuid>>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn insert(&self, call: Call) -> Result<()> {
        if let Some(ref external_id) = call.external_call_id {
            self.by_external
                .write()
                .await
                .insert(external_id.clone(), call.id);
        }
        self.calls.write().await.insert(call.id, call);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Option<Call> {
        self.calls.read().await.get(&id).cloned()
    }

    async fn get_by_external_id(&self, external_id: &str) -> Option<Call> {
        let id = *self.by_external.read().await.get(external_id)?;
        self.calls.read().await.get(&id).cloned()
    }

    async fn active(&self) -> Vec<Call> {
        let mut calls: Vec<Call> = self
            .calls
            .read()
            .await
            .values()
            .filter(|c| !c.status.is_terminal())
            .cloned()
            .collect();
        calls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        calls
    }

    async fn transition(&self, id: Uuid, next: CallStatus) -> Result<bool> {
        let mut calls = self.calls.write().await;
        let call = calls.get_mut(&id).ok_or_else(|| anyhow!("call {} not found", id))?;
        if !call.status.can_transition_to(next) {
            return Ok(false);
        }
        call.status = next;
        Ok(true)
    }

    async fn mark_connected(&self, id: Uuid, answered_at: DateTime<Utc>) -> Result<bool> {
        let mut calls = self.calls.write().await;
        let call = calls.get_mut(&id).ok_or_else(|| anyhow!("call {} not found", id))?;
        if !call.status.can_transition_to(CallStatus::InProgress) {
            return Ok(false);
        }
        call.status = CallStatus::InProgress;
        call.answered_at = Some(answered_at);
        Ok(true)
    }

    async fn finish(&self, id: Uuid, outcome: CallOutcome) -> Result<bool> {
        let mut calls = self.calls.write().await;
        let call = calls.get_mut(&id).ok_or_else(|| anyhow!("call {} not found", id))?;
        if !call.status.can_transition_to(outcome.status) {
            return Ok(false);
        }
        call.status = outcome.status;
        call.ended_at = Some(outcome.ended_at);
        call.duration = Some(outcome.duration);
        call.talk_time = Some(outcome.talk_time);
        call.ended_reason = outcome.reason;
        Ok(true)
    }

    async fn set_external_id(&self, id: Uuid, external_id: &str) -> Result<()> {
        let mut calls = self.calls.write().await;
        let call = calls.get_mut(&id).ok_or_else(|| anyhow!("call {} not found", id))?;
        match call.external_call_id {
            Some(ref existing) if existing != external_id => {
                return Err(anyhow!("call {} already bound to provider call {}", id, existing));
            }
            Some(_) => return Ok(()),
            None => {}
        }
        call.external_call_id = Some(external_id.to_string());
        drop(calls);
        self.by_external
            .write()
            .await
            .insert(external_id.to_string(), id);
        Ok(())
    }

    async fn set_disposition(
        &self,
        id: Uuid,
        disposition: Option<String>,
        notes: Option<String>,
    ) -> Result<()> {
        let mut calls = self.calls.write().await;
        let call = calls.get_mut(&id).ok_or_else(|| anyhow!("call {} not found", id))?;
        call.disposition = disposition;
        call.notes = notes;
        Ok(())
    }
}

// ─── External collaborators ─────────────────────────────────────────────────
// Lead and user management live outside this service; we only need a
// phone lookup for inbound matching, an attempt counter touch on dial,
// and token/role resolution for connected agents.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeadRef {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
}

#[async_trait]
pub trait LeadDirectory: Send + Sync {
    async fn get(&self, lead_id: Uuid) -> Option<LeadRef>;
    async fn find_by_phone(&self, phone: &str) -> Option<LeadRef>;
    /// Best effort; callers ignore failures so a lead-store outage can
    /// never block dialing.
    async fn record_attempt(&self, lead_id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryLeadDirectory {
    leads: RwLock<HashMap<Uuid, (LeadRef, u32, Option<DateTime<Utc>>)>>,
}

impl MemoryLeadDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, lead: LeadRef) {
        self.leads.write().await.insert(lead.id, (lead, 0, None));
    }

    pub async fn attempts(&self, lead_id: Uuid) -> Option<u32> {
        self.leads.read().await.get(&lead_id).map(|(_, n, _)| *n)
    }
}

#[async_trait]
impl LeadDirectory for MemoryLeadDirectory {
    async fn get(&self, lead_id: Uuid) -> Option<LeadRef> {
        self.leads
            .read()
            .await
            .get(&lead_id)
            .map(|(lead, _, _)| lead.clone())
    }

    async fn find_by_phone(&self, phone: &str) -> Option<LeadRef> {
        self.leads
            .read()
            .await
            .values()
            .find(|(lead, _, _)| lead.phone == phone)
            .map(|(lead, _, _)| lead.clone())
    }

    async fn record_attempt(&self, lead_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut leads = self.leads.write().await;
        let entry = leads
            .get_mut(&lead_id)
            .ok_or_else(|| anyhow!("lead {} not found", lead_id))?;
        entry.1 += 1;
        entry.2 = Some(at);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agent,
    Supervisor,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Available,
    Busy,
    Break,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
    pub status: AgentStatus,
}

#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<Agent>;
    async fn get(&self, id: Uuid) -> Option<Agent>;
    async fn set_status(&self, id: Uuid, status: AgentStatus) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryAgentDirectory {
    agents: RwLock<HashMap<Uuid, Agent>>,
    tokens: RwLock<HashMap<String, Uuid>>,
}

impl MemoryAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, agent: Agent, token: &str) {
        self.tokens.write().await.insert(token.to_string(), agent.id);
        self.agents.write().await.insert(agent.id, agent);
    }
}

#[async_trait]
impl AgentDirectory for MemoryAgentDirectory {
    async fn authenticate(&self, token: &str) -> Option<Agent> {
        let id = *self.tokens.read().await.get(token)?;
        self.agents.read().await.get(&id).cloned()
    }

    async fn get(&self, id: Uuid) -> Option<Agent> {
        self.agents.read().await.get(&id).cloned()
    }

    async fn set_status(&self, id: Uuid, status: AgentStatus) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(&id)
            .ok_or_else(|| anyhow!("agent {} not found", id))?;
        agent.status = status;
        Ok(())
    }
}
