use crate::store::{AgentStatus, LeadRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One turn of the rolling call transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptTurn {
    pub role: String,
    pub content: String,
}

/// CallEvent is the closed set of events fanned out to connected clients.
///
/// Webhook payloads and client actions are normalized into this enum at a
/// single ingress point, so subscribers of a call room observe the events
/// for that call in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum CallEvent {
    /// A fresh inbound call nobody owns yet; sent to the agent role room.
    #[serde(rename = "call:inbound")]
    #[serde(rename_all = "camelCase")]
    Inbound {
        call_id: Uuid,
        external_call_id: String,
        phone: String,
        matched_lead: Option<LeadRef>,
    },

    /// The far end answered. Carries the monitor/control URLs once known;
    /// a later repeat with URLs filled in supersedes an earlier one.
    #[serde(rename = "call:connected")]
    #[serde(rename_all = "camelCase")]
    Connected {
        external_call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        listen_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        control_url: Option<String>,
    },

    #[serde(rename = "call:ended")]
    #[serde(rename_all = "camelCase")]
    Ended {
        external_call_id: String,
        duration: i64,
        reason: Option<String>,
    },

    /// Full replacement snapshot of the transcript so far. Incremental
    /// provider payloads are folded into the session before broadcast, so
    /// clients never have to merge.
    #[serde(rename = "call:transcript")]
    #[serde(rename_all = "camelCase")]
    Transcript {
        external_call_id: String,
        transcript: Vec<TranscriptTurn>,
    },

    /// Presentation-only speaking indicator; mutates no state.
    #[serde(rename = "call:speech")]
    #[serde(rename_all = "camelCase")]
    Speech {
        external_call_id: String,
        role: String,
        status: String,
    },

    #[serde(rename = "call:transferred")]
    #[serde(rename_all = "camelCase")]
    Transferred {
        external_call_id: String,
        destination: String,
    },

    #[serde(rename = "agent:statusChanged")]
    #[serde(rename_all = "camelCase")]
    AgentStatusChanged { agent_id: Uuid, status: AgentStatus },

    #[serde(rename = "agents:online")]
    AgentsOnline { count: usize, agents: Vec<Uuid> },
}
