use crate::event::CallEvent;
use crate::relay::{ConnectionId, EventHub};
use crate::store::{AgentDirectory, AgentStatus, Role};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Tracks which agents hold a live connection and keeps their persisted
/// availability in sync with it.
///
/// Disconnect handling is the only place a status reverts to offline, so
/// every socket exit path must land in `disconnect`, including abrupt
/// drops and server-initiated closes.
pub struct PresenceTracker {
    online: RwLock<HashMap<Uuid, ConnectionId>>,
    agents: Arc<dyn AgentDirectory>,
    hub: Arc<EventHub>,
}

impl PresenceTracker {
    pub fn new(agents: Arc<dyn AgentDirectory>, hub: Arc<EventHub>) -> Self {
        Self {
            online: RwLock::new(HashMap::new()),
            agents,
            hub,
        }
    }

    pub async fn connect(&self, agent_id: Uuid, connection: ConnectionId) -> Result<()> {
        self.online.write().await.insert(agent_id, connection);
        // an agent reconnecting mid-call stays busy
        let current = self.agents.get(agent_id).await.map(|a| a.status);
        if current != Some(AgentStatus::Busy) {
            self.agents
                .set_status(agent_id, AgentStatus::Available)
                .await?;
            self.broadcast_status(agent_id, AgentStatus::Available).await;
        }
        info!(agent = %agent_id, "agent connected");
        self.broadcast_online().await;
        Ok(())
    }

    pub async fn disconnect(&self, agent_id: Uuid, connection: ConnectionId) {
        // the connection's relay state is dead no matter what; release it
        // before any staleness check or its room memberships leak
        self.hub.unregister(connection).await;
        {
            let mut online = self.online.write().await;
            // a stale disconnect racing a fresh connection must not flip
            // the reconnected agent offline
            match online.get(&agent_id) {
                Some(current) if *current == connection => {
                    online.remove(&agent_id);
                }
                _ => return,
            }
        }
        if let Err(e) = self.agents.set_status(agent_id, AgentStatus::Offline).await {
            warn!(agent = %agent_id, "failed to persist offline status: {:#}", e);
        }
        self.broadcast_status(agent_id, AgentStatus::Offline).await;
        info!(agent = %agent_id, "agent disconnected");
        self.broadcast_online().await;
    }

    pub async fn set_status(&self, agent_id: Uuid, status: AgentStatus) -> Result<()> {
        self.agents.set_status(agent_id, status).await?;
        self.broadcast_status(agent_id, status).await;
        Ok(())
    }

    pub async fn is_online(&self, agent_id: Uuid) -> bool {
        self.online.read().await.contains_key(&agent_id)
    }

    async fn broadcast_status(&self, agent_id: Uuid, status: AgentStatus) {
        // status flips are cross-cutting; every role room sees them
        let rooms = [
            EventHub::role_room(Role::Agent),
            EventHub::role_room(Role::Supervisor),
            EventHub::role_room(Role::Admin),
        ];
        self.hub
            .publish_many(&rooms, CallEvent::AgentStatusChanged { agent_id, status })
            .await;
    }

    async fn broadcast_online(&self) {
        let agents: Vec<Uuid> = self.online.read().await.keys().copied().collect();
        let rooms = [
            EventHub::role_room(Role::Supervisor),
            EventHub::role_room(Role::Admin),
        ];
        self.hub
            .publish_many(
                &rooms,
                CallEvent::AgentsOnline {
                    count: agents.len(),
                    agents,
                },
            )
            .await;
    }
}
