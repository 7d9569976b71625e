use super::auth::AuthAgent;
use crate::app::AppState;
use crate::relay::{ConnectionId, EventHub, EventReceiver};
use crate::store::{Agent, AgentStatus};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::select;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client-to-server commands over the event socket. Everything else a
/// client wants to do goes through the REST surface.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WsCommand {
    #[serde(rename = "agent:setStatus")]
    SetStatus { status: AgentStatus },
    #[serde(rename = "call:listen")]
    #[serde(rename_all = "camelCase")]
    Listen { call_id: Uuid },
    #[serde(rename = "call:stopListen")]
    #[serde(rename_all = "camelCase")]
    StopListen { call_id: Uuid },
}

pub async fn ws_handler(
    State(state): State<AppState>,
    AuthAgent(agent): AuthAgent,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_session(state, agent, socket))
}

/// One connected client. The connection owns its event queue; dropping
/// off this function for any reason funnels through `presence.disconnect`,
/// which clears every room membership the connection held.
async fn handle_session(state: AppState, agent: Agent, socket: WebSocket) {
    let connection: ConnectionId = Uuid::new_v4();
    let events = state.hub.register(connection).await;
    state
        .hub
        .subscribe(connection, &EventHub::role_room(agent.role))
        .await;
    if let Err(e) = state.presence.connect(agent.id, connection).await {
        warn!(agent = %agent.id, "presence connect failed: {:#}", e);
    }

    let (mut sink, mut stream) = socket.split();
    let hello = json!({
        "type": "connected",
        "agentId": agent.id,
        "role": agent.role,
    });
    if sink.send(Message::Text(hello.to_string().into())).await.is_err() {
        state.presence.disconnect(agent.id, connection).await;
        return;
    }

    info!(agent = %agent.id, connection = %connection, "websocket session started");

    let pump = pump_events(events, sink);
    let commands = read_commands(state.clone(), agent.id, connection, &mut stream);
    select! {
        _ = pump => {}
        _ = commands => {}
    }

    state.presence.disconnect(agent.id, connection).await;
    info!(agent = %agent.id, connection = %connection, "websocket session ended");
}

/// Forward relay events to the socket until either side goes away.
async fn pump_events(
    mut events: EventReceiver,
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
) {
    while let Some(event) = events.recv().await {
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to serialize event: {}", e);
                continue;
            }
        };
        if sink.send(Message::Text(payload.into())).await.is_err() {
            return;
        }
    }
}

async fn read_commands(
    state: AppState,
    agent_id: Uuid,
    connection: ConnectionId,
    stream: &mut futures::stream::SplitStream<WebSocket>,
) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return,
            Ok(_) => continue,
        };
        let command: WsCommand = match serde_json::from_str(&text) {
            Ok(command) => command,
            Err(e) => {
                debug!(connection = %connection, "ignoring malformed command: {}", e);
                continue;
            }
        };
        match command {
            WsCommand::SetStatus { status } => {
                if let Err(e) = state.presence.set_status(agent_id, status).await {
                    warn!(agent = %agent_id, "status change failed: {:#}", e);
                }
            }
            WsCommand::Listen { call_id } => {
                state
                    .hub
                    .subscribe(connection, &EventHub::call_room(call_id))
                    .await;
                debug!(connection = %connection, call = %call_id, "joined call room");
            }
            WsCommand::StopListen { call_id } => {
                state
                    .hub
                    .unsubscribe(connection, &EventHub::call_room(call_id))
                    .await;
            }
        }
    }
}
