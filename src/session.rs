use crate::event::{CallEvent, TranscriptTurn};
use crate::provider::{derive_control_url, ControlCommand, ProviderError, VoiceProvider};
use crate::relay::EventHub;
use crate::store::CallStatus;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where the session stands on obtaining its control endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointState {
    /// The provider has not published an endpoint yet; a poll is running.
    Pending,
    Resolved(String),
    /// The poll gave up; control operations fail fast from here on.
    Unavailable,
    /// The call reached a terminal status.
    Ended,
}

type PendingCommand = (ControlCommand, oneshot::Sender<Result<(), ProviderError>>);

/// Ephemeral per-call state, keyed by the provider's call id. The control
/// endpoint lives here and only here: it is meaningless once the call
/// ends and must never be persisted.
pub struct CallSession {
    pub internal_id: Uuid,
    pub external_call_id: String,
    pub last_status: CallStatus,
    pub listen_url: Option<String>,
    pub endpoint: EndpointState,
    pub transcript: Vec<TranscriptTurn>,
    pending: Option<PendingCommand>,
    cancel: CancellationToken,
}

pub type SessionRef = Arc<Mutex<CallSession>>;

/// Injectable session registry; production uses the in-process map, tests
/// substitute their own. All mutation of one session goes through that
/// session's own mutex, never a registry-wide lock held across awaits.
pub trait SessionRegistry: Send + Sync {
    fn get(&self, external_call_id: &str) -> Option<SessionRef>;
    fn put(&self, external_call_id: &str, session: SessionRef);
    fn remove(&self, external_call_id: &str) -> Option<SessionRef>;
    fn iter(&self) -> Vec<SessionRef>;
}

#[derive(Default)]
pub struct MemorySessionRegistry {
    sessions: std::sync::RwLock<HashMap<String, SessionRef>>,
}

impl MemorySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRegistry for MemorySessionRegistry {
    fn get(&self, external_call_id: &str) -> Option<SessionRef> {
        self.sessions.read().unwrap().get(external_call_id).cloned()
    }

    fn put(&self, external_call_id: &str, session: SessionRef) {
        self.sessions
            .write()
            .unwrap()
            .insert(external_call_id.to_string(), session);
    }

    fn remove(&self, external_call_id: &str) -> Option<SessionRef> {
        self.sessions.write().unwrap().remove(external_call_id)
    }

    fn iter(&self) -> Vec<SessionRef> {
        self.sessions.read().unwrap().values().cloned().collect()
    }
}

/// Outcome of a control dispatch that did not fail outright.
pub enum Dispatch {
    Sent,
    /// Endpoint still resolving; the command sits in the latest-wins slot
    /// and the receiver fires when it is replayed or discarded. A dropped
    /// receiver end means a newer command displaced this one.
    Queued(oneshot::Receiver<Result<(), ProviderError>>),
}

#[derive(Debug, Clone)]
pub struct SessionTimings {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub terminal_grace: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_poll_attempts: 30,
            terminal_grace: Duration::from_secs(30),
        }
    }
}

/// Tracks in-flight provider calls and resolves their control endpoints.
///
/// The endpoint only exists once the far end answers, so creation starts a
/// bounded background poll that never blocks the initiating request; the
/// resolved endpoint reaches subscribers through the relay.
pub struct SessionTracker {
    registry: Arc<dyn SessionRegistry>,
    provider: Arc<dyn VoiceProvider>,
    hub: Arc<EventHub>,
    token: CancellationToken,
    timings: SessionTimings,
}

impl SessionTracker {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        provider: Arc<dyn VoiceProvider>,
        hub: Arc<EventHub>,
        token: CancellationToken,
        timings: SessionTimings,
    ) -> Self {
        Self {
            registry,
            provider,
            hub,
            token,
            timings,
        }
    }

    pub fn get(&self, external_call_id: &str) -> Option<SessionRef> {
        self.registry.get(external_call_id)
    }

    /// Create a session for a freshly initiated call. When the provider
    /// already handed us a monitor URL the endpoint resolves immediately;
    /// otherwise a cancellable poll starts.
    pub async fn register(
        &self,
        internal_id: Uuid,
        external_call_id: &str,
        listen_url: Option<String>,
    ) -> SessionRef {
        let endpoint = match listen_url.as_deref().map(derive_control_url) {
            Some(Ok(url)) => EndpointState::Resolved(url),
            Some(Err(e)) => {
                warn!(call = %external_call_id, "bad monitor URL: {:#}", e);
                EndpointState::Pending
            }
            None => EndpointState::Pending,
        };
        let needs_poll = endpoint == EndpointState::Pending;
        let session = Arc::new(Mutex::new(CallSession {
            internal_id,
            external_call_id: external_call_id.to_string(),
            last_status: CallStatus::Initiated,
            listen_url,
            endpoint,
            transcript: Vec::new(),
            pending: None,
            cancel: self.token.child_token(),
        }));
        self.registry.put(external_call_id, session.clone());
        if needs_poll {
            self.spawn_resolver(session.clone()).await;
        }
        session
    }

    async fn spawn_resolver(&self, session: SessionRef) {
        let provider = self.provider.clone();
        let hub = self.hub.clone();
        let timings = self.timings.clone();
        let (external_call_id, cancel) = {
            let s = session.lock().await;
            (s.external_call_id.clone(), s.cancel.clone())
        };
        tokio::spawn(async move {
            let mut attempts = 0u32;
            loop {
                select! {
                    _ = cancel.cancelled() => {
                        debug!(call = %external_call_id, "endpoint poll cancelled");
                        return;
                    }
                    _ = tokio::time::sleep(timings.poll_interval) => {}
                }
                attempts += 1;
                match provider.get_call(&external_call_id).await {
                    Ok(snapshot) => {
                        if let Some(control_url) = snapshot.control_endpoint {
                            let mut s = session.lock().await;
                            // teardown or webhook resolution may have won
                            // while get_call was in flight
                            if cancel.is_cancelled() || s.endpoint == EndpointState::Ended {
                                return;
                            }
                            if s.listen_url.is_none() {
                                s.listen_url = snapshot.listen_url;
                            }
                            let replay = apply_resolution(&mut s, control_url.clone());
                            let listen_url = s.listen_url.clone();
                            let room = EventHub::call_room(s.internal_id);
                            drop(s);
                            info!(call = %external_call_id, attempts, "control endpoint resolved");
                            replay_pending(&*provider, &control_url, replay).await;
                            hub.publish(
                                &room,
                                CallEvent::Connected {
                                    external_call_id: external_call_id.clone(),
                                    listen_url,
                                    control_url: Some(control_url),
                                },
                            )
                            .await;
                            return;
                        }
                        if snapshot.is_terminal() {
                            // ended before answering; no endpoint will ever exist
                            let mut s = session.lock().await;
                            s.endpoint = EndpointState::Ended;
                            fail_pending(&mut s, ProviderError::NoControlEndpoint);
                            info!(call = %external_call_id, "call ended before endpoint resolution");
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(call = %external_call_id, attempts, "endpoint poll failed: {}", e);
                    }
                }
                if attempts >= timings.max_poll_attempts {
                    let mut s = session.lock().await;
                    if s.endpoint == EndpointState::Pending {
                        s.endpoint = EndpointState::Unavailable;
                    }
                    fail_pending(&mut s, ProviderError::NoControlEndpoint);
                    warn!(call = %external_call_id, attempts, "endpoint resolution exhausted");
                    return;
                }
            }
        });
    }

    /// Webhook corroboration: a call-started event carries the monitor
    /// URL, which beats the poll to the endpoint most of the time.
    /// Returns the control URL now bound to the session.
    pub async fn resolve_from_listen_url(
        &self,
        external_call_id: &str,
        listen_url: &str,
    ) -> Option<String> {
        let session = self.registry.get(external_call_id)?;
        let control_url = match derive_control_url(listen_url) {
            Ok(url) => url,
            Err(e) => {
                warn!(call = %external_call_id, "bad monitor URL in webhook: {:#}", e);
                return None;
            }
        };
        let mut s = session.lock().await;
        s.listen_url = Some(listen_url.to_string());
        if let EndpointState::Resolved(ref existing) = s.endpoint {
            return Some(existing.clone());
        }
        let replay = apply_resolution(&mut s, control_url.clone());
        s.cancel.cancel(); // the poll has nothing left to do
        drop(s);
        replay_pending(&*self.provider, &control_url, replay).await;
        Some(control_url)
    }

    /// Route a control command to the session. Commands issued before the
    /// endpoint resolves take the single latest-wins slot; a session whose
    /// resolution failed or whose call ended fails fast with a typed error.
    pub async fn dispatch(
        &self,
        external_call_id: &str,
        command: ControlCommand,
    ) -> Result<Dispatch, ProviderError> {
        let session = self
            .registry
            .get(external_call_id)
            .ok_or(ProviderError::ControlEndpointGone)?;
        let mut s = session.lock().await;
        match s.endpoint.clone() {
            EndpointState::Resolved(control_url) => {
                // holding the session lock serializes commands per call
                let result = self.provider.send_control(&control_url, &command).await;
                if matches!(result, Err(ProviderError::ControlEndpointGone)) {
                    s.endpoint = EndpointState::Ended;
                }
                result.map(|_| Dispatch::Sent)
            }
            EndpointState::Pending => {
                let (tx, rx) = oneshot::channel();
                if let Some((displaced, _)) = s.pending.replace((command, tx)) {
                    debug!(call = %external_call_id, ?displaced, "control command displaced");
                }
                Ok(Dispatch::Queued(rx))
            }
            EndpointState::Unavailable => Err(ProviderError::NoControlEndpoint),
            EndpointState::Ended => Err(ProviderError::ControlEndpointGone),
        }
    }

    /// Fold a transcript update into the session's rolling transcript and
    /// broadcast the full snapshot. The publish happens while the session
    /// lock is held, so snapshots for one call reach the relay in fold
    /// order and an older snapshot can never overtake a newer one.
    /// Returns false for an unknown or already-ended session.
    pub async fn publish_transcript(
        &self,
        external_call_id: &str,
        update: TranscriptUpdate,
    ) -> bool {
        let Some(session) = self.registry.get(external_call_id) else {
            return false;
        };
        let mut s = session.lock().await;
        if s.endpoint == EndpointState::Ended {
            return false;
        }
        match update {
            TranscriptUpdate::Snapshot(turns) => s.transcript = turns,
            TranscriptUpdate::Append(turn) => s.transcript.push(turn),
        }
        let room = EventHub::call_room(s.internal_id);
        let event = CallEvent::Transcript {
            external_call_id: s.external_call_id.clone(),
            transcript: s.transcript.clone(),
        };
        self.hub.publish(&room, event).await;
        true
    }

    pub async fn set_last_status(&self, external_call_id: &str, status: CallStatus) {
        if let Some(session) = self.registry.get(external_call_id) {
            session.lock().await.last_status = status;
        }
    }

    /// Terminal teardown: stop the resolver, fail anything still queued,
    /// and drop the session after a grace period so late webhooks can
    /// still resolve the external id.
    pub async fn release(&self, external_call_id: &str) {
        let Some(session) = self.registry.get(external_call_id) else {
            return;
        };
        {
            let mut s = session.lock().await;
            s.endpoint = EndpointState::Ended;
            s.cancel.cancel();
            fail_pending(&mut s, ProviderError::ControlEndpointGone);
        }
        let registry = self.registry.clone();
        let token = self.token.clone();
        let grace = self.timings.terminal_grace;
        let key = external_call_id.to_string();
        tokio::spawn(async move {
            select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {}
            }
            registry.remove(&key);
            debug!(call = %key, "session dropped");
        });
    }
}

pub enum TranscriptUpdate {
    Snapshot(Vec<TranscriptTurn>),
    Append(TranscriptTurn),
}

fn apply_resolution(session: &mut CallSession, control_url: String) -> Option<PendingCommand> {
    session.endpoint = EndpointState::Resolved(control_url);
    session.pending.take()
}

async fn replay_pending(
    provider: &dyn VoiceProvider,
    control_url: &str,
    pending: Option<PendingCommand>,
) {
    if let Some((command, tx)) = pending {
        let result = provider.send_control(control_url, &command).await;
        if let Err(ref e) = result {
            warn!(url = %control_url, "queued control command failed on replay: {}", e);
        }
        let _ = tx.send(result);
    }
}

fn fail_pending(session: &mut CallSession, error: ProviderError) {
    if let Some((command, tx)) = session.pending.take() {
        warn!(call = %session.external_call_id, ?command, "discarding queued control command: {}", error);
        let _ = tx.send(Err(error));
    }
}
