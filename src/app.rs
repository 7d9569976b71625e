use crate::config::Config;
use crate::presence::PresenceTracker;
use crate::provider::{ProviderClient, VoiceProvider};
use crate::relay::EventHub;
use crate::session::{MemorySessionRegistry, SessionRegistry, SessionTracker};
use crate::store::{
    AgentDirectory, CallStore, LeadDirectory, MemoryAgentDirectory, MemoryCallStore,
    MemoryLeadDirectory,
};
use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub token: CancellationToken,
    pub store: Arc<dyn CallStore>,
    pub leads: Arc<dyn LeadDirectory>,
    pub agents: Arc<dyn AgentDirectory>,
    pub provider: Arc<dyn VoiceProvider>,
    pub hub: Arc<EventHub>,
    pub sessions: Arc<SessionTracker>,
    pub presence: Arc<PresenceTracker>,
}

pub type AppState = Arc<AppStateInner>;

pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub store: Option<Arc<dyn CallStore>>,
    pub leads: Option<Arc<dyn LeadDirectory>>,
    pub agents: Option<Arc<dyn AgentDirectory>>,
    pub provider: Option<Arc<dyn VoiceProvider>>,
    pub registry: Option<Arc<dyn SessionRegistry>>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            store: None,
            leads: None,
            agents: None,
            provider: None,
            registry: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn CallStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn leads(mut self, leads: Arc<dyn LeadDirectory>) -> Self {
        self.leads = Some(leads);
        self
    }

    pub fn agents(mut self, agents: Arc<dyn AgentDirectory>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn VoiceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = CancellationToken::new();

        if config.webhook.secret.is_none() {
            warn!("webhook secret not configured, ingress is unauthenticated");
        }

        let provider = match self.provider {
            Some(p) => p,
            None => Arc::new(ProviderClient::new(&config.provider)?),
        };
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryCallStore::new()));
        let leads = self
            .leads
            .unwrap_or_else(|| Arc::new(MemoryLeadDirectory::new()));
        let agents = self
            .agents
            .unwrap_or_else(|| Arc::new(MemoryAgentDirectory::new()));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(MemorySessionRegistry::new()));

        let hub = Arc::new(EventHub::new());
        let sessions = Arc::new(SessionTracker::new(
            registry,
            provider.clone(),
            hub.clone(),
            token.child_token(),
            config.session.timings(),
        ));
        let presence = Arc::new(PresenceTracker::new(agents.clone(), hub.clone()));

        Ok(Arc::new(AppStateInner {
            config,
            token,
            store,
            leads,
            agents,
            provider,
            hub,
            sessions,
            presence,
        }))
    }
}

pub async fn run(state: AppState) -> Result<()> {
    let token = state.token.clone();
    let app = create_router(state.clone());
    let addr: SocketAddr = state.config.http_addr.parse()?;
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            return Err(anyhow::anyhow!("Failed to bind to {}: {}", addr, e));
        }
    };

    let http_task = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    select! {
        http_result = http_task => {
            match http_result {
                Ok(_) => info!("Server shut down gracefully"),
                Err(e) => {
                    tracing::error!("Server error: {}", e);
                    return Err(anyhow::anyhow!("Server error: {}", e));
                }
            }
        }
        _ = token.cancelled() => {
            info!("Application shutting down due to cancellation");
        }
    }
    token.cancel();
    Ok(())
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::header::ACCEPT,
            axum::http::header::ORIGIN,
        ]);

    crate::handler::router().with_state(state).layer(cors)
}
