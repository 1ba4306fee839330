pub mod appresult;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod rooms;
pub mod store;

use std::sync::Arc;

use axum::{extract::FromRef, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tower_sessions::{cookie::SameSite, Expiry, SessionManagerLayer};

pub use appresult::{AppError, AppResult};
pub use broadcast::BroadcastEngine;
pub use config::Config;
pub use error::{ChatError, ChatResult};

use broadcast::{HttpRelay, LocalRelay, Relay};
use rooms::RoomRegistry;
use store::{SqliteStore, Store};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub engine: Arc<BroadcastEngine>,
    pub relay: Arc<dyn Relay>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wires store, registry, relay and engine together and starts the
    /// relay listener.
    pub fn new(config: Config, store: Arc<dyn Store>, relay: Arc<dyn Relay>) -> Self {
        let engine = Arc::new(BroadcastEngine::new(store, Arc::new(RoomRegistry::new()), relay.clone()));
        engine.spawn_relay_listener();

        Self {
            engine,
            relay,
            config: Arc::new(config),
        }
    }

    /// Opens the SQLite store and picks the relay from `config`.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let store = SqliteStore::connect(&config.database_url).await?;

        let relay: Arc<dyn Relay> = if config.relay_peers.is_empty() {
            Arc::new(LocalRelay::default())
        } else {
            tracing::info!(peers = ?config.relay_peers, "relaying to peer instances");
            Arc::new(HttpRelay::new(config.relay_peers.clone(), config.relay_token.clone())?)
        };

        Ok(Self::new(config, Arc::new(store), relay))
    }
}

pub fn app(state: AppState) -> Router {
    let session_layer = SessionManagerLayer::new(tower_sessions::MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(state.config.session_idle_minutes)));

    let mut router = Router::new().merge(auth::router()).merge(rooms::router());
    if state.config.relay_enabled() {
        router = router.merge(rooms::relay_router());
    }

    router
        .with_state(state)
        .layer(session_layer)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
