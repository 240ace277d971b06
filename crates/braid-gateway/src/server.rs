use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, patch, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use braid_agent::ChatRuntime;
use braid_core::config::GatewayConfig;

use crate::routes;
use crate::state::AppState;

/// The HTTP API over a shared runtime.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/chat", post(routes::chat))
        .route(
            "/api/sessions",
            get(routes::list_sessions).post(routes::create_session),
        )
        .route(
            "/api/sessions/{id}",
            patch(routes::rename_session).delete(routes::delete_session),
        )
        .route("/api/sessions/{id}/history", get(routes::session_history))
        .route("/api/sessions/{id}/messages", post(routes::send_message))
        .route("/api/sessions/{id}/cancel", post(routes::cancel_run))
        .route("/api/titles", post(routes::generate_title))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP + SSE gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    runtime: Arc<ChatRuntime>,
    idle_ttl: Option<Duration>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, runtime: Arc<ChatRuntime>) -> Self {
        Self {
            config,
            runtime,
            idle_ttl: None,
        }
    }

    /// Evict sessions idle for longer than `ttl` from memory while serving.
    pub fn with_idle_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.idle_ttl = ttl;
        self
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            runtime: self.runtime.clone(),
        });
        let app = router(state);

        if let Some(ttl) = self.idle_ttl {
            tokio::spawn(sweep_idle(self.runtime.clone(), ttl, shutdown.clone()));
        }

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

async fn sweep_idle(runtime: Arc<ChatRuntime>, ttl: Duration, shutdown: CancellationToken) {
    let period = (ttl / 2).max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let evicted = runtime.evict_idle(ttl);
                if evicted > 0 {
                    debug!(evicted, "Evicted idle sessions");
                }
            }
        }
    }
}
