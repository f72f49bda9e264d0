use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use komodo_settings::RelaySettings;
use komodo_store::{AuditSink, CaptureStore};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::binder::ConnectionBinder;
use crate::capture::CaptureEngine;
use crate::playback::PlaybackEngine;
use crate::registry::SessionRegistry;
use crate::router::RelayRouter;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::ws::{serve_socket, SocketConfig};
use crate::transport::{ConnectionRegistry, RoomTransport};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<RelayRouter>,
    pub connections: Arc<ConnectionRegistry>,
    pub socket: SocketConfig,
    pub max_message_size: usize,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    /// Wire registry, transport, engines and router from settings.
    pub fn new(settings: &RelaySettings, audit: Arc<dyn AuditSink>, shutdown: CancellationToken) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let connections = Arc::new(ConnectionRegistry::new(settings.server.max_send_queue));
        let transport = Arc::clone(&connections) as Arc<dyn RoomTransport>;
        let store = CaptureStore::new(&settings.capture.path, settings.capture.format);

        let capture = Arc::new(CaptureEngine::new(
            Arc::clone(&registry),
            store.clone(),
            Arc::clone(&audit),
            settings.capture.max_buffered_records,
        ));
        let binder = Arc::new(ConnectionBinder::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            Arc::clone(&capture),
            audit,
            settings.relay.bump_grace(),
        ));
        let playback = Arc::new(PlaybackEngine::new(
            store,
            Arc::clone(&transport),
            settings.relay.replay_id_offset,
            shutdown.clone(),
        ));
        let router = Arc::new(RelayRouter::new(registry, transport, binder, capture, playback));

        Self {
            router,
            connections,
            socket: SocketConfig {
                heartbeat_interval: settings.server.heartbeat_interval(),
                heartbeat_timeout: settings.server.heartbeat_timeout(),
            },
            max_message_size: settings.server.max_message_size,
            shutdown,
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind the listener and start serving. Returns a handle to shut it down.
pub async fn start(settings: RelaySettings, audit: Arc<dyn AuditSink>) -> Result<ServerHandle, std::io::Error> {
    let coordinator = ShutdownCoordinator::new();
    let state = AppState::new(&settings, audit, coordinator.token());
    let capture = Arc::clone(state.router.capture());

    let listener = tokio::net::TcpListener::bind((settings.server.host.as_str(), settings.server.port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, capture_path = %settings.capture.path.display(), "komodo relay started");

    let app = build_router(state.clone());
    let stop = coordinator.token();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move { stop.cancelled().await });
        if let Err(e) = serve.await {
            error!(error = %e, "server stopped with error");
        }
    });
    let flush = capture.spawn_flush_task(settings.capture.flush_interval(), coordinator.token());

    Ok(ServerHandle {
        addr,
        state,
        coordinator,
        capture,
        tasks: vec![server, flush],
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    state: AppState,
    coordinator: ShutdownCoordinator,
    capture: Arc<CaptureEngine>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Close every socket, write out active recordings and wait for tasks.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.coordinator.shutdown();
        self.capture.shutdown().await;
        self.coordinator.graceful_shutdown(self.tasks, None).await;
        info!("shutdown complete");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size).on_upgrade(move |socket| {
        serve_socket(
            socket,
            state.connections,
            state.router,
            state.socket,
            state.shutdown,
        )
    })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "connections": state.connections.count(),
        "sessions": state.router.registry().len(),
    }))
}
