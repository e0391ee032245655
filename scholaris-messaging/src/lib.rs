//! Real-time conversation and messaging core for the Scholaris school
//! platform: approval-gated private chats, admin-created groups, read state,
//! presence and typing, delivered over Socket.IO and a REST surface.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use scholaris_shared::middleware::{metrics_middleware, CredentialVerifier, HasCredentialVerifier};

pub mod admission;
pub mod config;
pub mod directory;
pub mod events;
pub mod gateway;
pub mod mirror;
pub mod models;
pub mod notify;
pub mod presence;
pub mod reconciler;
pub mod routes;
pub mod schema;
pub mod scope;
pub mod services;
pub mod socket;
pub mod store;
pub mod typing;
pub mod uploads;

use config::AppConfig;
use services::ChatService;
use store::ChatStore;
use uploads::{UploadStore, MAX_UPLOAD_BYTES};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub struct AppState {
    pub config: AppConfig,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub chat: ChatService,
    pub store: Arc<dyn ChatStore>,
    /// `None` when uploads are disabled; media routes then answer 503.
    pub uploads: Option<Arc<dyn UploadStore>>,
    /// The Prometheus recorder installs once per process, so tests run without one.
    pub metrics_handle: Option<PrometheusHandle>,
}

impl HasCredentialVerifier for AppState {
    fn credential_verifier(&self) -> &dyn CredentialVerifier {
        &*self.verifier
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        // Conversations
        .route(
            "/conversations",
            get(routes::conversations::list_conversations).post(routes::conversations::create_conversation),
        )
        .route("/conversations/:id", get(routes::conversations::get_conversation))
        .route("/conversations/:id/respond", post(routes::conversations::respond))
        // Messages
        .route(
            "/conversations/:id/messages",
            get(routes::messages::list_messages).post(routes::messages::send_message),
        )
        .route(
            "/conversations/:id/media",
            post(routes::messages::send_media).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 64 * 1024)),
        )
        .route("/conversations/:id/read", post(routes::messages::mark_read))
        .route("/unread-count", get(routes::messages::unread_count))
        // Presence
        .route("/presence/:identity_id", get(routes::presence::get_presence))
        .layer(axum::middleware::from_fn(metrics_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
