use std::sync::Arc;

use serde_json::Value;
use socketioxide::extract::{SocketRef, TryData};
use socketioxide::SocketIo;

use scholaris_shared::clients::db::create_pool;
use scholaris_shared::clients::minio::MinioClient;
use scholaris_shared::clients::rabbitmq::RabbitMQClient;
use scholaris_shared::middleware::{init_metrics, init_tracing, JwtVerifier};

use scholaris_messaging::admission::AdmissionControl;
use scholaris_messaging::config::{AppConfig, StoreBackend};
use scholaris_messaging::directory::{DirectoryLookup, InMemoryDirectory, PgDirectory};
use scholaris_messaging::events::publisher::{EventPublisher, LogOnlyPublisher, RabbitEventPublisher};
use scholaris_messaging::gateway::Gateway;
use scholaris_messaging::notify::{NotificationEmitter, NotificationSink};
use scholaris_messaging::presence::PresenceTracker;
use scholaris_messaging::services::ChatService;
use scholaris_messaging::store::{ChatStore, InMemoryChatStore, PgChatStore};
use scholaris_messaging::typing::TypingCoordinator;
use scholaris_messaging::uploads::{MinioUploadStore, UploadStore};
use scholaris_messaging::{build_router, socket, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("scholaris-messaging");
    let metrics_handle = init_metrics("scholaris-messaging")?;

    let config = AppConfig::load()?;
    let port = config.port;

    let store: Arc<dyn ChatStore>;
    let directory: Arc<dyn DirectoryLookup>;
    match config.store {
        StoreBackend::Postgres => {
            let db = create_pool(&config.database_url, config.db_pool_size)?;
            store = Arc::new(PgChatStore::new(db.clone()));
            directory = Arc::new(PgDirectory::new(db));
        }
        StoreBackend::Memory => {
            tracing::warn!(identities = config.directory.len(), "using in-memory store, data is lost on restart");
            store = Arc::new(InMemoryChatStore::new());
            directory = Arc::new(InMemoryDirectory::with_entries(config.directory.iter().copied()));
        }
    }

    let events: Arc<dyn EventPublisher>;
    let notifications: Arc<dyn NotificationSink>;
    if config.publish_events {
        let rabbitmq = RabbitMQClient::connect(&config.rabbitmq_url, config.publish_timeout()).await?;
        let publisher = Arc::new(RabbitEventPublisher::new(rabbitmq));
        events = publisher.clone();
        notifications = publisher;
    } else {
        events = Arc::new(LogOnlyPublisher);
        notifications = Arc::new(LogOnlyPublisher);
    }

    let uploads: Option<Arc<dyn UploadStore>> = if config.uploads_enabled {
        let minio = MinioClient::new(
            &config.minio_endpoint,
            &config.minio_access_key,
            &config.minio_secret_key,
            &config.minio_bucket,
            &config.minio_public_url,
        )
        .await;
        let minio: Arc<dyn UploadStore> = Arc::new(MinioUploadStore::new(minio));
        Some(minio)
    } else {
        None
    };

    let gateway = Arc::new(Gateway::new(
        Arc::new(PresenceTracker::new()),
        config.session_queue_capacity,
    ));
    let chat = ChatService::new(
        store.clone(),
        AdmissionControl::new(config.admission.clone(), directory),
        gateway,
        TypingCoordinator::new(config.typing_timeout()),
        NotificationEmitter::new(notifications),
        events,
    );

    let (sio_layer, io) = SocketIo::builder()
        .ping_interval(config.heartbeat_interval())
        .ping_timeout(config.heartbeat_timeout())
        .build_layer();

    let heartbeat_timeout = config.heartbeat_timeout();
    let heartbeat_interval = config.heartbeat_interval();
    let verifier = Arc::new(JwtVerifier::new(config.jwt_secret.clone()));
    let state = Arc::new(AppState {
        config,
        verifier,
        chat,
        store,
        uploads,
        metrics_handle: Some(metrics_handle),
    });

    io.ns("/", {
        let state = state.clone();
        move |socket: SocketRef, TryData::<Value>(auth)| {
            let state = state.clone();
            async move {
                socket::handlers::on_connect_with_state(socket, auth.ok(), state).await;
            }
        }
    });

    // Sessions that stop sending heartbeats are dropped and go offline.
    let reaper_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            let reaped = reaper_state.chat.reap_stale_sessions(heartbeat_timeout);
            if reaped > 0 {
                tracing::info!(reaped, "stale sessions reaped");
            }
        }
    });

    let app = build_router(state).layer(sio_layer);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "scholaris-messaging starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
