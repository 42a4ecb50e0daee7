//! Server assembly
//!
//! Wires the repositories, fast store, hub, bus and chat core into one
//! HTTP/WebSocket server, and coordinates graceful drain: refuse new
//! upgrades, move sessions to DRAINING, finish outstanding fan-out work and
//! stop within the hard deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::{middleware, web, App, HttpServer};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api;
use crate::auth::TokenVerifier;
use crate::bus::{BusHandle, EventSink, FanoutBus};
use crate::config::ServiceConfig;
use crate::faststore::{FastStore, KeyValueStore};
use crate::hub::ConnectionHub;
use crate::presence::PresenceService;
use crate::repository::{self, Repositories};
use crate::service::{ChatService, FanoutPool};
use crate::session;

/// Boot failures, separated so `main` can map them to exit codes.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("dependency unreachable: {0}")]
    Dependency(String),
}

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: ServiceConfig,
    pub hub: Arc<ConnectionHub>,
    pub bus: Arc<dyn BusHandle>,
    pub chat: Arc<ChatService>,
    pub presence: Arc<PresenceService>,
    pub verifier: Arc<TokenVerifier>,
    pub store: Arc<dyn KeyValueStore>,
    pub db: PgPool,
    pub drain: watch::Receiver<bool>,
}

/// Route table shared by the server and the handler tests.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route(
        "/ws/chat/{conversation_id}",
        web::get().to(session::ws_chat_handler),
    )
    .route("/conversations", web::get().to(api::list_conversations))
    .route("/conversations", web::post().to(api::create_conversation))
    .route(
        "/conversations/{id}/messages",
        web::get().to(api::list_messages),
    )
    .route(
        "/conversations/{id}/join",
        web::post().to(api::join_conversation),
    )
    .route(
        "/conversations/{id}/leave",
        web::post().to(api::leave_conversation),
    )
    .route("/messages", web::post().to(api::send_message))
    .route("/messages/read", web::post().to(api::mark_read))
    .route("/health", web::get().to(api::health));
}

pub struct ChatServer {
    state: AppState,
    drain_tx: watch::Sender<bool>,
    fanout: Arc<FanoutPool>,
    bus_task: JoinHandle<()>,
}

impl ChatServer {
    /// Connect both stores, apply the schema and assemble the components.
    pub async fn build(config: ServiceConfig) -> Result<Self, BootError> {
        let pool = repository::connect(&config.database)
            .await
            .map_err(|err| BootError::Dependency(format!("database: {}", err)))?;
        repository::initialize_schema(&pool)
            .await
            .map_err(|err| BootError::Dependency(format!("database schema: {}", err)))?;

        let faststore = FastStore::connect(&config.faststore.endpoint, config.faststore.op_timeout)
            .await
            .map_err(|err| BootError::Dependency(format!("fast store: {}", err)))?;
        faststore
            .ping()
            .await
            .map_err(|err| BootError::Dependency(format!("fast store: {}", err)))?;

        let hub = Arc::new(ConnectionHub::new(config.outbound_queue_depth));
        let (bus, bus_task) = FanoutBus::start(
            faststore.clone(),
            hub.clone(),
            config.faststore.reconnect_backoff,
        );

        let repos = Repositories::postgres(pool.clone(), config.database.op_timeout);
        let store: Arc<dyn KeyValueStore> = Arc::new(faststore.clone());

        let fanout = FanoutPool::start(
            config.fanout_workers,
            config.fanout_queue_depth,
            repos.memberships.clone(),
            store.clone(),
            bus.clone() as Arc<dyn EventSink>,
        );

        let chat = Arc::new(ChatService::new(repos, store.clone(), fanout.clone()));
        let presence = Arc::new(PresenceService::new(
            store.clone(),
            bus.clone() as Arc<dyn EventSink>,
        ));
        let verifier = Arc::new(TokenVerifier::new(&config.auth));

        let (drain_tx, drain_rx) = watch::channel(false);

        let state = AppState {
            config,
            hub,
            bus: bus as Arc<dyn BusHandle>,
            chat,
            presence,
            verifier,
            store,
            db: pool,
            drain: drain_rx,
        };

        Ok(Self {
            state,
            drain_tx,
            fanout,
            bus_task,
        })
    }

    /// Serve until interrupted, then drain.
    pub async fn run(self) -> std::io::Result<()> {
        let ChatServer {
            state,
            drain_tx,
            fanout,
            bus_task,
        } = self;

        let bind_address = format!("{}:{}", state.config.host, state.config.port);
        info!(address = %bind_address, "Starting realtime chat server");

        let app_state = state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(app_state.clone()))
                .wrap(middleware::Logger::default())
                .configure(configure_routes)
        })
        .workers(num_cpus::get())
        .disable_signals()
        .bind(&bind_address)?
        .run();

        let handle = server.handle();
        let coordinator_state = state.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                error!("Failed to install shutdown signal handler");
                return;
            }
            drain(coordinator_state, drain_tx, fanout, bus_task).await;
            handle.stop(true).await;
        });

        server.await
    }
}

/// Drain sequence: broadcast DRAINING, wait for sessions to finish (bounded
/// by the hard deadline), then flush the fan-out workers and stop the bus.
async fn drain(
    state: AppState,
    drain_tx: watch::Sender<bool>,
    fanout: Arc<FanoutPool>,
    bus_task: JoinHandle<()>,
) {
    info!("Drain started: refusing new upgrades");
    let _ = drain_tx.send(true);
    state.hub.close_all();

    let deadline = Instant::now() + state.config.drain_timeout;
    while state.hub.total_connections() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let leftover = state.hub.total_connections();
    if leftover > 0 {
        warn!(connections = leftover, "Drain deadline reached with sessions still open");
    }

    // Outstanding post-commit work either completes or ran inline; nothing
    // is abandoned mid-flight.
    fanout.shutdown().await;
    bus_task.abort();
    info!("Drain complete");
}
