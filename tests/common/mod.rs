//! Shared harness for the integration suite: a chat core wired entirely
//! from in-memory doubles.

// Each test binary uses a different slice of this module.
#![allow(dead_code, unused_imports)]

use std::sync::Arc;

use realtime_chat::auth::TokenVerifier;
use realtime_chat::bus::{BusHandle, EventSink};
use realtime_chat::config::{AuthConfig, AuthMode};
use realtime_chat::hub::ConnectionHub;
use realtime_chat::server::AppState;
use realtime_chat::faststore::KeyValueStore;
use realtime_chat::service::FanoutPool;
use realtime_chat::testsupport::{MemoryRepos, MemoryStore, RecordingSink};
use realtime_chat::{ChatService, PresenceService, ServiceConfig};
use tokio::sync::watch;

pub struct Harness {
    pub service: Arc<ChatService>,
    pub fanout: Arc<FanoutPool>,
    pub repos: Arc<MemoryRepos>,
    pub store: Arc<MemoryStore>,
    pub sink: Arc<RecordingSink>,
}

pub fn harness() -> Harness {
    let (repos, repo_handle) = MemoryRepos::bundle();
    let store = Arc::new(MemoryStore::default());
    let sink = Arc::new(RecordingSink::default());

    let fanout = FanoutPool::start(
        2,
        64,
        repos.memberships.clone(),
        store.clone() as Arc<dyn KeyValueStore>,
        sink.clone() as Arc<dyn EventSink>,
    );
    let service = Arc::new(ChatService::new(
        repos,
        store.clone() as Arc<dyn KeyValueStore>,
        fanout.clone(),
    ));

    Harness {
        service,
        fanout,
        repos: repo_handle,
        store,
        sink,
    }
}


/// Full application state wired from in-memory doubles. The lazy pool never
/// connects unless a handler actually queries the database.
#[allow(dead_code)]
pub fn app_state(mode: AuthMode) -> (AppState, Harness) {
    let h = harness();
    let config = ServiceConfig {
        auth: AuthConfig {
            mode,
            secret: "integration-secret".into(),
            issuer: "chat-platform".into(),
            audience: "realtime-chat".into(),
            cookie_name: "chat_token".into(),
        },
        ..ServiceConfig::default()
    };

    let presence = Arc::new(PresenceService::new(
        h.store.clone() as Arc<dyn KeyValueStore>,
        h.sink.clone() as Arc<dyn EventSink>,
    ));
    let (drain_tx, drain_rx) = watch::channel(false);
    std::mem::forget(drain_tx);

    let state = AppState {
        config: config.clone(),
        hub: Arc::new(ConnectionHub::new(config.outbound_queue_depth)),
        bus: h.sink.clone() as Arc<dyn BusHandle>,
        chat: h.service.clone(),
        presence,
        verifier: Arc::new(TokenVerifier::new(&config.auth)),
        store: h.store.clone() as Arc<dyn KeyValueStore>,
        db: sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://postgres@127.0.0.1:1/unused")
            .expect("lazy pool"),
        drain: drain_rx,
    };
    (state, h)
}
