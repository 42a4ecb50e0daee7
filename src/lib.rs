//! Real-time Chat Engine
//!
//! Core engine of a multi-tenant conversational platform: WebSocket
//! sessions scoped to a conversation, membership-gated message delivery,
//! cross-instance fan-out over the fast store's pub/sub, and dual-path
//! unread tracking.

pub mod api;
pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod faststore;
pub mod hub;
pub mod models;
pub mod presence;
pub mod repository;
pub mod server;
pub mod service;
pub mod session;
pub mod testsupport;

pub use auth::{AuthenticatedUser, TokenVerifier};
pub use bus::{BusHandle, EventSink, FanoutBus};
pub use config::ServiceConfig;
pub use error::ChatError;
pub use events::{ClientFrame, Event};
pub use faststore::{FastStore, KeyValueStore};
pub use hub::ConnectionHub;
pub use presence::PresenceService;
pub use repository::Repositories;
pub use server::{AppState, BootError, ChatServer};
pub use service::{ChatService, CreateGroupRequest, FanoutPool, SendMessageRequest};
