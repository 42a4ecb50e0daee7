//! Realtime Chat Service
//!
//! Main entry point for the chat engine service.

use std::env;

use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realtime_chat::{BootError, ChatServer, ServiceConfig};

const EXIT_CONFIG: i32 = 1;
const EXIT_DEPENDENCY: i32 = 2;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting realtime chat engine");

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Fatal configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let server = match ChatServer::build(config).await {
        Ok(server) => server,
        Err(BootError::Config(detail)) => {
            error!(error = %detail, "Fatal configuration error");
            std::process::exit(EXIT_CONFIG);
        }
        Err(BootError::Dependency(detail)) => {
            error!(error = %detail, "Dependency unreachable at boot");
            std::process::exit(EXIT_DEPENDENCY);
        }
    };

    server.run().await
}
