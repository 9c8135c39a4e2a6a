//! Command handlers for the CLI application.
//!
//! - `run`: the long-running hook engine
//! - `inspect`: read-only commands (check, devices, effects)

pub mod inspect;
pub mod run;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use openrgb_client::OpenRgbClient;
use rgbhook::config::{ServerConfig, DEFAULT_CLIENT_NAME, DEFAULT_HOST};
use tokio::sync::Notify;
use tracing::{info, warn};

/// Server overrides from the command line
#[derive(Debug, Clone, Default)]
pub struct ServerArgs {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl ServerArgs {
    /// Command-line values over configured ones
    pub fn resolve(&self, configured: Option<&ServerConfig>) -> ServerConfig {
        let base = configured.cloned().unwrap_or_default();
        ServerConfig {
            host: self.host.clone().unwrap_or(base.host),
            port: self.port.unwrap_or(base.port),
            client_name: base.client_name,
        }
    }
}

/// Connect to the OpenRGB SDK server
pub async fn connect_client(server: &ServerConfig) -> Result<OpenRgbClient> {
    let client = OpenRgbClient::connect(&server.host, server.port, &server.client_name)
        .await
        .with_context(|| format!("connecting to OpenRGB at {}:{}", server.host, server.port))?;
    info!("Connected to OpenRGB at {}", client.addr());
    Ok(client)
}

/// Resolves on the first Ctrl-C
pub fn shutdown_signal() -> impl Future<Output = ()> {
    let notify = Arc::new(Notify::new());
    let handler = Arc::clone(&notify);
    if let Err(e) = ctrlc::set_handler(move || handler.notify_one()) {
        warn!("Could not install Ctrl-C handler: {e}");
    }
    async move { notify.notified().await }
}
