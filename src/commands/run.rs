// Run command: connect, attach hooks, serve until Ctrl-C

use std::sync::Arc;

use anyhow::Result;
use rgbhook::{Config, Engine};
use tracing::info;

use super::{connect_client, shutdown_signal, ServerArgs};

pub async fn run(config: Config, server: ServerArgs) -> Result<()> {
    let connector = bus_connector()?;
    let server = server.resolve(Some(&config.server));
    let client = connect_client(&server).await?;

    let engine = Engine::from_config(&config, Arc::new(client), &connector).await?;
    info!(
        "{} hooks loaded, animating at {} Hz. Ctrl+C to stop.",
        engine.hooks().len(),
        config.animation.frequency
    );
    engine.run(shutdown_signal()).await?;
    Ok(())
}

#[cfg(feature = "dbus")]
fn bus_connector() -> Result<rgbhook_bus::DBusConnector> {
    Ok(rgbhook_bus::DBusConnector)
}

#[cfg(not(feature = "dbus"))]
fn bus_connector() -> Result<rgbhook_bus::MemoryConnector> {
    anyhow::bail!("rgbhook was built without D-Bus support")
}
