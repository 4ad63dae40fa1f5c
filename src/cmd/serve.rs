//! Conversion server command (`kiln serve`).

use anyhow::Result;

use kiln::config::KilnConfig;
use kiln::server::{ServeOptions, start_server};

pub async fn cmd_serve(
    mut config: KilnConfig,
    port: Option<u16>,
    host: Option<String>,
    offline: bool,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    start_server(&config, ServeOptions { offline, dev_mode: dev }).await
}
