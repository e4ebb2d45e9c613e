//! `ember-server` process entry point.

mod app;
mod child;
mod cron;
mod hooks;
mod net;
mod resp;
mod workers;

use std::net::SocketAddr;

use ember_common::config::RuntimeConfig;
use ember_common::error::EmberResult;
use tracing_subscriber::EnvFilter;

use crate::app::ServerApp;
use crate::net::ServerReactor;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RuntimeConfig::default();
    if let Err(error) = run(config) {
        eprintln!("failed to start ember-server: {error}");
        std::process::exit(1);
    }
}

fn run(config: RuntimeConfig) -> EmberResult<()> {
    let port = config.port;
    let mut app = ServerApp::new(config)?;
    let mut reactor = ServerReactor::bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
    tracing::info!(
        port,
        databases = app.config.databases.get(),
        hz = app.config.config_hz,
        durable_log = app.config.durable_log_enabled,
        "ember-server listening"
    );
    reactor.run(&mut app)
}
