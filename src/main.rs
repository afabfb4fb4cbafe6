//! frame-reactor: framed echo server on an epoll reactor
//!
//! Accepts TCP connections, registers them with one shared reactor and
//! echoes every length-framed message back to its sender.
//!
//! Features:
//! - Level-triggered epoll readiness over many connections
//! - Per-message read/write deadlines
//! - Configuration via CLI arguments or TOML file

use frame_reactor::config::Config;
use frame_reactor::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = config.workers,
        batch_size = config.batch_size,
        read_timeout_ms = config.read_timeout_ms,
        write_timeout_ms = config.write_timeout_ms,
        max_message_size = config.max_message_size,
        "Starting frame-reactor"
    );

    let server = Server::bind(config)?;
    server.run()?;
    Ok(())
}
