//! arena-server binary.
//!
//! Binds the listener, preallocates the buffer arena and context pool, and
//! answers every request with the fixed acknowledgment until killed.

use arena_server::{Config, ConnectionServer, FixedReply};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        backlog = config.backlog,
        "Starting arena-server"
    );

    let server = ConnectionServer::bind(&config, FixedReply::default())?;
    server.run()?;
    Ok(())
}
