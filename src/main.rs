//! murmur: a multi-client microblogging server
//!
//! Clients connect over TCP, log in with a name, then publish messages,
//! follow each other and read their timelines.
//!
//! Architecture:
//! - One session thread per connection reads and parses client lines
//! - A bounded command queue applies backpressure between sessions and workers
//! - A pool of execution threads runs commands and answers clients directly
//! - A reader-preferring client directory maps client keys to connections

mod config;
mod connection;
mod directory;
mod executor;
mod handlers;
mod protocol;
mod queue;
mod server;
mod session;
mod sync;

use clap::CommandFactory;
use config::{CliArgs, Config, ConfigError};
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::HelpRequested) => {
            CliArgs::command().print_help()?;
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        max_clients = config.max_clients,
        queue_capacity = config.queue_capacity,
        workers = config.workers,
        random_delay = config.random_delay,
        "Starting murmur server"
    );

    let server = Server::bind(config)?;
    server.run()?;
    Ok(())
}
