//! huddle-server binary.
//!
//! Configuration comes from the environment (see [`ServerConfig::from_env`]).

use huddle_server::{GroupServer, ServerConfig};

#[tokio::main]
async fn main() {
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("huddle-server: {e}");
            std::process::exit(2);
        }
    };

    let default_filter = if config.verbose_logging { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    log::info!(
        "Starting huddle-server on {} (store: {:?}, presence: {:?})",
        config.bind_addr,
        config.store,
        config.presence
    );

    let server = match GroupServer::connect(config).await {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to open the shared store: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }
}
