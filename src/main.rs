//! kvstore server entry point.
//!
//! Parses the configuration, sets up logging and runs the server until
//! Ctrl+C.

use anyhow::Context;
use clap::Parser;
use kvstore::{Config, Server};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_banner(config: &Config) {
    println!(
        r#"
kvstore v{} - In-Memory Key-Value Server
──────────────────────────────────────────
Listening on {} ({} workers, persistence: {})

Use Ctrl+C to shutdown gracefully.
"#,
        kvstore::VERSION,
        config.bind_address(),
        config.worker_count(),
        config.persistence,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_new(&config.log_level)
        .with_context(|| format!("invalid log level '{}'", config.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    config.validate()?;

    let server = Server::bind(config.server_config())
        .await
        .context("failed to start server")?;

    print_banner(&config);

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    server.run_until(shutdown).await?;

    info!("Goodbye");
    Ok(())
}
