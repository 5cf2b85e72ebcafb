use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use portcullis_server::auth::{KeyManager, LogEmailSender};
use portcullis_server::bootstrap::Bootstrap;
use portcullis_server::db::{Database, MigrationRunner, SqlStore};
use portcullis_server::{server, telemetry, AuthState, ServerConfig};

#[derive(Parser)]
#[command(name = "portcullis-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Create a new signing key and revoke the previous ones
    RotateKeys,
    /// Print the published JWKS
    Jwks,
}

async fn open_store(config: &ServerConfig) -> Result<Arc<SqlStore>> {
    let db = match &config.db_path {
        Some(path) => Database::open_local("portcullis", path).await,
        None => Database::in_memory("portcullis").await,
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize database: {}", e))?;

    MigrationRunner::standard()
        .run(&db)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
    info!("Database initialized and migrations complete");

    Ok(Arc::new(SqlStore::new(db)))
}

fn key_manager(config: &ServerConfig, store: Arc<SqlStore>) -> KeyManager {
    KeyManager::new(store, config.key_retention, config.jwks_cache_horizon)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ServerConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load server configuration: {}", e))?;
    telemetry::init(config.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("Portcullis starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let store = open_store(&config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            config.log_config();
            if let Some(path) = &config.bootstrap_path {
                Bootstrap::load(path).await?.apply(store.as_ref()).await?;
            }

            let state = AuthState::new(config, store, Arc::new(LogEmailSender))?;
            state.initialize().await?;
            server::start(Arc::new(state)).await?;
        }
        Command::RotateKeys => {
            let cert = key_manager(&config, store).rotate().await?;
            println!("{}", cert.kid);
        }
        Command::Jwks => {
            let keys = key_manager(&config, store);
            keys.ensure_active().await?;
            println!("{}", serde_json::to_string_pretty(&keys.jwks().await?)?);
        }
    }

    telemetry::shutdown();
    Ok(())
}
