//! WolfMQ broker daemon
//!
//! Runs the cluster coordination engine and the read-only status API for
//! one broker instance.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfmq::api::HttpServer;
use wolfmq::config::WolfMqConfig;
use wolfmq::engine::ClusterEngine;
use wolfmq::store::{NoopRecovery, SqliteStoreLock, StoreLockMediator, StoreRecovery};
use wolfmq::{Error, Result};

/// WolfMQ - Broker Cluster Coordination Engine
#[derive(Parser)]
#[command(name = "wolfmq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfmq.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker
    Start,

    /// Write a starting-point configuration file
    Init {
        /// Instance name for this broker
        #[arg(short, long, default_value = "broker-1")]
        instance: String,

        /// Where to write the file
        #[arg(short, long, default_value = "wolfmq.toml")]
        output: PathBuf,
    },

    /// Check a configuration file and exit
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start => run_start(&cli.config, cli.log_level.as_deref()).await,
        Commands::Init { instance, output } => run_init(&instance, &output),
        Commands::Validate => run_validate(&cli.config),
    }
}

/// RUST_LOG wins over everything; otherwise the CLI flag, then the config
/// file, decide the level
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if format == "compact" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn run_start(config_path: &PathBuf, log_level: Option<&str>) -> Result<()> {
    let config = match WolfMqConfig::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Cannot load {}: {}", config_path.display(), e);
            return Err(e);
        }
    };
    init_logging(
        log_level.unwrap_or(&config.logging.level),
        &config.logging.format,
    );

    std::fs::create_dir_all(config.data_dir())?;
    let lock: Arc<dyn StoreLockMediator> = Arc::new(SqliteStoreLock::new(&config.lock_db_path())?);
    let recovery: Arc<dyn StoreRecovery> = Arc::new(NoopRecovery);

    let engine = ClusterEngine::new(config.clone(), lock, recovery)?;
    Arc::clone(&engine).start().await?;

    if config.api.enabled {
        let http = HttpServer::new(config.api.clone(), Arc::clone(&engine));
        tokio::spawn(async move {
            if let Err(e) = http.start().await {
                tracing::error!("HTTP API failed: {}", e);
            }
        });
    }

    tracing::info!("Broker {} running", config.node.instance);
    tokio::signal::ctrl_c().await?;
    engine.shutdown().await;
    Ok(())
}

fn run_init(instance: &str, output: &PathBuf) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!(
            "{} already exists; not overwriting",
            output.display()
        )));
    }
    let sample = WolfMqConfig::sample(instance);
    let rendered = toml::to_string_pretty(&sample)
        .map_err(|e| Error::Config(format!("cannot render configuration: {}", e)))?;
    std::fs::write(output, rendered)?;
    println!("Wrote {}", output.display());
    Ok(())
}

fn run_validate(config_path: &PathBuf) -> Result<()> {
    match WolfMqConfig::from_file(config_path) {
        Ok(config) => {
            println!(
                "{} is valid: instance {}, {} peers, ha {}",
                config_path.display(),
                config.node.instance,
                config.cluster.peers.len(),
                if config.cluster.ha_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("{} is invalid: {}", config_path.display(), e);
            Err(e)
        }
    }
}
