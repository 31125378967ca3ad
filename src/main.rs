use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use shardplane::config::PlaneConfig;
use shardplane::{
    PostgresConnector, ShardId, ShardKey, ShardPlane, ShardingStrategy, WeightedKeyBuilder,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "shardplane")]
#[command(about = "Shard routing, replica routing and rebalancing control plane")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, global = true, default_value = "shardplane.toml")]
    config: PathBuf,

    /// Environment table to load (defaults to SHARDPLANE_ENV, then `development`)
    #[arg(long, global = true)]
    env: Option<String>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and validate the configuration
    Validate,
    /// Show which shard a key resolves to, without connecting
    Resolve {
        /// Numeric key or region name
        key: Option<String>,
        /// Override the configured strategy
        #[arg(long)]
        strategy: Option<ShardingStrategy>,
        /// JSON entity for the configured weighted key
        #[arg(long, conflicts_with = "key")]
        entity: Option<String>,
    },
    /// Connect, probe and collect once, then print the admin snapshot as JSON
    Status,
    /// Run health, metrics and rebalance loops until interrupted
    Run,
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("shardplane={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn load_config(cli: &Cli) -> Result<PlaneConfig> {
    let environment = cli.env.clone().unwrap_or_else(PlaneConfig::environment_from_env);
    PlaneConfig::load(&cli.config, Some(&environment))
        .with_context(|| format!("loading {} ({})", cli.config.display(), environment))
}

fn validate(config: &PlaneConfig) -> Result<()> {
    println!(
        "configuration ok: {} active shard(s), {} standby, {} replica(s), strategy {}",
        config.active_shards().count(),
        config.standby_shards().count(),
        config.replicas.len(),
        config.sharding.strategy
    );
    Ok(())
}

fn resolve(
    config: &PlaneConfig,
    key: Option<String>,
    strategy: Option<ShardingStrategy>,
    entity: Option<String>,
) -> Result<()> {
    if let Some(entity) = entity {
        let builder = WeightedKeyBuilder::new(
            config.sharding.weighted_key.clone(),
            config.sharding.default_shard,
        )?;
        let mut active: Vec<ShardId> = config.active_shards().map(|shard| shard.id).collect();
        active.sort_unstable();
        let entity: serde_json::Value =
            serde_json::from_str(&entity).context("--entity must be a JSON object")?;
        println!("{}", builder.shard_for_json(&entity, &active)?);
        return Ok(());
    }

    let raw = key.ok_or_else(|| anyhow!("a key or --entity is required"))?;
    let key = match raw.parse::<i64>() {
        Ok(numeric) => ShardKey::Numeric(numeric),
        Err(_) => ShardKey::Region(raw),
    };
    let strategy = strategy.unwrap_or(config.sharding.strategy);
    let shard_id = config.resolver_table()?.resolve(strategy, &key)?;
    println!("{}", shard_id);
    Ok(())
}

async fn status(config: PlaneConfig) -> Result<()> {
    let plane = ShardPlane::connect(config, Arc::new(PostgresConnector::new())).await?;
    plane.registry().health_check_all().await?;
    plane.replicas().health_check().await?;
    plane.collector().collect().await?;

    println!("{}", plane.admin_snapshot()?.to_json()?);
    plane.shutdown().await?;
    Ok(())
}

async fn run(config: PlaneConfig) -> Result<()> {
    let plane = ShardPlane::connect(config, Arc::new(PostgresConnector::new())).await?;
    if let Err(err) = plane.persist_descriptors().await {
        warn!(error = %err, "could not persist descriptors to the control database");
    }

    let workers = plane.spawn_workers();
    info!(workers = workers.len(), "shard plane running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    for worker in workers {
        let name = worker.name();
        if let Err(err) = worker.stop().await {
            warn!(worker = name, error = %err, "worker did not stop cleanly");
        }
    }
    plane.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = load_config(&cli)?;
    match cli.command {
        Command::Validate => validate(&config),
        Command::Resolve {
            key,
            strategy,
            entity,
        } => resolve(&config, key, strategy, entity),
        Command::Status => status(config).await,
        Command::Run => run(config).await,
    }
}
