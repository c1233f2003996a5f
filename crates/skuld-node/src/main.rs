use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use skuld_directory::{
    GatewayAddressCache, MembershipDirectory, MembershipTable, ReminderDirectory, ReminderTable,
    ShardSet,
};
use skuld_storage::FjallBackend;
use skuld_types::now_ns;

mod sweep;

use sweep::DefunctSweep;

#[derive(clap::Parser, Debug)]
#[command(name = "skuld-node", about = "Skuld cluster membership and reminder store")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides `cluster.cluster_id`.
    #[arg(long, global = true)]
    cluster_id: Option<String>,
    /// Overrides `storage.data_dir`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Create the cluster's version row if it is missing.
    Init,
    /// Print the roster and table version.
    Members,
    /// Delete non-Active members whose last heartbeat is older than the cutoff.
    Cleanup {
        #[arg(long)]
        older_than_secs: u64,
    },
    /// Delete every membership row of the cluster.
    DeleteCluster,
    /// Print gateway URIs.
    Gateways,
    /// Print reminders whose grain hash lies in `[begin, end]` (wrapping when begin > end).
    Reminders {
        #[arg(long, default_value_t = 0)]
        begin: u32,
        #[arg(long, default_value_t = u32::MAX)]
        end: u32,
    },
    /// Run the defunct-member sweep until Ctrl-C.
    Sweep,
}

#[derive(Debug, Deserialize)]
struct ClusterConfig {
    cluster_id: String,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    data_dir: PathBuf,
    shard_count: u16,
}

#[derive(Debug, Deserialize)]
struct GatewayConfig {
    max_staleness_secs: u64,
}

#[derive(Debug, Deserialize)]
struct MaintenanceConfig {
    sweep_interval_secs: u64,
    defunct_retention_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    cluster: ClusterConfig,
    storage: StorageConfig,
    gateway: GatewayConfig,
    maintenance: MaintenanceConfig,
    observability: ObservabilityConfig,
}

fn open_backend(path: &Path) -> anyhow::Result<FjallBackend> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    FjallBackend::open(path).with_context(|| format!("failed to open store at {}", path.display()))
}

fn membership(config: &Config) -> anyhow::Result<MembershipDirectory<FjallBackend>> {
    let backend = open_backend(&config.storage.data_dir.join("membership"))?;
    Ok(MembershipDirectory::new(Arc::new(backend), config.cluster.cluster_id.clone())?)
}

fn reminders(config: &Config) -> anyhow::Result<ReminderDirectory<FjallBackend>> {
    let backends = (0..config.storage.shard_count)
        .map(|n| {
            let path = config.storage.data_dir.join("reminders").join(format!("shard-{n}"));
            open_backend(&path).map(Arc::new)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(ReminderDirectory::new(ShardSet::new(backends)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let mut config: Config = figment
        .merge(Env::prefixed("SKULD_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    if let Some(cluster_id) = cli.cluster_id {
        config.cluster.cluster_id = cluster_id;
    }
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    let log_format = config.observability.log_format.as_str();
    match log_format {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    tracing::info!(
        cluster_id = %config.cluster.cluster_id,
        data_dir = %config.storage.data_dir.display(),
        command = ?cli.command,
        "skuld-node starting"
    );

    match cli.command {
        Command::Init => {
            membership(&config)?.initialize(true).await?;
        }
        Command::Members => {
            let snapshot = membership(&config)?.read_all().await?;
            println!("table version {}", snapshot.version);
            for record in snapshot.iter() {
                let e = &record.entry;
                println!(
                    "{}\t{}\t{}\t{}\tproxy={}\tetag={}\tsuspects={}",
                    e.address,
                    e.name,
                    e.host,
                    e.status,
                    e.proxy_port,
                    record.etag,
                    e.suspects.len()
                );
            }
        }
        Command::Cleanup { older_than_secs } => {
            let cutoff = now_ns().saturating_sub(
                i64::try_from(Duration::from_secs(older_than_secs).as_nanos()).unwrap_or(i64::MAX),
            );
            membership(&config)?.cleanup_defunct_before(cutoff).await?;
        }
        Command::DeleteCluster => {
            let dir = membership(&config)?;
            dir.delete_all_for_cluster(&config.cluster.cluster_id).await?;
        }
        Command::Gateways => {
            let dir = membership(&config)?;
            let cache = GatewayAddressCache::new(
                dir.backend().clone(),
                config.cluster.cluster_id.clone(),
                Duration::from_secs(config.gateway.max_staleness_secs),
            )?;
            for uri in cache.get_addresses().await? {
                println!("{uri}");
            }
        }
        Command::Reminders { begin, end } => {
            let snapshot = reminders(&config)?.read_range(begin, end).await?;
            for r in snapshot.iter() {
                println!(
                    "{}\t{}\thash={:#010x}\tstart={}\tperiod={:?}\tetag={}",
                    r.grain_id,
                    r.name,
                    r.grain_id.uniform_hash(),
                    r.start_at_ns,
                    r.period,
                    r.etag
                );
            }
        }
        Command::Sweep => {
            let sweep = DefunctSweep::new(
                Arc::new(membership(&config)?),
                Duration::from_secs(config.maintenance.sweep_interval_secs),
                Duration::from_secs(config.maintenance.defunct_retention_secs),
            );
            sweep
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "failed to listen for ctrl-c");
                    }
                })
                .await;
        }
    }

    Ok(())
}
