//! Binary applying a routing table and/or a firewall table once

use clap::Parser;
use gateway_dataplane::{
    config::{load_config, GatewayConfig},
    crd::{FirewallTable, Table},
    firewall::{FirewallReconciler, MemoryNftHandle, NftCommand, NftHandle},
    netlink::{IpCommand, MemoryRouteHandle, RouteHandle},
    reconciler::NetworkStateReconciler,
    rt_tables::{table_id, TableRegistry},
};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "gateway-reconcile",
    about = "Apply declarative routing and firewall tables to the kernel",
    version
)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// YAML file holding a routing table
    #[arg(long)]
    table: Option<PathBuf>,

    /// YAML file holding a firewall table
    #[arg(long)]
    firewall: Option<PathBuf>,

    /// Delete the given tables instead of applying them
    #[arg(long)]
    remove: bool,

    /// Work on an in-memory kernel state instead of calling ip and nft
    #[arg(long)]
    dry_run: bool,

    /// Routing table name registry
    #[arg(long)]
    rt_tables: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info", env = "GATEWAY_LOG_LEVEL")]
    log_level: String,
}

async fn read_yaml<T: DeserializeOwned>(path: &Path) -> gateway_dataplane::Result<T> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Copy the registry at `path` into a scratch directory, so a dry run never
/// rewrites the real one. A missing registry stays missing.
async fn scratch_registry(path: &Path) -> gateway_dataplane::Result<(TempDir, PathBuf)> {
    let dir = tempfile::tempdir()?;
    let scratch = dir.path().join("rt_tables");
    match tokio::fs::copy(path, &scratch).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok((dir, scratch))
}

async fn apply_table(
    reconciler: &NetworkStateReconciler,
    table: &Table,
    remove: bool,
) -> gateway_dataplane::Result<()> {
    let stats = if remove {
        reconciler.remove_table(table).await?
    } else {
        reconciler.reconcile_table(table).await?
    };
    info!(
        table = %table.name,
        id = table_id(&table.name),
        ?stats,
        "Routing table done"
    );
    Ok(())
}

async fn apply_firewall(
    reconciler: &FirewallReconciler,
    table: &FirewallTable,
    remove: bool,
) -> gateway_dataplane::Result<()> {
    if remove {
        reconciler.remove(table).await
    } else {
        let stats = reconciler.reconcile(table).await?;
        info!(table = %table.name, ?stats, "Firewall table done");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &args.config {
        Some(path) => load_config::<GatewayConfig>(path)?,
        None => GatewayConfig::default(),
    };
    let mut registry = args
        .rt_tables
        .unwrap_or_else(|| config.dataplane.rt_tables_path.clone());

    let routes: Arc<dyn RouteHandle>;
    let nft: Arc<dyn NftHandle>;
    let mut scratch = None;
    if args.dry_run {
        info!("Dry run, kernel state is simulated");
        routes = Arc::new(MemoryRouteHandle::new());
        nft = Arc::new(MemoryNftHandle::new());
        let (dir, path) = scratch_registry(&registry).await?;
        info!(registry = %path.display(), "Dry run, registry edits go to a scratch copy");
        registry = path;
        scratch = Some(dir);
    } else {
        routes = Arc::new(IpCommand::default());
        nft = Arc::new(NftCommand::default());
    }

    let mut result = Ok(());
    if let Some(path) = &args.table {
        let table: Table = read_yaml(path).await?;
        let reconciler = NetworkStateReconciler::new(routes, TableRegistry::new(registry));
        result = result.and(apply_table(&reconciler, &table, args.remove).await);
    }
    if let Some(path) = &args.firewall {
        let table: FirewallTable = read_yaml(path).await?;
        let reconciler = FirewallReconciler::new(nft);
        result = result.and(apply_firewall(&reconciler, &table, args.remove).await);
    }

    if let Err(e) = result {
        error!("Reconciliation error: {}", e);
        // exit skips destructors
        drop(scratch);
        std::process::exit(1);
    }

    Ok(())
}
