use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use hostvault_protocol::{BlockAddress, Identity};
use hostvault_sdk::{
    default_config_path, CancellationToken, HostLoop, HttpTransfer, RpcLedger, StoreRegistry,
    VaultConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "hostvault-node",
    version,
    about = "Hosts blocks the ledger assigns to this identity"
)]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ledger account this node hosts for.
    #[arg(long)]
    identity: Option<String>,

    #[arg(long)]
    rpc_url: Option<String>,

    #[arg(long)]
    transfer_url: Option<String>,

    #[arg(long)]
    host_dir: Option<PathBuf>,

    #[arg(long)]
    fetch_concurrency: Option<usize>,

    #[arg(long)]
    interval_secs: Option<u64>,

    /// Write the merged configuration back to the config path.
    #[arg(long, default_value_t = false)]
    save_config: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run acquisition passes on an interval until Ctrl-C.
    Run,
    /// Run a single acquisition pass.
    Once,
    /// List tracked host records.
    List {
        #[arg(long, default_value_t = false)]
        pending: bool,
    },
    /// Stop hosting a block: unpin, delete local bytes, forget it.
    Remove { address: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let cfg = resolve_config(&args, &config_path)?;

    let identity = Identity::new(cfg.identity.clone());
    let registry = StoreRegistry::new(&cfg.storage.store_root);
    let store = registry
        .open(&identity)
        .with_context(|| format!("failed to open tracking store for {identity}"))?;
    let ledger = Arc::new(RpcLedger::new(&cfg.ledger, identity.clone())?);
    let transfer = Arc::new(HttpTransfer::new(&cfg.transfer)?);
    let host = HostLoop::new(
        ledger,
        transfer,
        store.clone(),
        cfg.storage.host_dir.clone(),
        cfg.ledger.call_timeout(),
        cfg.hosting.clone(),
    );

    info!(
        identity = %identity,
        host_dir = %cfg.storage.host_dir.display(),
        fetch_concurrency = cfg.hosting.fetch_concurrency,
        "Node configured"
    );

    let result = match args.command {
        Command::Run => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "Failed to listen for Ctrl-C");
                }
                on_signal.cancel();
            });
            host.run(cancel).await;
            Ok(())
        }
        Command::Once => {
            let report = host.run_once(&CancellationToken::new()).await?;
            println!(
                "node pass discovered={} known={} fetched={} payments_updated={}",
                report.discovered, report.already_known, report.fetched, report.payments_updated
            );
            Ok(())
        }
        Command::List { pending } => {
            let filter = if pending { Some(false) } else { None };
            for record in store.find_hosts(filter)? {
                println!(
                    "{} sender={} size={} hosted={} path={} times_paid={} amount_paid={}",
                    record.address,
                    record.sender,
                    record.size,
                    record.hosted,
                    record.path.as_deref().unwrap_or("-"),
                    record.times_paid,
                    record.amount_paid
                );
            }
            Ok(())
        }
        Command::Remove { address } => {
            let address = BlockAddress::parse(address)?;
            if host.remove(&address).await? {
                println!("node removed {address}");
                Ok(())
            } else {
                Err(anyhow!("{address} is not hosted by {identity}"))
            }
        }
    };

    registry.close()?;
    result
}

fn resolve_config(args: &Args, config_path: &std::path::Path) -> anyhow::Result<VaultConfig> {
    let mut cfg = VaultConfig::load(config_path)?;
    if let Some(identity) = &args.identity {
        cfg.identity = identity.clone();
    }
    if let Some(url) = &args.rpc_url {
        cfg.ledger.rpc_url = url.clone();
    }
    if let Some(url) = &args.transfer_url {
        cfg.transfer.api_url = url.clone();
    }
    if let Some(dir) = &args.host_dir {
        cfg.storage.host_dir = dir.clone();
    }
    if let Some(n) = args.fetch_concurrency {
        cfg.hosting.fetch_concurrency = n;
    }
    if let Some(secs) = args.interval_secs {
        cfg.hosting.refresh_interval_secs = secs;
    }
    cfg.validate()?;

    if args.save_config {
        cfg.save(config_path)?;
        info!(path = %config_path.display(), "Saved node config");
    }
    Ok(cfg)
}
