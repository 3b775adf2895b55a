use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use hostvault_protocol::{Assignment, Identity, UploadRecord};
use hostvault_sdk::{
    default_config_path, mount, retrieve, CancellationToken, Distribution, Distributor,
    HttpTransfer, InsertOutcome, RpcLedger, Settler, StoreRegistry, TrackingStore, VaultConfig,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "hostvault-uploader",
    version,
    about = "Mount, distribute, settle and retrieve files on hostvault"
)]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ledger account uploads are tracked and paid for under.
    #[arg(long)]
    identity: Option<String>,

    #[arg(long)]
    rpc_url: Option<String>,

    #[arg(long)]
    transfer_url: Option<String>,

    #[arg(long)]
    work_dir: Option<PathBuf>,

    #[arg(long)]
    block_size: Option<usize>,

    /// Issue settlement payments concurrently. Only safe when the ledger
    /// accepts parallel writes from one account.
    #[arg(long)]
    concurrent_payments: Option<bool>,

    #[arg(long, default_value_t = false)]
    save_config: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt and chunk a file and start tracking it.
    Mount {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        password: String,
        /// Base units per byte.
        #[arg(long, default_value_t = 1)]
        unit_value: u128,
    },
    /// Assign a mounted file to receivers through the ledger.
    Distribute {
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 1)]
        replicas: usize,
        /// Assign every block on its own instead of the file as a whole.
        #[arg(long, default_value_t = false)]
        per_block: bool,
    },
    /// Pay every receiver for every block it holds.
    Pay {
        #[arg(long)]
        name: String,
    },
    /// Fetch, reassemble and decrypt a tracked file.
    Retrieve {
        #[arg(long)]
        name: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        out: PathBuf,
    },
    /// List tracked uploads.
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Drop every tracked record for this identity.
    Reset {
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Serialize)]
struct StatusLine<'a> {
    file_name: &'a str,
    size: u64,
    blocks: usize,
    unit_value: String,
    mounted: bool,
    uploaded: bool,
    receivers: Vec<String>,
    last_paid_ms: Option<u64>,
}

impl<'a> From<&'a UploadRecord> for StatusLine<'a> {
    fn from(record: &'a UploadRecord) -> Self {
        Self {
            file_name: &record.file_name,
            size: record.size,
            blocks: record.blocks.len(),
            unit_value: record.unit_value.to_string(),
            mounted: record.mounted,
            uploaded: record.uploaded,
            receivers: record
                .receivers
                .as_ref()
                .map(Assignment::receivers)
                .unwrap_or_default()
                .into_iter()
                .map(|r| r.to_string())
                .collect(),
            last_paid_ms: record.last_paid_ms,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
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

    let result = run(args.command, &cfg, &identity, store).await;
    registry.close()?;
    result
}

async fn run(
    command: Commands,
    cfg: &VaultConfig,
    identity: &Identity,
    store: Arc<TrackingStore>,
) -> Result<()> {
    match command {
        Commands::Mount {
            file,
            password,
            unit_value,
        } => {
            let transfer = HttpTransfer::new(&cfg.transfer)?;
            let mounted = mount(&transfer, &store, &cfg.storage, &file, &password, unit_value).await?;
            if mounted.outcome == InsertOutcome::AlreadyExists {
                warn!(file = %mounted.record.file_name, "Already tracked; nothing mounted");
            }
            println!(
                "uploader mount name={} size={} blocks={} outcome={:?}",
                mounted.record.file_name,
                mounted.record.size,
                mounted.record.blocks.len(),
                mounted.outcome
            );
        }
        Commands::Distribute {
            name,
            replicas,
            per_block,
        } => {
            let ledger = Arc::new(RpcLedger::new(&cfg.ledger, identity.clone())?);
            let request = if per_block {
                Distribution::per_block(replicas)
            } else {
                Distribution::whole_file(replicas)
            };
            let cancel = cancel_on_ctrl_c();
            let assignment = Distributor::new(ledger, store, cfg.ledger.call_timeout())
                .distribute(&name, request, &cancel)
                .await?;
            let receivers: Vec<String> = assignment
                .receivers()
                .into_iter()
                .map(|r| r.to_string())
                .collect();
            println!(
                "uploader distribute name={name} receivers={}",
                receivers.join(",")
            );
        }
        Commands::Pay { name } => {
            let ledger = Arc::new(RpcLedger::new(&cfg.ledger, identity.clone())?);
            let cancel = cancel_on_ctrl_c();
            let report = Settler::new(
                ledger,
                store,
                cfg.ledger.call_timeout(),
                cfg.settlement.clone(),
            )
            .pay(&name, &cancel)
            .await?;
            println!(
                "uploader pay name={name} payments={} total={} last_paid_ms={}",
                report.payments,
                report.total,
                report
                    .last_paid_ms
                    .map_or_else(|| "-".to_string(), |ts| ts.to_string())
            );
        }
        Commands::Retrieve {
            name,
            password,
            out,
        } => {
            let transfer = HttpTransfer::new(&cfg.transfer)?;
            let written = retrieve(&transfer, &store, &cfg.storage, &name, &password, &out).await?;
            println!("uploader retrieve name={name} out={}", written.display());
        }
        Commands::Status { json } => {
            let records = store.find_uploads(|_| true)?;
            if json {
                let lines: Vec<StatusLine<'_>> = records.iter().map(StatusLine::from).collect();
                println!("{}", serde_json::to_string_pretty(&lines)?);
            } else {
                for record in &records {
                    let line = StatusLine::from(record);
                    println!(
                        "{} size={} blocks={} mounted={} uploaded={} receivers={} last_paid_ms={}",
                        line.file_name,
                        line.size,
                        line.blocks,
                        line.mounted,
                        line.uploaded,
                        line.receivers.join(","),
                        line.last_paid_ms
                            .map_or_else(|| "-".to_string(), |ts| ts.to_string())
                    );
                }
            }
        }
        Commands::Reset { yes } => {
            if !yes {
                return Err(anyhow!("reset drops every tracked record; pass --yes to confirm"));
            }
            store.reset()?;
            println!("uploader reset identity={identity}");
        }
    }
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; stopping after the in-flight ledger call");
            on_signal.cancel();
        }
    });
    cancel
}

fn resolve_config(args: &Args, config_path: &Path) -> Result<VaultConfig> {
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
    if let Some(dir) = &args.work_dir {
        cfg.storage.work_dir = dir.clone();
    }
    if let Some(size) = args.block_size {
        cfg.storage.block_size = size;
    }
    if let Some(concurrent) = args.concurrent_payments {
        cfg.settlement.concurrent_payments = concurrent;
    }
    cfg.validate()?;

    if args.save_config {
        cfg.save(config_path)?;
        info!(path = %config_path.display(), "Saved uploader config");
    }
    Ok(cfg)
}
