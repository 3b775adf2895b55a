use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub identity: String,
    pub ledger: LedgerConfig,
    pub transfer: TransferConfig,
    pub storage: StorageConfig,
    pub hosting: HostingConfig,
    pub settlement: SettlementConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub call_timeout_secs: u64,
    pub confirmation_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub api_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub store_root: PathBuf,
    pub work_dir: PathBuf,
    pub host_dir: PathBuf,
    pub block_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostingConfig {
    pub fetch_concurrency: usize,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Only enable when the ledger accepts concurrent writes from one account
    /// without nonce conflicts.
    pub concurrent_payments: bool,
    pub payment_concurrency: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            call_timeout_secs: 120,
            confirmation_poll_ms: 1_000,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:5001".to_string(),
            request_timeout_secs: 300,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("./hostvault-data/stores"),
            work_dir: PathBuf::from("./hostvault-data/work"),
            host_dir: PathBuf::from("./hostvault-data/hosted"),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: 4,
            refresh_interval_secs: 30,
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            concurrent_payments: false,
            payment_concurrency: 4,
        }
    }
}

impl LedgerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn confirmation_poll(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_ms.max(10))
    }
}

impl VaultConfig {
    /// Reads `path` if it exists, otherwise returns defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.identity.trim().is_empty() {
            anyhow::bail!("identity must be set (config file or --identity)");
        }
        if self.storage.block_size == 0 {
            anyhow::bail!("storage.block_size must be > 0");
        }
        if self.hosting.fetch_concurrency == 0 {
            anyhow::bail!("hosting.fetch_concurrency must be > 0");
        }
        if self.settlement.payment_concurrency == 0 {
            anyhow::bail!("settlement.payment_concurrency must be > 0");
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    if cfg!(target_os = "windows") {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata).join("Hostvault").join("config.json");
        }
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("hostvault").join("config.json");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("hostvault")
            .join("config.json");
    }
    PathBuf::from("hostvault-config.json")
}
