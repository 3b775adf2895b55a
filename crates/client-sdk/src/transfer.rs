use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::pipeline::part_path;
use async_trait::async_trait;
use hostvault_protocol::BlockAddress;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub type TransferResult<T> = Result<T, TransferError>;

/// Content-addressed bulk transfer network.
#[async_trait]
pub trait TransferNetwork: Send + Sync {
    /// Stores the file at `path` and returns its content address.
    async fn add(&self, path: &Path) -> TransferResult<BlockAddress>;

    /// Writes the content at `address` to `dest`, returning the byte count.
    async fn fetch(&self, address: &BlockAddress, dest: &Path) -> TransferResult<u64>;

    async fn pin(&self, address: &BlockAddress) -> TransferResult<()>;

    async fn unpin(&self, address: &BlockAddress) -> TransferResult<()>;
}

/// Client for an IPFS-compatible HTTP API (`/api/v0/...`).
pub struct HttpTransfer {
    client: reqwest::Client,
    api_url: String,
}

#[derive(Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

impl HttpTransfer {
    pub fn new(cfg: &TransferConfig) -> TransferResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| TransferError::Http(e.to_string()))?;
        Ok(Self {
            client,
            api_url: cfg.api_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v0/{path}", self.api_url)
    }

    async fn post_arg(&self, path: &str, address: &BlockAddress) -> TransferResult<reqwest::Response> {
        self.client
            .post(self.endpoint(path))
            .query(&[("arg", address.as_str())])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| TransferError::Http(e.to_string()))
    }
}

#[async_trait]
impl TransferNetwork for HttpTransfer {
    async fn add(&self, path: &Path) -> TransferResult<BlockAddress> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "block".to_string());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);

        let response: AddResponse = self
            .client
            .post(self.endpoint("add"))
            .query(&[("cid-version", "0"), ("pin", "true")])
            .multipart(form)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| TransferError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| TransferError::Decode(e.to_string()))?;
        let address = BlockAddress::parse(response.hash)?;
        debug!(address = %address, path = %path.display(), "Added block to transfer network");
        Ok(address)
    }

    async fn fetch(&self, address: &BlockAddress, dest: &Path) -> TransferResult<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut response = self.post_arg("cat", address).await?;

        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part).await?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TransferError::Http(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&part, dest).await?;
        Ok(written)
    }

    async fn pin(&self, address: &BlockAddress) -> TransferResult<()> {
        self.post_arg("pin/add", address).await?;
        Ok(())
    }

    async fn unpin(&self, address: &BlockAddress) -> TransferResult<()> {
        self.post_arg("pin/rm", address).await?;
        Ok(())
    }
}
