//! The node's state disk: one block device mapped through [`CryptMapper`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::STATE_DISK_KEY_LENGTH;
use tracing::info;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::cryptmapper::{required_key_len, CryptMapper, FormatParams};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateDisk: Send + Sync {
    /// Disk UUID: from the crypt header if there is one, otherwise the UUID
    /// the disk will be formatted with.
    async fn uuid(&self) -> Result<String>;

    /// Whether the disk already carries a crypt header.
    async fn is_initialized(&self) -> Result<bool>;

    /// Map the disk with a state-disk key, formatting it first if needed.
    async fn open(&self, key: &[u8]) -> Result<PathBuf>;
}

pub struct CryptStateDisk {
    mapper: CryptMapper,
    device: PathBuf,
    mapping: String,
    integrity: bool,
    format_uuid: String,
}

impl CryptStateDisk {
    pub fn new(
        mapper: CryptMapper,
        device: impl Into<PathBuf>,
        mapping: impl Into<String>,
        integrity: bool,
    ) -> Self {
        Self {
            mapper,
            device: device.into(),
            mapping: mapping.into(),
            integrity,
            format_uuid: Uuid::new_v4().to_string(),
        }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }
}

#[async_trait]
impl StateDisk for CryptStateDisk {
    async fn uuid(&self) -> Result<String> {
        let header = self
            .mapper
            .header_uuid(&self.device)
            .await
            .context("failed to read state disk UUID")?;
        Ok(header.unwrap_or_else(|| self.format_uuid.clone()))
    }

    async fn is_initialized(&self) -> Result<bool> {
        let header = self
            .mapper
            .header_uuid(&self.device)
            .await
            .context("failed to inspect state disk")?;
        Ok(header.is_some())
    }

    async fn open(&self, key: &[u8]) -> Result<PathBuf> {
        if key.len() != STATE_DISK_KEY_LENGTH {
            anyhow::bail!(
                "state disk key must be {STATE_DISK_KEY_LENGTH} bytes, got {}",
                key.len()
            );
        }
        // Plain mode uses the leading half of the key.
        let key = &key[..required_key_len(self.integrity)];
        let params = FormatParams {
            uuid: self.format_uuid.clone(),
            integrity: self.integrity,
        };
        let mapped = self
            .mapper
            .open(&self.device, &self.mapping, key, &params)
            .await
            .context("failed to open state disk")?;
        info!(device = %self.device.display(), mapped = %mapped.display(), "state disk opened");
        Ok(mapped)
    }
}
