//! CryptDevice Mapper: maps a block device through dm-crypt, formatting it on
//! first use.
//!
//! A device that carries no crypt header but does carry another filesystem
//! signature is refused, never reformatted.

pub mod cryptsetup;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

pub use cryptsetup::{Blkid, Cryptsetup};

/// Mapped devices appear under this prefix.
pub const MAPPER_PREFIX: &str = "/dev/mapper/";

/// Key length for plain dm-crypt. Integrity mode needs twice as much.
pub const BASE_KEY_LEN: usize = 32;

/// Key material length required by the given mode.
pub fn required_key_len(integrity: bool) -> usize {
    if integrity {
        2 * BASE_KEY_LEN
    } else {
        BASE_KEY_LEN
    }
}

/// Parameters used when a device has to be formatted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatParams {
    /// Written into the new LUKS2 header.
    pub uuid: String,
    /// Add dm-integrity (`hmac(sha256)`) below dm-crypt.
    pub integrity: bool,
}

#[derive(Debug, Error)]
pub enum CryptError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("failed to initialise crypt context for {device}: {source:#}")]
    Init {
        device: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to read crypt header of {device}: {source:#}")]
    Load {
        device: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to inspect {device}: {source:#}")]
    DiskInfo {
        device: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("{device} has no crypt header but carries a {fs_type} signature, refusing to format it")]
    DiskAlreadyFormatted { device: PathBuf, fs_type: String },

    #[error("failed to format {device}: {source:#}")]
    Format {
        device: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to wipe {name}: {source:#}")]
    Wipe {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to activate {name}: {source:#}")]
    Activate {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to deactivate {name}: {source:#}")]
    Deactivate {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Low-level crypt operations on one device.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CryptDevice: Send + Sync {
    /// Check `device` can be used at all.
    async fn init(&self, device: &Path) -> anyhow::Result<()>;

    /// Whether `device` carries a LUKS2 header.
    async fn has_header(&self, device: &Path) -> anyhow::Result<bool>;

    /// UUID stored in the LUKS2 header of `device`.
    async fn header_uuid(&self, device: &Path) -> anyhow::Result<String>;

    async fn format(&self, device: &Path, params: &FormatParams, key: &[u8]) -> anyhow::Result<()>;

    /// Map `device` as `/dev/mapper/<name>`. `no_journal` skips the
    /// dm-integrity journal.
    async fn activate(
        &self,
        device: &Path,
        name: &str,
        key: &[u8],
        no_journal: bool,
    ) -> anyhow::Result<()>;

    async fn deactivate(&self, name: &str) -> anyhow::Result<()>;

    /// Zero-fill the mapped device `name`.
    async fn wipe(&self, name: &str) -> anyhow::Result<()>;
}

/// Reports foreign filesystem signatures.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiskInspector: Send + Sync {
    /// Filesystem type found on `device`, or an empty string if none.
    async fn fs_type(&self, device: &Path) -> anyhow::Result<String>;
}

/// Serialises all `open`/`close` calls through one lock, so a source device is
/// never mapped twice at once.
pub struct CryptMapper {
    device: Arc<dyn CryptDevice>,
    inspector: Arc<dyn DiskInspector>,
    lock: Mutex<()>,
}

impl CryptMapper {
    pub fn new(device: Arc<dyn CryptDevice>, inspector: Arc<dyn DiskInspector>) -> Self {
        Self {
            device,
            inspector,
            lock: Mutex::new(()),
        }
    }

    /// Map `source` as `volume_id`, formatting it first if it has no crypt
    /// header. Returns the mapped device path.
    pub async fn open(
        &self,
        source: &Path,
        volume_id: &str,
        key: &[u8],
        params: &FormatParams,
    ) -> Result<PathBuf, CryptError> {
        let expected = required_key_len(params.integrity);
        if key.len() != expected {
            return Err(CryptError::InvalidKeyLength {
                expected,
                actual: key.len(),
            });
        }

        let _guard = self.lock.lock().await;

        self.device
            .init(source)
            .await
            .map_err(|e| CryptError::Init {
                device: source.to_owned(),
                source: e,
            })?;

        let has_header = self
            .device
            .has_header(source)
            .await
            .map_err(|e| CryptError::Load {
                device: source.to_owned(),
                source: e,
            })?;

        if has_header {
            info!(device = %source.display(), "crypt header found, skipping format");
        } else {
            self.format(source, volume_id, key, params).await?;
        }

        self.device
            .activate(source, volume_id, key, false)
            .await
            .map_err(|e| CryptError::Activate {
                name: volume_id.to_owned(),
                source: e,
            })?;

        let mapped = mapped_path(volume_id);
        info!(device = %source.display(), mapped = %mapped.display(), "crypt device mapped");
        Ok(mapped)
    }

    async fn format(
        &self,
        source: &Path,
        volume_id: &str,
        key: &[u8],
        params: &FormatParams,
    ) -> Result<(), CryptError> {
        let fs_type = self
            .inspector
            .fs_type(source)
            .await
            .map_err(|e| CryptError::DiskInfo {
                device: source.to_owned(),
                source: e,
            })?;
        if !fs_type.is_empty() {
            return Err(CryptError::DiskAlreadyFormatted {
                device: source.to_owned(),
                fs_type,
            });
        }

        info!(device = %source.display(), integrity = params.integrity, "formatting crypt device");
        self.device
            .format(source, params, key)
            .await
            .map_err(|e| CryptError::Format {
                device: source.to_owned(),
                source: e,
            })?;

        if params.integrity {
            // Fresh integrity tags are garbage until every sector is written once.
            self.device
                .activate(source, volume_id, key, true)
                .await
                .map_err(|e| CryptError::Activate {
                    name: volume_id.to_owned(),
                    source: e,
                })?;

            if let Err(e) = self.device.wipe(volume_id).await {
                if let Err(close_err) = self.device.deactivate(volume_id).await {
                    warn!(name = volume_id, error = %close_err, "failed to deactivate after wipe error");
                }
                return Err(CryptError::Wipe {
                    name: volume_id.to_owned(),
                    source: e,
                });
            }

            self.device
                .deactivate(volume_id)
                .await
                .map_err(|e| CryptError::Deactivate {
                    name: volume_id.to_owned(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Remove the mapping `volume_id`. Closing a mapping that does not exist
    /// is an error.
    pub async fn close(&self, volume_id: &str) -> Result<(), CryptError> {
        let _guard = self.lock.lock().await;

        let mapped = mapped_path(volume_id);
        self.device
            .init(&mapped)
            .await
            .map_err(|e| CryptError::Init {
                device: mapped.clone(),
                source: e,
            })?;
        self.device
            .deactivate(volume_id)
            .await
            .map_err(|e| CryptError::Deactivate {
                name: volume_id.to_owned(),
                source: e,
            })?;
        info!(mapped = %mapped.display(), "crypt device unmapped");
        Ok(())
    }

    /// UUID from the crypt header of `source`, or `None` if it has no header.
    pub async fn header_uuid(&self, source: &Path) -> Result<Option<String>, CryptError> {
        let _guard = self.lock.lock().await;

        self.device
            .init(source)
            .await
            .map_err(|e| CryptError::Init {
                device: source.to_owned(),
                source: e,
            })?;
        let load_err = |e| CryptError::Load {
            device: source.to_owned(),
            source: e,
        };
        if !self.device.has_header(source).await.map_err(load_err)? {
            return Ok(None);
        }
        self.device
            .header_uuid(source)
            .await
            .map(Some)
            .map_err(load_err)
    }
}

fn mapped_path(volume_id: &str) -> PathBuf {
    PathBuf::from(format!("{MAPPER_PREFIX}{volume_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "/dev/some-device";

    fn params(integrity: bool) -> FormatParams {
        FormatParams {
            uuid: "0f1e2d3c-0000-4000-8000-000000000000".into(),
            integrity,
        }
    }

    fn key(integrity: bool) -> Vec<u8> {
        vec![0xAA; required_key_len(integrity)]
    }

    fn empty_disk() -> MockDiskInspector {
        let mut inspector = MockDiskInspector::new();
        inspector.expect_fs_type().returning(|_| Ok(String::new()));
        inspector
    }

    fn mapper(device: MockCryptDevice, inspector: MockDiskInspector) -> CryptMapper {
        CryptMapper::new(Arc::new(device), Arc::new(inspector))
    }

    #[tokio::test]
    async fn existing_header_is_never_reformatted() {
        let mut device = MockCryptDevice::new();
        device.expect_init().returning(|_| Ok(()));
        device.expect_has_header().returning(|_| Ok(true));
        device.expect_format().never();
        device
            .expect_activate()
            .withf(|_, name, _, no_journal| name == "volume0" && !no_journal)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut inspector = MockDiskInspector::new();
        inspector.expect_fs_type().never();

        let path = mapper(device, inspector)
            .open(Path::new(SOURCE), "volume0", &key(false), &params(false))
            .await
            .unwrap();
        assert_eq!(path, PathBuf::from("/dev/mapper/volume0"));
    }

    #[tokio::test]
    async fn empty_disk_is_formatted_then_mapped() {
        let mut device = MockCryptDevice::new();
        device.expect_init().returning(|_| Ok(()));
        device.expect_has_header().returning(|_| Ok(false));
        device
            .expect_format()
            .withf(|_, p, _| p.uuid.starts_with("0f1e2d3c") && !p.integrity)
            .times(1)
            .returning(|_, _, _| Ok(()));
        device.expect_activate().times(1).returning(|_, _, _, _| Ok(()));
        device.expect_wipe().never();

        let path = mapper(device, empty_disk())
            .open(Path::new(SOURCE), "volume0", &key(false), &params(false))
            .await
            .unwrap();
        assert_eq!(path, PathBuf::from("/dev/mapper/volume0"));
    }

    #[tokio::test]
    async fn foreign_filesystem_is_refused_without_mutation() {
        let mut device = MockCryptDevice::new();
        device.expect_init().returning(|_| Ok(()));
        device.expect_has_header().returning(|_| Ok(false));
        device.expect_format().never();
        device.expect_activate().never();
        device.expect_wipe().never();
        let mut inspector = MockDiskInspector::new();
        inspector
            .expect_fs_type()
            .returning(|_| Ok("ext4".to_owned()));

        let err = mapper(device, inspector)
            .open(Path::new(SOURCE), "volume0", &key(false), &params(false))
            .await
            .unwrap_err();
        assert!(matches!(err, CryptError::DiskAlreadyFormatted { ref fs_type, .. } if fs_type == "ext4"));
    }

    #[tokio::test]
    async fn wrong_key_length_fails_before_device_io() {
        // No expectations: any device call panics.
        let m = mapper(MockCryptDevice::new(), MockDiskInspector::new());

        let err = m
            .open(Path::new(SOURCE), "volume0", &key(false), &params(true))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CryptError::InvalidKeyLength { expected: 64, actual: 32 }
        ));

        let err = m
            .open(Path::new(SOURCE), "volume0", b"short", &params(false))
            .await
            .unwrap_err();
        assert!(matches!(err, CryptError::InvalidKeyLength { expected: 32, .. }));
    }

    #[tokio::test]
    async fn init_failure_is_fatal() {
        let mut device = MockCryptDevice::new();
        device
            .expect_init()
            .returning(|_| Err(anyhow::anyhow!("no such device")));
        device.expect_has_header().never();

        let err = mapper(device, MockDiskInspector::new())
            .open(Path::new(SOURCE), "volume0", &key(false), &params(false))
            .await
            .unwrap_err();
        assert!(matches!(err, CryptError::Init { .. }));
    }

    #[tokio::test]
    async fn inspection_failure_stops_format() {
        let mut device = MockCryptDevice::new();
        device.expect_init().returning(|_| Ok(()));
        device.expect_has_header().returning(|_| Ok(false));
        device.expect_format().never();
        let mut inspector = MockDiskInspector::new();
        inspector
            .expect_fs_type()
            .returning(|_| Err(anyhow::anyhow!("blkid failed")));

        let err = mapper(device, inspector)
            .open(Path::new(SOURCE), "volume0", &key(false), &params(false))
            .await
            .unwrap_err();
        assert!(matches!(err, CryptError::DiskInfo { .. }));
    }

    #[tokio::test]
    async fn integrity_format_wipes_before_activation() {
        let mut seq = mockall::Sequence::new();
        let mut device = MockCryptDevice::new();
        device
            .expect_init()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        device
            .expect_has_header()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(false));
        device
            .expect_format()
            .withf(|_, p, key| p.integrity && key.len() == 64)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        device
            .expect_activate()
            .withf(|_, _, _, no_journal| *no_journal)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        device
            .expect_wipe()
            .withf(|name| name == "volume0")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        device
            .expect_deactivate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        device
            .expect_activate()
            .withf(|_, _, _, no_journal| !*no_journal)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));

        mapper(device, empty_disk())
            .open(Path::new(SOURCE), "volume0", &key(true), &params(true))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wipe_failure_deactivates_and_reports() {
        let mut device = MockCryptDevice::new();
        device.expect_init().returning(|_| Ok(()));
        device.expect_has_header().returning(|_| Ok(false));
        device.expect_format().returning(|_, _, _| Ok(()));
        device.expect_activate().times(1).returning(|_, _, _, _| Ok(()));
        device
            .expect_wipe()
            .returning(|_| Err(anyhow::anyhow!("io error")));
        device.expect_deactivate().times(1).returning(|_| Ok(()));

        let err = mapper(device, empty_disk())
            .open(Path::new(SOURCE), "volume0", &key(true), &params(true))
            .await
            .unwrap_err();
        assert!(matches!(err, CryptError::Wipe { .. }));
    }

    #[tokio::test]
    async fn activate_failure_is_reported() {
        let mut device = MockCryptDevice::new();
        device.expect_init().returning(|_| Ok(()));
        device.expect_has_header().returning(|_| Ok(true));
        device
            .expect_activate()
            .returning(|_, _, _, _| Err(anyhow::anyhow!("bad key")));

        let err = mapper(device, MockDiskInspector::new())
            .open(Path::new(SOURCE), "volume0", &key(false), &params(false))
            .await
            .unwrap_err();
        assert!(matches!(err, CryptError::Activate { .. }));
    }

    #[tokio::test]
    async fn close_deactivates_mapping() {
        let mut device = MockCryptDevice::new();
        device
            .expect_init()
            .withf(|p| p == Path::new("/dev/mapper/volume0"))
            .returning(|_| Ok(()));
        device
            .expect_deactivate()
            .withf(|name| name == "volume0")
            .times(1)
            .returning(|_| Ok(()));

        mapper(device, MockDiskInspector::new())
            .close("volume0")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn double_close_is_an_error() {
        let mut device = MockCryptDevice::new();
        let mut calls = 0;
        device.expect_init().returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(())
            } else {
                Err(anyhow::anyhow!("device does not exist"))
            }
        });
        device.expect_deactivate().times(1).returning(|_| Ok(()));

        let m = mapper(device, MockDiskInspector::new());
        m.close("volume0").await.unwrap();
        assert!(matches!(m.close("volume0").await, Err(CryptError::Init { .. })));
    }

    #[tokio::test]
    async fn deactivate_failure_on_close_is_reported() {
        let mut device = MockCryptDevice::new();
        device.expect_init().returning(|_| Ok(()));
        device
            .expect_deactivate()
            .returning(|_| Err(anyhow::anyhow!("busy")));

        let err = mapper(device, MockDiskInspector::new())
            .close("volume0")
            .await
            .unwrap_err();
        assert!(matches!(err, CryptError::Deactivate { .. }));
    }

    #[tokio::test]
    async fn header_uuid_is_none_without_header() {
        let mut device = MockCryptDevice::new();
        device.expect_init().returning(|_| Ok(()));
        device.expect_has_header().returning(|_| Ok(false));
        device.expect_header_uuid().never();

        let uuid = mapper(device, MockDiskInspector::new())
            .header_uuid(Path::new(SOURCE))
            .await
            .unwrap();
        assert!(uuid.is_none());
    }
}
