//! [`CryptDevice`] and [`DiskInspector`] backed by `cryptsetup`, `blkdiscard`
//! and `blkid`.
//!
//! Key material only ever reaches the tools through stdin.

use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::process::{Output, Stdio};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{mapped_path, CryptDevice, DiskInspector, FormatParams};

const CIPHER: &str = "aes-xts-plain64";
const INTEGRITY: &str = "hmac-sha256";

/// Volume key bits for AES-256 in XTS mode.
const CIPHER_KEY_BITS: usize = 512;
/// Extra volume key bits for the `hmac-sha256` integrity tag.
const INTEGRITY_KEY_BITS: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
pub struct Cryptsetup;

#[async_trait]
impl CryptDevice for Cryptsetup {
    async fn init(&self, device: &Path) -> Result<()> {
        let meta = tokio::fs::metadata(device)
            .await
            .with_context(|| format!("cannot access {}", device.display()))?;
        if !meta.file_type().is_block_device() {
            anyhow::bail!("{} is not a block device", device.display());
        }
        Ok(())
    }

    async fn has_header(&self, device: &Path) -> Result<bool> {
        let mut cmd = Command::new("cryptsetup");
        cmd.args(["isLuks", "--type", "luks2"]).arg(device);
        let out = output(cmd, None).await?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(failure("cryptsetup isLuks", &out)),
        }
    }

    async fn header_uuid(&self, device: &Path) -> Result<String> {
        let mut cmd = Command::new("cryptsetup");
        cmd.arg("luksUUID").arg(device);
        let out = checked(cmd, None, "cryptsetup luksUUID").await?;
        let uuid = String::from_utf8(out.stdout).context("luksUUID printed non-UTF-8 output")?;
        Ok(uuid.trim().to_owned())
    }

    async fn format(&self, device: &Path, params: &FormatParams, key: &[u8]) -> Result<()> {
        let mut cmd = Command::new("cryptsetup");
        cmd.args(luks_format_args(params)).arg(device);
        checked(cmd, Some(key), "cryptsetup luksFormat").await?;
        Ok(())
    }

    async fn activate(&self, device: &Path, name: &str, key: &[u8], no_journal: bool) -> Result<()> {
        let mut cmd = Command::new("cryptsetup");
        cmd.args(["open", "--type", "luks2", "--key-file", "-"]);
        if no_journal {
            cmd.arg("--integrity-no-journal");
        }
        cmd.arg(device).arg(name);
        checked(cmd, Some(key), "cryptsetup open").await?;
        Ok(())
    }

    async fn deactivate(&self, name: &str) -> Result<()> {
        let mut cmd = Command::new("cryptsetup");
        cmd.args(["close", name]);
        checked(cmd, None, "cryptsetup close").await?;
        Ok(())
    }

    async fn wipe(&self, name: &str) -> Result<()> {
        let mut cmd = Command::new("blkdiscard");
        cmd.arg("--zeroout").arg(mapped_path(name));
        checked(cmd, None, "blkdiscard").await?;
        Ok(())
    }
}

/// Arguments for `cryptsetup luksFormat`, without the device.
///
/// With integrity the volume key also carries the HMAC key, so it grows by
/// [`INTEGRITY_KEY_BITS`].
fn luks_format_args(params: &FormatParams) -> Vec<String> {
    let key_bits = if params.integrity {
        CIPHER_KEY_BITS + INTEGRITY_KEY_BITS
    } else {
        CIPHER_KEY_BITS
    };
    let mut args: Vec<String> = [
        "luksFormat",
        "--batch-mode",
        "--type",
        "luks2",
        "--cipher",
        CIPHER,
        "--pbkdf",
        "pbkdf2",
        "--key-file",
        "-",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();
    args.extend(["--key-size".to_owned(), key_bits.to_string()]);
    args.extend(["--uuid".to_owned(), params.uuid.clone()]);
    if params.integrity {
        args.extend(["--integrity", INTEGRITY, "--integrity-no-wipe"].map(str::to_owned));
    }
    args
}

/// Filesystem signature detection via `blkid`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blkid;

#[async_trait]
impl DiskInspector for Blkid {
    async fn fs_type(&self, device: &Path) -> Result<String> {
        let mut cmd = Command::new("blkid");
        cmd.args(["-s", "TYPE", "-o", "value"]).arg(device);
        let out = output(cmd, None).await?;
        match out.status.code() {
            Some(0) => {
                let fs = String::from_utf8(out.stdout).context("blkid printed non-UTF-8 output")?;
                Ok(fs.trim().to_owned())
            }
            // 2: nothing recognised on the device.
            Some(2) => Ok(String::new()),
            _ => Err(failure("blkid", &out)),
        }
    }
}

async fn output(mut cmd: Command, stdin: Option<&[u8]>) -> Result<Output> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
    debug!(command = ?cmd.as_std(), "running command");

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;
    if let Some(input) = stdin {
        let mut pipe = child.stdin.take().context("child stdin was not captured")?;
        pipe.write_all(input)
            .await
            .with_context(|| format!("failed to write to {program} stdin"))?;
    }
    child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to wait for {program}"))
}

async fn checked(cmd: Command, stdin: Option<&[u8]>, what: &str) -> Result<Output> {
    let out = output(cmd, stdin).await?;
    if !out.status.success() {
        return Err(failure(what, &out));
    }
    Ok(out)
}

fn failure(what: &str, out: &Output) -> anyhow::Error {
    anyhow::anyhow!(
        "{what} failed ({}): {}",
        out.status,
        String::from_utf8_lossy(&out.stderr).trim()
    )
}
