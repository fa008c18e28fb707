//! Boot media and SSH key collaborators used by Create.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use bhyvelet_host::execute;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Supplies the boot image for a new instance.
#[async_trait]
pub trait BootMedia: Send + Sync {
    /// Place the boot image at `dest`.
    async fn provision(&self, dest: &Path) -> Result<()>;
}

/// Copies an already-downloaded ISO from a local cache.
#[derive(Debug, Clone)]
pub struct CachedIso {
    pub source: PathBuf,
}

impl CachedIso {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[async_trait]
impl BootMedia for CachedIso {
    async fn provision(&self, dest: &Path) -> Result<()> {
        tracing::info!(from = %self.source.display(), to = %dest.display(), "copying boot image");
        tokio::fs::metadata(&self.source)
            .await
            .map_err(CoreError::resource(&self.source))?;
        let bytes = tokio::fs::copy(&self.source, dest)
            .await
            .map_err(CoreError::resource(dest))?;
        tracing::debug!(bytes, "boot image copied");
        Ok(())
    }
}

/// Supplies the public key authorized inside the guest.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Ensure a key pair exists at `key_path` and return the contents of
    /// `<key_path>.pub`.
    async fn public_key(&self, key_path: &Path) -> Result<Vec<u8>>;
}

/// Generates an RSA key pair with `ssh-keygen(1)` when none exists.
#[derive(Debug, Clone, Default)]
pub struct SshKeygen;

fn public_key_path(key_path: &Path) -> PathBuf {
    let mut path = key_path.as_os_str().to_owned();
    path.push(".pub");
    PathBuf::from(path)
}

#[async_trait]
impl KeyProvider for SshKeygen {
    async fn public_key(&self, key_path: &Path) -> Result<Vec<u8>> {
        let exists = tokio::fs::try_exists(key_path)
            .await
            .map_err(CoreError::resource(key_path))?;
        if !exists {
            tracing::info!(path = %key_path.display(), "creating SSH key");
            let mut cmd = Command::new("ssh-keygen");
            cmd.args(["-t", "rsa", "-b", "2048", "-N", "", "-q", "-f"])
                .arg(key_path);
            execute(&mut cmd).await?;
        }

        let pub_path = public_key_path(key_path);
        tokio::fs::read(&pub_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                tracing::warn!(path = %pub_path.display(), "private key without public half");
            }
            CoreError::Resource {
                path: pub_path.clone(),
                source: e,
            }
        })
    }
}
