//! Raw disk image with the boot2docker key bundle.
//!
//! The guest's automount script looks for a tar archive at the start of the
//! disk. A first entry named [`FORMAT_MARKER`] tells it to format the disk
//! and unpack the remaining entries into the docker user's home directory.

use crate::error::{CoreError, Result};
use std::io;
use std::path::Path;
use tar::{Builder, EntryType, Header};
use tokio::io::AsyncWriteExt;

/// Name of the entry that asks the guest to format the disk.
pub const FORMAT_MARKER: &str = "boot2docker, please format-me";

fn entry(kind: EntryType, size: u64, mode: u32) -> Header {
    let mut header = Header::new_ustar();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(mode);
    header
}

/// Build the ustar key bundle carrying `public_key` as the guest's
/// `authorized_keys` and `authorized_keys2`.
pub fn key_bundle(public_key: &[u8]) -> io::Result<Vec<u8>> {
    let mut tar = Builder::new(Vec::new());
    let key_len = public_key.len() as u64;

    tar.append_data(
        &mut entry(EntryType::Regular, 0, 0o644),
        FORMAT_MARKER,
        io::empty(),
    )?;
    tar.append_data(&mut entry(EntryType::Directory, 0, 0o700), ".ssh", io::empty())?;
    for name in [".ssh/authorized_keys", ".ssh/authorized_keys2"] {
        tar.append_data(
            &mut entry(EntryType::Regular, key_len, 0o644),
            name,
            public_key,
        )?;
    }
    tar.into_inner()
}

/// Create a raw disk image of exactly `size` bytes at `path` with `bundle`
/// written at offset 0. Fails if `path` already exists.
pub async fn create_disk_image(path: &Path, size: u64, bundle: &[u8]) -> Result<()> {
    if bundle.len() as u64 > size {
        return Err(CoreError::Config(format!(
            "disk size {size} is smaller than the {} byte key bundle",
            bundle.len()
        )));
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(CoreError::resource(path))?;
    file.set_len(size).await.map_err(CoreError::resource(path))?;
    file.write_all(bundle)
        .await
        .map_err(CoreError::resource(path))?;
    file.sync_all().await.map_err(CoreError::resource(path))?;

    tracing::info!(path = %path.display(), size, bundle_len = bundle.len(), "disk image created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::path::PathBuf;

    const KEY: &[u8] = b"ssh-rsa AAAAB3NzaC1yc2E test@host\n";

    #[test]
    fn test_key_bundle_entries() {
        let bundle = key_bundle(KEY).unwrap();
        let mut archive = tar::Archive::new(bundle.as_slice());

        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let header = entry.header();
            let path = entry.path().unwrap().into_owned();
            let kind = header.entry_type();
            let mode = header.mode().unwrap();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).unwrap();
            seen.push((path, kind, mode, body));
        }

        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].0, PathBuf::from(FORMAT_MARKER));
        assert!(seen[0].1.is_file());
        assert!(seen[0].3.is_empty());

        assert_eq!(seen[1].0, PathBuf::from(".ssh"));
        assert!(seen[1].1.is_dir());
        assert_eq!(seen[1].2, 0o700);

        for (entry, name) in seen[2..].iter().zip(["authorized_keys", "authorized_keys2"]) {
            assert_eq!(entry.0, PathBuf::from(".ssh").join(name));
            assert_eq!(entry.2, 0o644);
            assert_eq!(entry.3, KEY);
        }
    }

    #[tokio::test]
    async fn test_disk_image_size_and_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guest.img");
        let bundle = key_bundle(KEY).unwrap();

        create_disk_image(&path, 16384, &bundle).await.unwrap();

        let image = std::fs::read(&path).unwrap();
        assert_eq!(image.len(), 16384);
        assert_eq!(&image[..bundle.len()], bundle.as_slice());
        assert!(image[bundle.len()..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_disk_image_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guest.img");
        std::fs::write(&path, b"precious").unwrap();

        let err = create_disk_image(&path, 16384, b"bundle").await.unwrap_err();
        match err {
            CoreError::Resource { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"precious");
    }

    #[tokio::test]
    async fn test_disk_smaller_than_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guest.img");
        let err = create_disk_image(&path, 4, b"too long").await.unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
        assert!(!path.exists());
    }
}
