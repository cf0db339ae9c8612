//! Receive-side file staging.
//!
//! Incoming payloads are written to a `.part` file and only promoted to
//! their final name once the declared size and digest check out. An
//! aborted or cancelled transfer leaves the `.part` marker behind, so a
//! partially received file is never visible under its real name.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Sink for incoming files.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Start staging a file for `peer_id`. `name` is the sender-declared
    /// filename; the store decides the on-disk name.
    async fn begin(&self, peer_id: &str, name: &str) -> Result<IncomingFile>;
}

/// Local filesystem-based store.
#[derive(Clone)]
pub struct LocalStore {
    incoming_dir: PathBuf,
}

impl LocalStore {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let incoming_dir = base_dir.join("incoming");
        std::fs::create_dir_all(&incoming_dir)
            .context("Failed to create incoming directory")?;
        Ok(Self { incoming_dir })
    }

    /// Received files are stored as `{peer_id}_{millis}_{basename}` so two
    /// transfers of the same file never collide.
    fn assign_name(&self, peer_id: &str, name: &str) -> String {
        let base = name.rsplit('/').next().unwrap_or(name);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("{peer_id}_{millis}_{base}")
    }
}

#[async_trait]
impl FileStore for LocalStore {
    async fn begin(&self, peer_id: &str, name: &str) -> Result<IncomingFile> {
        let final_path = self.incoming_dir.join(self.assign_name(peer_id, name));
        let part_path = final_path.with_extension(match final_path.extension() {
            Some(ext) => format!("{}.part", ext.to_string_lossy()),
            None => "part".to_string(),
        });

        let file = fs::File::create(&part_path)
            .await
            .with_context(|| format!("Failed to create {}", part_path.display()))?;

        tracing::debug!(path = %part_path.display(), "Staging incoming file");
        Ok(IncomingFile {
            file: Some(file),
            part_path,
            final_path,
            hasher: Sha256::new(),
            bytes_written: 0,
        })
    }
}

/// A file being received. Append chunks, then `finish` to promote or
/// `abort` to keep the explicit incomplete marker.
pub struct IncomingFile {
    file: Option<fs::File>,
    part_path: PathBuf,
    final_path: PathBuf,
    hasher: Sha256,
    bytes_written: u64,
}

impl IncomingFile {
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .context("incoming file already closed")?;
        file.write_all(data).await.context("writing chunk")?;
        self.hasher.update(data);
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Hex sha256 of everything appended so far.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    /// Flush and promote the `.part` file to its final name.
    pub async fn finish(mut self) -> Result<PathBuf> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        fs::rename(&self.part_path, &self.final_path)
            .await
            .with_context(|| format!("Failed to promote {}", self.part_path.display()))?;
        tracing::debug!(path = %self.final_path.display(), bytes = self.bytes_written,
            "Incoming file complete");
        Ok(self.final_path)
    }

    /// Close the file, leaving the `.part` marker on disk.
    pub async fn abort(mut self) -> PathBuf {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
        tracing::debug!(path = %self.part_path.display(), "Incoming file aborted");
        self.part_path
    }
}
