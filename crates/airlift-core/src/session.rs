//! Session and transfer-plan data model.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub type SessionId = u64;

/// Per-session state machine. `Failed` and `Cancelled` and `Completed`
/// are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Negotiated,
    AwaitingConsent,
    Transferring,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }
}

/// One file in the agreed plan. The local source path never crosses the
/// wire; receivers only see name, size, and digest.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    /// Hex sha256 over the whole file.
    pub digest: String,
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Ordered file descriptors agreed during capability exchange.
/// Immutable once consent is granted.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransferPlan {
    pub files: Vec<FileDescriptor>,
}

impl TransferPlan {
    /// Build a plan from local files, hashing each in full.
    pub fn from_paths(paths: &[PathBuf]) -> anyhow::Result<Self> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(FileDescriptor::from_path(path)?);
        }
        Ok(Self { files })
    }

    pub fn bytes_total(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

impl FileDescriptor {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let data = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            name,
            size: data.len() as u64,
            digest: hex::encode(Sha256::digest(&data)),
            source: Some(path.to_path_buf()),
        })
    }
}

/// Progress snapshot published after each acknowledged chunk.
/// `bytes_sent` is monotonically non-decreasing for a given session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub session_id: SessionId,
    pub bytes_sent: u64,
    pub bytes_total: u64,
    pub state: SessionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_totals_and_digests_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"aaaa").unwrap();
        std::fs::write(&b, vec![0u8; 1000]).unwrap();

        let plan = TransferPlan::from_paths(&[a, b]).unwrap();
        assert_eq!(plan.bytes_total(), 1004);
        assert_eq!(plan.files[0].name, "a.txt");
        assert_eq!(
            plan.files[0].digest,
            hex::encode(Sha256::digest(b"aaaa"))
        );
    }

    #[test]
    fn source_path_does_not_cross_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, b"data").unwrap();

        let plan = TransferPlan::from_paths(&[a]).unwrap();
        let bytes = bincode::serialize(&plan).unwrap();
        let decoded: TransferPlan = bincode::deserialize(&bytes).unwrap();
        assert!(decoded.files[0].source.is_none());
        assert_eq!(decoded.files[0].size, 4);
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Transferring.is_terminal());
        assert!(!SessionState::AwaitingConsent.is_terminal());
        assert!(!SessionState::Negotiated.is_terminal());
    }
}
