use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration.
///
/// Every timeout the engine uses lives here. The defaults are deployment
/// tunables, not protocol constants; source the real values from the
/// interoperating protocol's deployment profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for identity material and received files
    pub data_dir: PathBuf,

    /// Human-readable name advertised to peers
    pub device_name: String,

    /// Chunk size for file streaming (256 KiB)
    pub chunk_size: usize,

    /// Port to listen on for inbound sessions (0 = OS-assigned)
    pub listen_port: u16,

    /// mDNS service type
    pub service_type: String,

    /// Service discriminator carried in advertisements and certificates
    pub discriminator: u16,

    /// Preferred network interfaces, tried in order
    pub preferred_interfaces: Vec<String>,

    /// Peers unseen for longer than this are swept from the directory
    pub peer_stale_after: Duration,

    /// Interval between directory sweeps
    pub sweep_interval: Duration,

    /// Interval between readiness re-checks while discovering
    pub readiness_poll: Duration,

    /// TCP connect deadline for negotiation
    pub connect_timeout: Duration,

    /// Deadline for the whole certificate handshake
    pub handshake_timeout: Duration,

    /// Deadline for a single chunk write + acknowledgment
    pub chunk_timeout: Duration,

    /// Resend attempts per chunk before the session fails
    pub chunk_retries: u32,

    /// How long the receiver-side consent request may stay unanswered
    pub consent_timeout: Duration,

    /// Bounded drain delay for cooperative cancellation
    pub cancel_drain: Duration,

    /// Session certificate validity window
    pub certificate_lifetime: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".airlift"),
            device_name: "Airlift".to_string(),
            chunk_size: 256 * 1024,
            listen_port: 0,
            service_type: "_airlift._tcp.local.".to_string(),
            discriminator: 0x0a1f,
            preferred_interfaces: vec!["wlan1".to_string(), "wlan0".to_string()],
            peer_stale_after: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            readiness_poll: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            chunk_timeout: Duration::from_secs(10),
            chunk_retries: 3,
            consent_timeout: Duration::from_secs(60),
            cancel_drain: Duration::from_secs(2),
            certificate_lifetime: Duration::from_secs(10 * 60),
        }
    }
}

impl EngineConfig {
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = dir;
        self
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.key")
    }

    pub fn ensure_data_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}
