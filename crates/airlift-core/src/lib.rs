//! Airlift Core - local peer-to-peer file sharing engine
//!
//! Turns radio/network presence into validated peers and streams file
//! payloads over an encrypted, consent-gated channel. The presentation
//! layer consumes state snapshots and events; no protocol bytes cross
//! that boundary.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod negotiate;
pub mod peers;
pub mod readiness;
pub mod session;
pub mod transfer;
pub mod trust;
pub mod wire;

// Re-export commonly used types
pub use config::EngineConfig;
pub use discovery::{DiscoveryEvent, PassiveRadio, RadioTransport, RawAdvertisement};
pub use engine::{Engine, EngineEvent};
pub use error::{DiscoveryError, KeyGenerationError, NegotiationError, TransferError, TrustError};
pub use peers::{Peer, Reachability};
pub use readiness::{FixedProbe, InterfaceProbe, ReadinessState, TransportProbe};
pub use session::{SessionId, SessionState, TransferPlan, TransferProgress};
pub use trust::{Identity, TrustStore};
