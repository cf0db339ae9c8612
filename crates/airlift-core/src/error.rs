use thiserror::Error;

/// Underlying cryptographic primitives or key persistence unavailable.
/// Fatal to `Engine::create`: an engine that cannot mint an identity
/// never reports `Ready`.
#[derive(Error, Debug)]
#[error("key generation failed: {0}")]
pub struct KeyGenerationError(pub String);

/// Certificate validation failures. Terminal for the session being
/// negotiated, never downgraded or retried.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TrustError {
    #[error("certificate is malformed")]
    Malformed,
    #[error("certificate validity window has expired or not yet begun")]
    Expired,
    #[error("certificate chain is not rooted in the claimed issuer")]
    UntrustedChain,
    #[error("certificate constraints do not match the protocol profile")]
    ConstraintMismatch,
}

/// Failures establishing a secure session with a peer.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("peer endpoint is unreachable")]
    Unreachable,
    #[error("handshake did not complete within the deadline")]
    HandshakeTimeout,
    #[error("peer certificate rejected: {0}")]
    TrustRejected(#[from] TrustError),
    #[error("peer speaks a different protocol or version")]
    ProtocolMismatch,
    #[error("a negotiation for this peer is already in flight")]
    AlreadyNegotiating,
}

/// Failures during an established transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("connection to peer lost")]
    ConnectionLost,
    #[error("peer cancelled the transfer")]
    PeerCancelled,
    #[error("received payload does not match the declared manifest")]
    IntegrityMismatch,
    #[error("transfer timed out")]
    Timeout,
}

/// Announce/browse plumbing failures.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("advertising failed: {0}")]
    Advertise(String),
    #[error("scanning failed: {0}")]
    Scan(String),
    #[error("transports not ready")]
    NotReady,
}
