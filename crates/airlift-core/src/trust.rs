//! Identity and session-certificate trust rules.
//!
//! The device identity is a long-lived Ed25519 keypair, created once and
//! persisted. Each negotiation presents a short-lived session certificate:
//! an ephemeral session key signed by the identity key (issuer == root,
//! chain depth 1, as the external protocol mandates for self-issued
//! certificates). Certificates live only as long as the owning session.

use crate::error::{KeyGenerationError, TrustError};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

/// Long-lived Ed25519 device identity.
///
/// NOTE: production should use an OS keystore; this is the on-disk
/// representation the reference deployment uses.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new identity keypair and persist it to `path`.
    pub fn generate_and_store(path: &Path) -> Result<Self, KeyGenerationError> {
        let signing_key = SigningKey::generate(&mut OsRng);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| KeyGenerationError(e.to_string()))?;
        }
        fs::write(path, signing_key.to_bytes())
            .map_err(|e| KeyGenerationError(format!("writing identity file: {e}")))?;
        tracing::info!("Generated new identity at {:?}", path);
        Ok(Self { signing_key })
    }

    /// Load an identity from `path`. The file stores the 32-byte secret.
    pub fn load(path: &Path) -> Result<Self, KeyGenerationError> {
        let data = Zeroizing::new(
            fs::read(path).map_err(|e| KeyGenerationError(format!("reading identity file: {e}")))?,
        );
        if data.len() != 32 {
            return Err(KeyGenerationError(format!(
                "invalid key file length: expected 32 bytes, got {}",
                data.len()
            )));
        }
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&data);
        let signing_key = SigningKey::from_bytes(&key_bytes);
        tracing::info!("Loaded identity from {:?}", path);
        Ok(Self { signing_key })
    }

    pub fn load_or_generate(path: &Path) -> Result<Self, KeyGenerationError> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::generate_and_store(path)
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// 8-byte identity fingerprint: the leading bytes of the pubkey hash.
    /// Doubles as the peer id (hex) and the advertisement fingerprint.
    pub fn fingerprint(&self) -> [u8; 8] {
        fingerprint_of(&self.public_key_bytes())
    }

    pub fn peer_id(&self) -> String {
        hex::encode(self.fingerprint())
    }

    /// Full fingerprint for out-of-band verification.
    pub fn full_fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.public_key_bytes()))
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }
}

pub fn fingerprint_of(pubkey: &[u8; 32]) -> [u8; 8] {
    let digest = Sha256::digest(pubkey);
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// A short-lived certificate presented during negotiation. The signature
/// covers the certificate with `signature` set to `None`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionCertificate {
    /// Ephemeral session verifying key, authorized to sign the handshake.
    pub session_pubkey: [u8; 32],
    /// Long-lived identity key that issued this certificate.
    pub issuer_pubkey: [u8; 32],
    /// Hex fingerprint of the issuer; the device's peer id.
    pub subject_id: String,
    /// Peer this certificate was minted for.
    pub peer_hint: String,
    /// Validity window, seconds since the Unix epoch.
    pub not_before: u64,
    pub not_after: u64,
    /// Service discriminator extension; must match the protocol profile.
    pub discriminator: u16,
    pub signature: Option<Vec<u8>>,
}

impl SessionCertificate {
    pub fn to_bytes(&self) -> Vec<u8> {
        // bincode of a bounded struct cannot fail
        bincode::serialize(self).expect("certificate serialization")
    }
}

/// The session certificate plus the ephemeral key it authorizes. Handed
/// to the negotiator; never persisted.
pub struct SessionCredentials {
    pub certificate: SessionCertificate,
    pub session_key: SigningKey,
}

/// Outcome of a successful validation.
#[derive(Debug, Clone)]
pub struct VerifiedPeerIdentity {
    pub peer_id: String,
    pub session_pubkey: VerifyingKey,
}

/// Protocol-mandated validation inputs.
#[derive(Debug, Clone, Copy)]
pub struct CertificateConstraints {
    pub discriminator: u16,
    /// Seconds since the Unix epoch at the moment of the check.
    pub now: u64,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Owns the device identity and mints/validates session certificates.
/// Identity reads are cheap clones; safe for concurrent use.
pub struct TrustStore {
    identity_path: PathBuf,
    certificate_lifetime: Duration,
    discriminator: u16,
    identity: Mutex<Option<Identity>>,
}

impl TrustStore {
    pub fn new(identity_path: PathBuf, certificate_lifetime: Duration, discriminator: u16) -> Self {
        Self {
            identity_path,
            certificate_lifetime,
            discriminator,
            identity: Mutex::new(None),
        }
    }

    /// Lazily creates the device identity on first use; idempotent after.
    pub fn identity(&self) -> Result<Identity, KeyGenerationError> {
        let mut guard = self
            .identity
            .lock()
            .map_err(|_| KeyGenerationError("identity lock poisoned".into()))?;
        if let Some(identity) = guard.as_ref() {
            return Ok(identity.clone());
        }
        let identity = Identity::load_or_generate(&self.identity_path)?;
        *guard = Some(identity.clone());
        Ok(identity)
    }

    /// Mint a fresh session certificate for a negotiation with `peer_id`.
    pub fn issue_session_certificate(
        &self,
        peer_id: &str,
    ) -> Result<SessionCredentials, KeyGenerationError> {
        let identity = self.identity()?;
        let session_key = SigningKey::generate(&mut OsRng);
        let now = unix_now();

        let mut certificate = SessionCertificate {
            session_pubkey: session_key.verifying_key().to_bytes(),
            issuer_pubkey: identity.public_key_bytes(),
            subject_id: identity.peer_id(),
            peer_hint: peer_id.to_string(),
            not_before: now,
            not_after: now + self.certificate_lifetime.as_secs(),
            discriminator: self.discriminator,
            signature: None,
        };

        let unsigned = bincode::serialize(&certificate)
            .map_err(|e| KeyGenerationError(format!("certificate encoding: {e}")))?;
        certificate.signature = Some(identity.sign(&unsigned).to_bytes().to_vec());

        Ok(SessionCredentials {
            certificate,
            session_key,
        })
    }

    pub fn constraints_now(&self) -> CertificateConstraints {
        CertificateConstraints {
            discriminator: self.discriminator,
            now: unix_now(),
        }
    }

    /// Validate a remote certificate against the protocol trust rules.
    ///
    /// Check order: decode, chain shape and signature, validity window,
    /// required extensions. An expired certificate reports `Expired` even
    /// when its chain is otherwise valid.
    pub fn validate(
        &self,
        cert_bytes: &[u8],
        constraints: CertificateConstraints,
    ) -> Result<VerifiedPeerIdentity, TrustError> {
        let cert: SessionCertificate =
            bincode::deserialize(cert_bytes).map_err(|_| TrustError::Malformed)?;

        let sig_bytes = cert.signature.as_ref().ok_or(TrustError::Malformed)?;
        if sig_bytes.len() != 64 {
            return Err(TrustError::Malformed);
        }
        let mut sig_arr = [0u8; 64];
        sig_arr.copy_from_slice(sig_bytes);
        let signature = Signature::from_bytes(&sig_arr);

        // Chain shape: self-issued, depth 1. The subject id must be the
        // fingerprint of the issuer key, and the signature must verify
        // under that key.
        if cert.subject_id != hex::encode(fingerprint_of(&cert.issuer_pubkey)) {
            return Err(TrustError::UntrustedChain);
        }
        let issuer =
            VerifyingKey::from_bytes(&cert.issuer_pubkey).map_err(|_| TrustError::Malformed)?;
        let mut unsigned = cert.clone();
        unsigned.signature = None;
        let unsigned_bytes =
            bincode::serialize(&unsigned).map_err(|_| TrustError::Malformed)?;
        issuer
            .verify(&unsigned_bytes, &signature)
            .map_err(|_| TrustError::UntrustedChain)?;

        if constraints.now < cert.not_before || constraints.now > cert.not_after {
            return Err(TrustError::Expired);
        }

        if cert.discriminator != constraints.discriminator {
            return Err(TrustError::ConstraintMismatch);
        }

        let session_pubkey =
            VerifyingKey::from_bytes(&cert.session_pubkey).map_err(|_| TrustError::Malformed)?;

        Ok(VerifiedPeerIdentity {
            peer_id: cert.subject_id,
            session_pubkey,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> TrustStore {
        TrustStore::new(
            temp.path().join("identity.key"),
            Duration::from_secs(600),
            0x0a1f,
        )
    }

    #[test]
    fn identity_is_created_once_and_reloaded() {
        let temp = TempDir::new().unwrap();
        let ts = store(&temp);

        let first = ts.identity().unwrap();
        let second = ts.identity().unwrap();
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());

        // A fresh store over the same path loads the same key.
        let reloaded = store(&temp).identity().unwrap();
        assert_eq!(first.public_key_bytes(), reloaded.public_key_bytes());
    }

    #[test]
    fn issued_certificate_validates() {
        let temp = TempDir::new().unwrap();
        let ts = store(&temp);

        let creds = ts.issue_session_certificate("peer-1").unwrap();
        let verified = ts
            .validate(&creds.certificate.to_bytes(), ts.constraints_now())
            .unwrap();
        assert_eq!(verified.peer_id, ts.identity().unwrap().peer_id());
    }

    #[test]
    fn expired_is_rejected_even_with_valid_chain() {
        let temp = TempDir::new().unwrap();
        let ts = store(&temp);

        let creds = ts.issue_session_certificate("peer-1").unwrap();
        let constraints = CertificateConstraints {
            discriminator: 0x0a1f,
            now: creds.certificate.not_after + 1,
        };
        let err = ts
            .validate(&creds.certificate.to_bytes(), constraints)
            .unwrap_err();
        assert_eq!(err, TrustError::Expired);
    }

    #[test]
    fn not_yet_valid_is_rejected() {
        let temp = TempDir::new().unwrap();
        let ts = store(&temp);

        let creds = ts.issue_session_certificate("peer-1").unwrap();
        let constraints = CertificateConstraints {
            discriminator: 0x0a1f,
            now: creds.certificate.not_before.saturating_sub(10),
        };
        let err = ts
            .validate(&creds.certificate.to_bytes(), constraints)
            .unwrap_err();
        assert_eq!(err, TrustError::Expired);
    }

    #[test]
    fn tampered_certificate_fails_chain_check() {
        let temp = TempDir::new().unwrap();
        let ts = store(&temp);

        let mut creds = ts.issue_session_certificate("peer-1").unwrap();
        creds.certificate.not_after += 1000; // invalidates the signature
        let err = ts
            .validate(&creds.certificate.to_bytes(), ts.constraints_now())
            .unwrap_err();
        assert_eq!(err, TrustError::UntrustedChain);
    }

    #[test]
    fn subject_must_be_issuer_fingerprint() {
        let temp = TempDir::new().unwrap();
        let ts = store(&temp);

        let mut creds = ts.issue_session_certificate("peer-1").unwrap();
        creds.certificate.subject_id = "deadbeefdeadbeef".to_string();
        let err = ts
            .validate(&creds.certificate.to_bytes(), ts.constraints_now())
            .unwrap_err();
        assert_eq!(err, TrustError::UntrustedChain);
    }

    #[test]
    fn wrong_discriminator_is_constraint_mismatch() {
        let temp = TempDir::new().unwrap();
        let ts = store(&temp);

        let creds = ts.issue_session_certificate("peer-1").unwrap();
        let constraints = CertificateConstraints {
            discriminator: 0xffff,
            now: unix_now(),
        };
        let err = ts
            .validate(&creds.certificate.to_bytes(), constraints)
            .unwrap_err();
        assert_eq!(err, TrustError::ConstraintMismatch);
    }

    #[test]
    fn garbage_bytes_are_malformed() {
        let temp = TempDir::new().unwrap();
        let ts = store(&temp);
        let err = ts
            .validate(b"not a certificate", ts.constraints_now())
            .unwrap_err();
        assert_eq!(err, TrustError::Malformed);
    }
}
