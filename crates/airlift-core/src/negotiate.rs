//! Authenticated session negotiation.
//!
//! Both sides present a session certificate and an ephemeral X25519 key,
//! sign the ephemeral material with the certified session key, validate
//! the peer's certificate through the trust store, then derive a session
//! key via HKDF-SHA256 over the shared secret and both nonces. The
//! resulting XChaCha20-Poly1305 channel carries all later traffic.
//!
//! At most one negotiation per peer id is in flight: callers reserve a
//! slot first and a concurrent second attempt fails fast.

use crate::error::{NegotiationError, TrustError};
use crate::trust::{SessionCredentials, TrustStore, VerifiedPeerIdentity};
use crate::wire::{read_frame, write_frame, SecureChannel, PROTOCOL_MAGIC, PROTOCOL_VERSION};
use ed25519_dalek::{Signature, Signer, Verifier};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};

const NONCE_LEN: usize = 32;

#[derive(Serialize, Deserialize)]
struct HandshakeMessage {
    magic: [u8; 4],
    version: u16,
    certificate: Vec<u8>,
    eph_pub: [u8; 32],
    nonce: [u8; NONCE_LEN],
    /// Signature by the certified session key over eph_pub || nonce.
    signature: Vec<u8>,
}

/// Outcome of a successful handshake: who the peer is and the channel.
pub struct Negotiated {
    pub peer: VerifiedPeerIdentity,
    pub channel: SecureChannel,
}

/// Registry enforcing the one-negotiation-per-peer invariant.
#[derive(Clone, Default)]
pub struct SessionSlots {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl SessionSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the slot for `peer_id`, failing fast if one is held.
    /// The guard releases the slot on drop, whichever exit path runs.
    pub fn try_reserve(&self, peer_id: &str) -> Result<SlotGuard, NegotiationError> {
        let mut held = self.inner.lock().expect("session slots lock");
        if !held.insert(peer_id.to_string()) {
            return Err(NegotiationError::AlreadyNegotiating);
        }
        Ok(SlotGuard {
            peer_id: peer_id.to_string(),
            slots: self.inner.clone(),
        })
    }

    pub fn is_held(&self, peer_id: &str) -> bool {
        self.inner.lock().expect("session slots lock").contains(peer_id)
    }
}

pub struct SlotGuard {
    peer_id: String,
    slots: Arc<Mutex<HashSet<String>>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.slots.lock() {
            held.remove(&self.peer_id);
        }
    }
}

/// Connect to a peer's advertised endpoint within `timeout`.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, NegotiationError> {
    let addr: SocketAddr = addr.parse().map_err(|_| NegotiationError::Unreachable)?;
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Connect failed");
            Err(NegotiationError::Unreachable)
        }
        Err(_) => Err(NegotiationError::Unreachable),
    }
}

fn build_message(
    credentials: &SessionCredentials,
    eph_pub: &X25519Public,
    nonce: &[u8; NONCE_LEN],
) -> HandshakeMessage {
    let mut to_sign = Vec::with_capacity(32 + NONCE_LEN);
    to_sign.extend_from_slice(eph_pub.as_bytes());
    to_sign.extend_from_slice(nonce);
    let signature = credentials.session_key.sign(&to_sign);

    HandshakeMessage {
        magic: PROTOCOL_MAGIC,
        version: PROTOCOL_VERSION,
        certificate: credentials.certificate.to_bytes(),
        eph_pub: *eph_pub.as_bytes(),
        nonce: *nonce,
        signature: signature.to_bytes().to_vec(),
    }
}

/// Decode and authenticate the remote message. Protocol shape problems
/// are `ProtocolMismatch`; certificate problems are `TrustRejected` and
/// terminal for this session.
fn verify_message(
    bytes: &[u8],
    trust: &TrustStore,
) -> Result<(VerifiedPeerIdentity, [u8; 32], [u8; NONCE_LEN]), NegotiationError> {
    let msg: HandshakeMessage =
        bincode::deserialize(bytes).map_err(|_| NegotiationError::ProtocolMismatch)?;
    if msg.magic != PROTOCOL_MAGIC || msg.version != PROTOCOL_VERSION {
        return Err(NegotiationError::ProtocolMismatch);
    }

    let peer = trust.validate(&msg.certificate, trust.constraints_now())?;

    let sig_arr: [u8; 64] = msg
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| NegotiationError::TrustRejected(TrustError::Malformed))?;
    let mut signed = Vec::with_capacity(32 + NONCE_LEN);
    signed.extend_from_slice(&msg.eph_pub);
    signed.extend_from_slice(&msg.nonce);
    peer.session_pubkey
        .verify(&signed, &Signature::from_bytes(&sig_arr))
        .map_err(|_| NegotiationError::TrustRejected(TrustError::UntrustedChain))?;

    Ok((peer, msg.eph_pub, msg.nonce))
}

fn derive_channel(
    secret: EphemeralSecret,
    peer_eph: [u8; 32],
    initiator_nonce: &[u8; NONCE_LEN],
    responder_nonce: &[u8; NONCE_LEN],
) -> Result<SecureChannel, NegotiationError> {
    let shared = secret.diffie_hellman(&X25519Public::from(peer_eph));

    let info = [&initiator_nonce[..], &responder_nonce[..]].concat();
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(&info, &mut okm)
        .map_err(|_| NegotiationError::ProtocolMismatch)?;

    Ok(SecureChannel::new(okm))
}

/// Initiator side. Sends first, then verifies the responder.
pub async fn initiate<T>(
    transport: &mut T,
    credentials: &SessionCredentials,
    trust: &TrustStore,
) -> Result<Negotiated, NegotiationError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = X25519Public::from(&secret);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let msg = build_message(credentials, &eph_pub, &nonce);
    let encoded = bincode::serialize(&msg).map_err(|_| NegotiationError::ProtocolMismatch)?;
    write_frame(transport, &encoded)
        .await
        .map_err(|_| NegotiationError::Unreachable)?;

    let reply = read_frame(transport)
        .await
        .map_err(|_| NegotiationError::Unreachable)?;
    let (peer, peer_eph, peer_nonce) = verify_message(&reply, trust)?;

    let channel = derive_channel(secret, peer_eph, &nonce, &peer_nonce)?;
    tracing::debug!(peer = %peer.peer_id, "Handshake complete (initiator)");
    Ok(Negotiated { peer, channel })
}

/// Responder side. Verifies the initiator before revealing anything.
pub async fn respond<T>(
    transport: &mut T,
    credentials: &SessionCredentials,
    trust: &TrustStore,
) -> Result<Negotiated, NegotiationError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let first = read_frame(transport)
        .await
        .map_err(|_| NegotiationError::Unreachable)?;
    let (peer, peer_eph, peer_nonce) = verify_message(&first, trust)?;

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = X25519Public::from(&secret);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let msg = build_message(credentials, &eph_pub, &nonce);
    let encoded = bincode::serialize(&msg).map_err(|_| NegotiationError::ProtocolMismatch)?;
    write_frame(transport, &encoded)
        .await
        .map_err(|_| NegotiationError::Unreachable)?;

    let channel = derive_channel(secret, peer_eph, &peer_nonce, &nonce)?;
    tracing::debug!(peer = %peer.peer_id, "Handshake complete (responder)");
    Ok(Negotiated { peer, channel })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ControlMessage;
    use std::time::Duration;
    use tempfile::TempDir;

    fn trust_store(temp: &TempDir, name: &str, discriminator: u16) -> TrustStore {
        TrustStore::new(
            temp.path().join(format!("{name}.key")),
            Duration::from_secs(600),
            discriminator,
        )
    }

    #[tokio::test]
    async fn handshake_establishes_matching_channels() {
        let temp = TempDir::new().unwrap();
        let trust_a = trust_store(&temp, "a", 1);
        let trust_b = trust_store(&temp, "b", 1);
        let creds_a = trust_a.issue_session_certificate("b").unwrap();
        let creds_b = trust_b.issue_session_certificate("a").unwrap();

        let (mut side_a, mut side_b) = tokio::io::duplex(8192);
        let (res_a, res_b) = tokio::join!(
            initiate(&mut side_a, &creds_a, &trust_a),
            respond(&mut side_b, &creds_b, &trust_b),
        );
        let negotiated_a = res_a.unwrap();
        let negotiated_b = res_b.unwrap();

        assert_eq!(
            negotiated_a.peer.peer_id,
            trust_b.identity().unwrap().peer_id()
        );
        assert_eq!(
            negotiated_b.peer.peer_id,
            trust_a.identity().unwrap().peer_id()
        );

        // The derived channels interoperate.
        negotiated_a
            .channel
            .send_message(&mut side_a, &ControlMessage::Cancel)
            .await
            .unwrap();
        let got = negotiated_b.channel.recv_message(&mut side_b).await.unwrap();
        assert!(matches!(got, ControlMessage::Cancel));
    }

    #[tokio::test]
    async fn expired_certificate_is_trust_rejected() {
        let temp = TempDir::new().unwrap();
        let trust_a = trust_store(&temp, "a", 1);
        let trust_b = trust_store(&temp, "b", 1);
        let mut creds_a = trust_a.issue_session_certificate("b").unwrap();
        let creds_b = trust_b.issue_session_certificate("a").unwrap();

        // Re-issue the initiator certificate with a window in the past.
        let identity = trust_a.identity().unwrap();
        creds_a.certificate.not_before = 1000;
        creds_a.certificate.not_after = 2000;
        creds_a.certificate.signature = None;
        let unsigned = bincode::serialize(&creds_a.certificate).unwrap();
        creds_a.certificate.signature = Some(identity.sign(&unsigned).to_bytes().to_vec());

        let (mut side_a, mut side_b) = tokio::io::duplex(8192);
        // The initiator never gets a reply; park it in its own task.
        let initiator = tokio::spawn(async move {
            let _ = initiate(&mut side_a, &creds_a, &trust_a).await;
        });
        let res_b = respond(&mut side_b, &creds_b, &trust_b).await;
        initiator.abort();
        match res_b {
            Err(NegotiationError::TrustRejected(TrustError::Expired)) => {}
            other => panic!("expected Expired rejection, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn discriminator_mismatch_is_rejected() {
        let temp = TempDir::new().unwrap();
        let trust_a = trust_store(&temp, "a", 1);
        let trust_b = trust_store(&temp, "b", 2);
        let creds_a = trust_a.issue_session_certificate("b").unwrap();
        let creds_b = trust_b.issue_session_certificate("a").unwrap();

        let (mut side_a, mut side_b) = tokio::io::duplex(8192);
        let initiator = tokio::spawn(async move {
            let _ = initiate(&mut side_a, &creds_a, &trust_a).await;
        });
        let res_b = respond(&mut side_b, &creds_b, &trust_b).await;
        initiator.abort();
        match res_b {
            Err(NegotiationError::TrustRejected(TrustError::ConstraintMismatch)) => {}
            other => panic!("expected ConstraintMismatch, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn garbage_first_frame_is_protocol_mismatch() {
        let temp = TempDir::new().unwrap();
        let trust_b = trust_store(&temp, "b", 1);
        let creds_b = trust_b.issue_session_certificate("a").unwrap();

        let (mut side_a, mut side_b) = tokio::io::duplex(8192);
        write_frame(&mut side_a, b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let res = respond(&mut side_b, &creds_b, &trust_b).await;
        assert!(matches!(res, Err(NegotiationError::ProtocolMismatch)));
    }

    #[tokio::test]
    async fn slot_guard_enforces_single_negotiation() {
        let slots = SessionSlots::new();
        let guard = slots.try_reserve("peer-1").unwrap();
        assert!(matches!(
            slots.try_reserve("peer-1"),
            Err(NegotiationError::AlreadyNegotiating)
        ));
        // Different peers are independent.
        let _other = slots.try_reserve("peer-2").unwrap();

        drop(guard);
        assert!(slots.try_reserve("peer-1").is_ok());
    }

    #[tokio::test]
    async fn concurrent_reservations_admit_exactly_one() {
        let slots = SessionSlots::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let slots = slots.clone();
            handles.push(tokio::spawn(async move {
                match slots.try_reserve("same-peer") {
                    Ok(guard) => {
                        // Hold the slot long enough for the others to race.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        drop(guard);
                        true
                    }
                    Err(NegotiationError::AlreadyNegotiating) => false,
                    Err(other) => panic!("unexpected error: {other:?}"),
                }
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn connect_to_dead_endpoint_is_unreachable() {
        let res = connect("127.0.0.1:1", Duration::from_millis(500)).await;
        assert!(matches!(res, Err(NegotiationError::Unreachable)));
    }
}
