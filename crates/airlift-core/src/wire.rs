//! Fixed wire contract: frame layout, protocol identifiers, and the
//! encrypted channel used after negotiation.
//!
//! The constants here reproduce the external protocol byte-for-byte;
//! change nothing or interop with unmodified peers breaks. Frames are
//! u32 big-endian length-prefixed; encrypted frames carry a 24-byte
//! XChaCha20-Poly1305 nonce followed by the ciphertext.

use crate::session::TransferPlan;
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_MAGIC: [u8; 4] = *b"ALFT";
pub const PROTOCOL_VERSION: u16 = 1;

/// Upper bound on any single frame, preventing memory exhaustion.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

const NONCE_LEN: usize = 24;

/// Write a length-prefixed plaintext frame (u32 BE length).
pub async fn write_frame<T: AsyncWrite + Unpin + Send>(
    transport: &mut T,
    data: &[u8],
) -> std::io::Result<()> {
    transport.write_all(&(data.len() as u32).to_be_bytes()).await?;
    transport.write_all(data).await?;
    transport.flush().await?;
    Ok(())
}

/// Read a length-prefixed plaintext frame.
pub async fn read_frame<T: AsyncRead + Unpin + Send>(
    transport: &mut T,
) -> std::io::Result<Vec<u8>> {
    let mut lenb = [0u8; 4];
    transport.read_exact(&mut lenb).await?;
    let len = u32::from_be_bytes(lenb) as usize;

    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }

    let mut buf = vec![0u8; len];
    transport.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Control-plane messages exchanged over the encrypted channel.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ControlMessage {
    /// Capability/manifest exchange: the sender's proposed plan.
    Offer { plan: TransferPlan },
    /// Receiver's consent decision.
    Verdict { accepted: bool },
    /// Start of file `index` within the agreed plan.
    FileBegin { index: u32 },
    /// One payload chunk. `seq` is per-file and strictly increasing.
    Chunk { index: u32, seq: u64, data: Vec<u8> },
    /// Receiver acknowledgment of a chunk.
    ChunkAck { index: u32, seq: u64 },
    /// End of file `index`; digest is the sender's sha256 over the file.
    FileDone { index: u32, digest: String },
    /// Receiver verdict on a finished file. `ok: false` means the
    /// received bytes did not match the manifest; fatal to the session.
    FileAck { index: u32, ok: bool },
    /// Whole plan transferred.
    Complete,
    /// Cooperative cancellation from either side.
    Cancel,
}

/// AEAD-protected channel over any byte stream.
///
/// Exclusively owned by one coordinator at a time; the nonce is random
/// per frame, so no counter state is shared.
pub struct SecureChannel {
    aead: XChaCha20Poly1305,
}

impl SecureChannel {
    pub fn new(session_key: [u8; 32]) -> Self {
        Self {
            aead: XChaCha20Poly1305::new(&session_key.into()),
        }
    }

    /// Encrypt and send one frame: nonce || ciphertext, length-prefixed.
    pub async fn send<T: AsyncWrite + Unpin + Send>(
        &self,
        transport: &mut T,
        plaintext: &[u8],
    ) -> std::io::Result<()> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from(nonce_bytes);

        let mut buf = plaintext.to_vec();
        self.aead
            .encrypt_in_place(&nonce, b"", &mut buf)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "aead encrypt failed"))?;

        let mut frame = Vec::with_capacity(NONCE_LEN + buf.len());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&buf);
        write_frame(transport, &frame).await
    }

    /// Read one frame and return the plaintext.
    pub async fn recv<T: AsyncRead + Unpin + Send>(
        &self,
        transport: &mut T,
    ) -> std::io::Result<Vec<u8>> {
        let frame = read_frame(transport).await?;
        if frame.len() < NONCE_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame too small",
            ));
        }

        let nonce_bytes: [u8; NONCE_LEN] = frame[..NONCE_LEN].try_into().expect("nonce slice");
        let nonce = XNonce::from(nonce_bytes);
        let mut cipher = frame[NONCE_LEN..].to_vec();

        self.aead
            .decrypt_in_place(&nonce, b"", &mut cipher)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "aead decrypt failed"))?;

        Ok(cipher)
    }

    /// Send a control message as a bincode-encoded encrypted frame.
    pub async fn send_message<T: AsyncWrite + Unpin + Send>(
        &self,
        transport: &mut T,
        message: &ControlMessage,
    ) -> std::io::Result<()> {
        let bytes = bincode::serialize(message)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.send(transport, &bytes).await
    }

    /// Receive and decode the next control message.
    pub async fn recv_message<T: AsyncRead + Unpin + Send>(
        &self,
        transport: &mut T,
    ) -> std::io::Result<ControlMessage> {
        let bytes = self.recv(transport).await?;
        bincode::deserialize(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
