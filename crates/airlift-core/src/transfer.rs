//! Transfer coordination over an established secure channel.
//!
//! One coordinator instance exclusively owns a session's channel and
//! drives it to a terminal state:
//! `Negotiated → AwaitingConsent → Transferring → Completed`, with error
//! exits to `Failed` and cooperative `Cancelled` from any non-terminal
//! state. Chunk-level transport faults retry bounded; integrity faults
//! never retry.

use crate::error::TransferError;
use crate::session::{SessionId, SessionState, TransferPlan, TransferProgress};
use crate::wire::{ControlMessage, SecureChannel};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use storage::FileStore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

/// Transfer-relevant slice of the engine configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub chunk_timeout: Duration,
    pub chunk_retries: u32,
    pub consent_timeout: Duration,
    pub cancel_drain: Duration,
}

/// Events a coordinator reports while driving a session. The engine
/// forwards these to its subscribers tagged with the session id.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Progress(TransferProgress),
    /// Receiver side: the plan needs a consent decision from the caller.
    ConsentRequested { peer_id: String, plan: TransferPlan },
    Failed(TransferError),
}

/// Idempotent cancellation signal shared between the facade and the
/// coordinator task. Cancelling twice, or after a terminal state, is a
/// no-op and never affects other sessions.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        // send_replace stores the value even with no live receivers, so
        // a cancel issued before the session task first polls still
        // lands.
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves when cancellation is requested. A dropped handle counts as
/// cancellation so an orphaned coordinator never streams unattended.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

struct Reporter {
    session_id: SessionId,
    bytes_total: u64,
    bytes_sent: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Reporter {
    fn state(&self, state: SessionState) {
        let _ = self.events.send(SessionEvent::StateChanged(state));
    }

    fn failed(&self, error: TransferError) -> SessionState {
        let _ = self.events.send(SessionEvent::Failed(error));
        let _ = self
            .events
            .send(SessionEvent::StateChanged(SessionState::Failed));
        SessionState::Failed
    }

    /// bytes_sent only ever grows; retried chunks are counted once.
    fn advance(&mut self, bytes: u64, state: SessionState) {
        self.bytes_sent += bytes;
        let _ = self
            .events
            .send(SessionEvent::Progress(TransferProgress {
                session_id: self.session_id,
                bytes_sent: self.bytes_sent,
                bytes_total: self.bytes_total,
                state,
            }));
    }
}

/// Best-effort cooperative cancel: tell the peer within the drain
/// deadline, then land in `Cancelled`.
async fn drain_cancel<T>(
    channel: &SecureChannel,
    transport: &mut T,
    drain: Duration,
    reporter: &Reporter,
) -> SessionState
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let _ = tokio::time::timeout(drain, channel.send_message(transport, &ControlMessage::Cancel))
        .await;
    reporter.state(SessionState::Cancelled);
    SessionState::Cancelled
}

// ── Sender side ─────────────────────────────────────────────────────

/// Drive a sending session to a terminal state. The returned state is
/// also the last `StateChanged` event emitted.
pub async fn run_sender<T>(
    session_id: SessionId,
    mut transport: T,
    channel: SecureChannel,
    plan: TransferPlan,
    cfg: TransferConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut cancel: watch::Receiver<bool>,
) -> SessionState
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut reporter = Reporter {
        session_id,
        bytes_total: plan.bytes_total(),
        bytes_sent: 0,
        events,
    };
    reporter.state(SessionState::Negotiated);

    // Capability exchange: offer the plan, wait for consent.
    if channel
        .send_message(&mut transport, &ControlMessage::Offer { plan: plan.clone() })
        .await
        .is_err()
    {
        return reporter.failed(TransferError::ConnectionLost);
    }
    reporter.state(SessionState::AwaitingConsent);

    let verdict = tokio::select! {
        v = tokio::time::timeout(cfg.consent_timeout, channel.recv_message(&mut transport)) => v,
        _ = cancelled(&mut cancel) => {
            return drain_cancel(&channel, &mut transport, cfg.cancel_drain, &reporter).await;
        }
    };
    match verdict {
        Ok(Ok(ControlMessage::Verdict { accepted: true })) => {}
        Ok(Ok(ControlMessage::Verdict { accepted: false })) | Ok(Ok(ControlMessage::Cancel)) => {
            tracing::info!(session_id, "Peer declined the transfer");
            reporter.state(SessionState::Cancelled);
            return SessionState::Cancelled;
        }
        Ok(Ok(_)) | Ok(Err(_)) => return reporter.failed(TransferError::ConnectionLost),
        Err(_) => return reporter.failed(TransferError::Timeout),
    }

    reporter.state(SessionState::Transferring);

    for (index, file) in plan.files.iter().enumerate() {
        let index = index as u32;
        let Some(source) = file.source.as_ref() else {
            // A plan built from paths always carries sources; a missing
            // one means the caller handed us a deserialized plan.
            return reporter.failed(TransferError::IntegrityMismatch);
        };
        let mut reader = match tokio::fs::File::open(source).await {
            Ok(f) => f,
            Err(_) => return reporter.failed(TransferError::ConnectionLost),
        };

        if channel
            .send_message(&mut transport, &ControlMessage::FileBegin { index })
            .await
            .is_err()
        {
            return reporter.failed(TransferError::ConnectionLost);
        }

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; cfg.chunk_size];
        let mut seq: u64 = 0;
        loop {
            if *cancel.borrow() {
                return drain_cancel(&channel, &mut transport, cfg.cancel_drain, &reporter).await;
            }
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => return reporter.failed(TransferError::ConnectionLost),
            };
            hasher.update(&buf[..n]);

            let chunk = ControlMessage::Chunk {
                index,
                seq,
                data: buf[..n].to_vec(),
            };
            match stream_chunk(&channel, &mut transport, &chunk, index, seq, &cfg, &mut cancel)
                .await
            {
                ChunkOutcome::Acked => {
                    reporter.advance(n as u64, SessionState::Transferring);
                    seq += 1;
                }
                ChunkOutcome::Cancelled => {
                    return drain_cancel(&channel, &mut transport, cfg.cancel_drain, &reporter)
                        .await;
                }
                ChunkOutcome::PeerCancelled => {
                    reporter.state(SessionState::Cancelled);
                    return SessionState::Cancelled;
                }
                ChunkOutcome::Error(err) => return reporter.failed(err),
            }
        }

        let digest = hex::encode(hasher.finalize());
        if channel
            .send_message(&mut transport, &ControlMessage::FileDone { index, digest })
            .await
            .is_err()
        {
            return reporter.failed(TransferError::ConnectionLost);
        }
        match tokio::time::timeout(cfg.chunk_timeout, channel.recv_message(&mut transport)).await {
            Ok(Ok(ControlMessage::FileAck { ok: true, .. })) => {}
            Ok(Ok(ControlMessage::FileAck { ok: false, .. })) => {
                // Receiver rejected the file against the manifest and is
                // tearing the session down.
                return reporter.failed(TransferError::PeerCancelled);
            }
            Ok(Ok(ControlMessage::Cancel)) => {
                reporter.state(SessionState::Cancelled);
                return SessionState::Cancelled;
            }
            Ok(_) => return reporter.failed(TransferError::ConnectionLost),
            Err(_) => return reporter.failed(TransferError::Timeout),
        }
    }

    if channel
        .send_message(&mut transport, &ControlMessage::Complete)
        .await
        .is_err()
    {
        return reporter.failed(TransferError::ConnectionLost);
    }
    tracing::info!(session_id, bytes = reporter.bytes_sent, "Transfer complete");
    reporter.state(SessionState::Completed);
    SessionState::Completed
}

enum ChunkOutcome {
    Acked,
    Cancelled,
    PeerCancelled,
    Error(TransferError),
}

/// Send one chunk and wait for its ack, resending up to the bounded
/// retry budget on timeout.
async fn stream_chunk<T>(
    channel: &SecureChannel,
    transport: &mut T,
    chunk: &ControlMessage,
    index: u32,
    seq: u64,
    cfg: &TransferConfig,
    cancel: &mut watch::Receiver<bool>,
) -> ChunkOutcome
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut attempts = 0u32;
    loop {
        if channel.send_message(transport, chunk).await.is_err() {
            return ChunkOutcome::Error(TransferError::ConnectionLost);
        }

        let reply = tokio::select! {
            r = tokio::time::timeout(cfg.chunk_timeout, channel.recv_message(transport)) => r,
            _ = cancelled(cancel) => return ChunkOutcome::Cancelled,
        };
        match reply {
            Ok(Ok(ControlMessage::ChunkAck { index: i, seq: s })) if i == index && s == seq => {
                return ChunkOutcome::Acked;
            }
            Ok(Ok(ControlMessage::ChunkAck { .. })) => {
                // Stale ack from a retried chunk; keep waiting within the
                // same attempt budget.
                attempts += 1;
            }
            Ok(Ok(ControlMessage::Cancel)) => return ChunkOutcome::PeerCancelled,
            Ok(Ok(_)) | Ok(Err(_)) => return ChunkOutcome::Error(TransferError::ConnectionLost),
            Err(_) => attempts += 1,
        }
        if attempts > cfg.chunk_retries {
            return ChunkOutcome::Error(TransferError::Timeout);
        }
        tracing::debug!(index, seq, attempts, "Retrying chunk");
    }
}

// ── Receiver side ───────────────────────────────────────────────────

/// Drive a receiving session: surface the consent request, then accept
/// files into the store, verifying each against the agreed plan.
#[allow(clippy::too_many_arguments)]
pub async fn run_receiver<T, S>(
    session_id: SessionId,
    peer_id: String,
    mut transport: T,
    channel: SecureChannel,
    store: Arc<S>,
    cfg: TransferConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut cancel: watch::Receiver<bool>,
    consent: oneshot::Receiver<bool>,
) -> SessionState
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    S: FileStore + ?Sized,
{
    let mut reporter = Reporter {
        session_id,
        bytes_total: 0,
        bytes_sent: 0,
        events,
    };
    reporter.state(SessionState::Negotiated);

    let offer = tokio::select! {
        o = tokio::time::timeout(cfg.consent_timeout, channel.recv_message(&mut transport)) => o,
        _ = cancelled(&mut cancel) => {
            return drain_cancel(&channel, &mut transport, cfg.cancel_drain, &reporter).await;
        }
    };
    let plan = match offer {
        Ok(Ok(ControlMessage::Offer { plan })) => plan,
        Ok(Ok(ControlMessage::Cancel)) => {
            reporter.state(SessionState::Cancelled);
            return SessionState::Cancelled;
        }
        Ok(_) => return reporter.failed(TransferError::ConnectionLost),
        Err(_) => return reporter.failed(TransferError::Timeout),
    };
    reporter.bytes_total = plan.bytes_total();

    reporter.state(SessionState::AwaitingConsent);
    let _ = reporter
        .events
        .send(SessionEvent::ConsentRequested {
            peer_id: peer_id.clone(),
            plan: plan.clone(),
        });

    // The caller decides; an unanswered request times out as a decline.
    let accepted = tokio::select! {
        d = tokio::time::timeout(cfg.consent_timeout, consent) => d.ok().and_then(|r| r.ok()).unwrap_or(false),
        _ = cancelled(&mut cancel) => false,
    };
    if channel
        .send_message(&mut transport, &ControlMessage::Verdict { accepted })
        .await
        .is_err()
    {
        return reporter.failed(TransferError::ConnectionLost);
    }
    if !accepted {
        tracing::info!(session_id, "Transfer declined");
        reporter.state(SessionState::Cancelled);
        return SessionState::Cancelled;
    }

    reporter.state(SessionState::Transferring);

    let mut current: Option<(u32, storage::IncomingFile, u64)> = None;
    let mut completed_files = 0usize;

    // An idle-but-open connection must not pin the session forever:
    // allow the sender its full per-chunk retry budget, then fail.
    let stall_deadline = cfg.chunk_timeout * (cfg.chunk_retries + 1);

    loop {
        let msg = tokio::select! {
            m = tokio::time::timeout(stall_deadline, channel.recv_message(&mut transport)) => match m {
                Ok(m) => m,
                Err(_) => {
                    if let Some((_, incoming, _)) = current.take() {
                        incoming.abort().await;
                    }
                    tracing::warn!(session_id, "Peer went silent mid-transfer");
                    return reporter.failed(TransferError::Timeout);
                }
            },
            _ = cancelled(&mut cancel) => {
                if let Some((_, incoming, _)) = current.take() {
                    incoming.abort().await;
                }
                return drain_cancel(&channel, &mut transport, cfg.cancel_drain, &reporter).await;
            }
        };
        let msg = match msg {
            Ok(m) => m,
            Err(_) => {
                if let Some((_, incoming, _)) = current.take() {
                    incoming.abort().await;
                }
                return reporter.failed(TransferError::ConnectionLost);
            }
        };

        match msg {
            ControlMessage::FileBegin { index } => {
                let Some(descriptor) = plan.files.get(index as usize) else {
                    return reporter.failed(TransferError::IntegrityMismatch);
                };
                match store.begin(&peer_id, &descriptor.name).await {
                    Ok(incoming) => current = Some((index, incoming, 0)),
                    Err(_) => return reporter.failed(TransferError::ConnectionLost),
                }
            }
            ControlMessage::Chunk { index, seq, data } => {
                let Some((file_index, incoming, expected_seq)) = current.as_mut() else {
                    return reporter.failed(TransferError::IntegrityMismatch);
                };
                if index != *file_index {
                    return reporter.failed(TransferError::IntegrityMismatch);
                }
                if seq < *expected_seq {
                    // Duplicate of a chunk whose ack was lost; re-ack
                    // without appending.
                    let _ = channel
                        .send_message(&mut transport, &ControlMessage::ChunkAck { index, seq })
                        .await;
                    continue;
                }
                if seq > *expected_seq {
                    return reporter.failed(TransferError::IntegrityMismatch);
                }
                if incoming.append(&data).await.is_err() {
                    return reporter.failed(TransferError::ConnectionLost);
                }
                *expected_seq += 1;
                if channel
                    .send_message(&mut transport, &ControlMessage::ChunkAck { index, seq })
                    .await
                    .is_err()
                {
                    return reporter.failed(TransferError::ConnectionLost);
                }
                reporter.advance(data.len() as u64, SessionState::Transferring);
            }
            ControlMessage::FileDone { index, digest } => {
                let Some((file_index, incoming, _)) = current.take() else {
                    return reporter.failed(TransferError::IntegrityMismatch);
                };
                let descriptor = &plan.files[file_index as usize];
                let ok = index == file_index
                    && incoming.bytes_written() == descriptor.size
                    && incoming.digest_hex() == descriptor.digest
                    && digest == descriptor.digest;

                if !ok {
                    tracing::warn!(
                        session_id,
                        file = %descriptor.name,
                        declared = descriptor.size,
                        received = incoming.bytes_written(),
                        "Integrity mismatch"
                    );
                    incoming.abort().await;
                    let _ = channel
                        .send_message(&mut transport, &ControlMessage::FileAck { index, ok: false })
                        .await;
                    return reporter.failed(TransferError::IntegrityMismatch);
                }

                if incoming.finish().await.is_err() {
                    return reporter.failed(TransferError::ConnectionLost);
                }
                completed_files += 1;
                if channel
                    .send_message(&mut transport, &ControlMessage::FileAck { index, ok: true })
                    .await
                    .is_err()
                {
                    return reporter.failed(TransferError::ConnectionLost);
                }
            }
            ControlMessage::Complete => {
                if completed_files != plan.files.len() {
                    return reporter.failed(TransferError::IntegrityMismatch);
                }
                tracing::info!(session_id, files = completed_files, "Receive complete");
                reporter.state(SessionState::Completed);
                return SessionState::Completed;
            }
            ControlMessage::Cancel => {
                if let Some((_, incoming, _)) = current.take() {
                    incoming.abort().await;
                }
                tracing::info!(session_id, "Peer cancelled");
                reporter.state(SessionState::Cancelled);
                return SessionState::Cancelled;
            }
            _ => return reporter.failed(TransferError::ConnectionLost),
        }
    }
}
