//! The engine facade.
//!
//! One handle owns every moving part: readiness probes, discovery,
//! trust, the peer directory, and the per-session coordinator tasks.
//! Callers drive it through methods and observe it through a broadcast
//! event stream; no protocol bytes cross that boundary in either
//! direction.

use crate::config::EngineConfig;
use crate::discovery::{DiscoveryEvent, DiscoveryService, RadioTransport};
use crate::error::{DiscoveryError, NegotiationError, TransferError};
use crate::negotiate::{self, SessionSlots};
use crate::peers::{Peer, PeerDirectory};
use crate::readiness::{InterfaceProbe, ReadinessMonitor, ReadinessState, TransportProbe};
use crate::session::{SessionId, SessionState, TransferPlan, TransferProgress};
use crate::transfer::{self, CancelHandle, SessionEvent, TransferConfig};
use crate::trust::TrustStore;
use discovery_core::advert::FINGERPRINT_LEN;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use storage::LocalStore;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Everything the engine reports to its subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ReadinessChanged(ReadinessState),
    PeerListChanged,
    DiscoveryStopped,
    SessionStateChanged {
        session_id: SessionId,
        state: SessionState,
    },
    Progress(TransferProgress),
    /// An inbound plan needs [`Engine::respond_to_consent`].
    ConsentRequested {
        session_id: SessionId,
        peer_id: String,
        plan: TransferPlan,
    },
    SessionFailed {
        session_id: SessionId,
        error: TransferError,
    },
    /// The session never reached `Negotiated`.
    NegotiationFailed {
        session_id: SessionId,
        message: String,
    },
}

struct SessionEntry {
    peer_id: String,
    cancel: CancelHandle,
    /// Present only on receiving sessions that still await a verdict.
    consent: Option<oneshot::Sender<bool>>,
    progress: watch::Receiver<TransferProgress>,
}

struct Receiving {
    port: u16,
    shutdown: watch::Sender<bool>,
}

struct Inner {
    config: EngineConfig,
    trust: Arc<TrustStore>,
    local_peer_id: String,
    fingerprint: [u8; FINGERPRINT_LEN],
    readiness: Arc<ReadinessMonitor>,
    discovery: DiscoveryService,
    directory: PeerDirectory,
    store: Arc<LocalStore>,
    slots: SessionSlots,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    next_session_id: AtomicU64,
    events: broadcast::Sender<EngineEvent>,
    receiving: Mutex<Option<Receiving>>,
    destroyed: AtomicBool,
}

/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Build an engine from its configuration and transport bridges.
    ///
    /// Loads or mints the device identity immediately: an engine that
    /// cannot establish its identity is never constructed, so it can
    /// never report `Ready`.
    pub fn create(
        config: EngineConfig,
        radio: Arc<dyn RadioTransport>,
        radio_probe: Arc<dyn TransportProbe>,
    ) -> anyhow::Result<Self> {
        config.ensure_data_dir()?;

        let trust = Arc::new(TrustStore::new(
            config.identity_path(),
            config.certificate_lifetime,
            config.discriminator,
        ));
        let identity = trust.identity()?;
        let local_peer_id = identity.peer_id();
        let fingerprint = identity.fingerprint();

        let store = Arc::new(LocalStore::new(config.data_dir.clone())?);
        let readiness = Arc::new(ReadinessMonitor::new(
            radio_probe,
            Arc::new(InterfaceProbe::new(config.preferred_interfaces.clone())),
        ));
        let directory = PeerDirectory::new();
        let discovery =
            DiscoveryService::new(&config, readiness.clone(), radio, directory.clone());
        let (events, _) = broadcast::channel(128);

        tracing::info!(peer = %local_peer_id, name = %config.device_name, "Engine created");
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                trust,
                local_peer_id,
                fingerprint,
                readiness,
                discovery,
                directory,
                store,
                slots: SessionSlots::new(),
                sessions: Mutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
                events,
                receiving: Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Identity fingerprint in short hex form, as peers see it.
    pub fn peer_id(&self) -> &str {
        &self.inner.local_peer_id
    }

    /// Fresh readiness snapshot; never cached.
    pub fn readiness(&self) -> ReadinessState {
        self.inner.readiness.query()
    }

    /// Currently visible peers, most recently seen first.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.directory.snapshot()
    }

    /// Start advertising and scanning. The advertised endpoint is the
    /// receiving listener when one is up, else the configured port.
    pub fn start_discovery(&self) -> Result<(), DiscoveryError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(DiscoveryError::NotReady);
        }
        let port = self
            .inner
            .receiving
            .lock()
            .expect("receiving lock")
            .as_ref()
            .map(|r| r.port)
            .unwrap_or(self.inner.config.listen_port);

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.discovery.start(self.inner.fingerprint, port, tx)?;
        spawn_discovery_forwarder(rx, self.inner.events.clone());
        Ok(())
    }

    pub fn stop_discovery(&self) {
        self.inner.discovery.stop();
    }

    pub fn is_discovering(&self) -> bool {
        self.inner.discovery.is_running()
    }

    /// Begin an outbound session toward a visible peer. Returns as soon
    /// as the session task is queued; negotiation progress and failures
    /// arrive as events. Fails fast when the peer is unknown, has no
    /// endpoint, or already has a session in flight.
    pub fn start_session(
        &self,
        peer_id: &str,
        plan: TransferPlan,
    ) -> Result<SessionId, NegotiationError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Unreachable);
        }
        let peer = self
            .inner
            .directory
            .get(peer_id)
            .ok_or(NegotiationError::Unreachable)?;
        let addr = peer
            .discovery_address
            .ok_or(NegotiationError::Unreachable)?;
        let slot = self.inner.slots.try_reserve(peer_id)?;

        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancelHandle::new();
        let (progress_tx, progress_rx) = watch::channel(TransferProgress {
            session_id,
            bytes_sent: 0,
            bytes_total: plan.bytes_total(),
            state: SessionState::Negotiated,
        });
        self.inner.sessions.lock().expect("sessions lock").insert(
            session_id,
            SessionEntry {
                peer_id: peer_id.to_string(),
                cancel: cancel.clone(),
                consent: None,
                progress: progress_rx,
            },
        );

        tracing::info!(session_id, peer = %peer_id, %addr, "Starting outbound session");
        tokio::spawn(run_outbound(
            self.inner.clone(),
            session_id,
            peer_id.to_string(),
            addr,
            plan,
            cancel,
            progress_tx,
            slot,
        ));
        Ok(session_id)
    }

    /// Answer a pending consent request. Returns false when the session
    /// is unknown or no longer waiting.
    pub fn respond_to_consent(&self, session_id: SessionId, accept: bool) -> bool {
        let mut sessions = self.inner.sessions.lock().expect("sessions lock");
        match sessions.get_mut(&session_id).and_then(|e| e.consent.take()) {
            Some(tx) => tx.send(accept).is_ok(),
            None => {
                tracing::debug!(session_id, "No pending consent");
                false
            }
        }
    }

    /// Request cancellation of one session. Idempotent; unknown or
    /// already-terminal sessions are a no-op, other sessions unaffected.
    pub fn cancel(&self, session_id: SessionId) {
        let sessions = self.inner.sessions.lock().expect("sessions lock");
        match sessions.get(&session_id) {
            Some(entry) => entry.cancel.cancel(),
            None => tracing::debug!(session_id, "Cancel for unknown session"),
        }
    }

    /// Watch the latest progress of a live session.
    pub fn progress(&self, session_id: SessionId) -> Option<watch::Receiver<TransferProgress>> {
        self.inner
            .sessions
            .lock()
            .expect("sessions lock")
            .get(&session_id)
            .map(|e| e.progress.clone())
    }

    /// Listen for inbound sessions. Returns the bound port; idempotent
    /// while already listening.
    pub async fn start_receiving(&self) -> anyhow::Result<u16> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            anyhow::bail!("engine destroyed");
        }
        if let Some(r) = self.inner.receiving.lock().expect("receiving lock").as_ref() {
            return Ok(r.port);
        }
        let listener =
            TcpListener::bind(("0.0.0.0", self.inner.config.listen_port)).await?;
        let port = listener.local_addr()?.port();

        let mut guard = self.inner.receiving.lock().expect("receiving lock");
        if let Some(r) = guard.as_ref() {
            return Ok(r.port);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(self.inner.clone(), listener, shutdown_rx));
        *guard = Some(Receiving {
            port,
            shutdown: shutdown_tx,
        });
        tracing::info!(port, "Receiving started");
        Ok(port)
    }

    pub fn stop_receiving(&self) {
        let taken = self.inner.receiving.lock().expect("receiving lock").take();
        if let Some(receiving) = taken {
            let _ = receiving.shutdown.send(true);
            tracing::info!("Receiving stopped");
        }
    }

    /// Tear the engine down: stop discovery and the listener, cancel
    /// every live session. Idempotent; the handle stays safe to call but
    /// refuses new work afterwards.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.discovery.stop();
        self.stop_receiving();
        let sessions = self.inner.sessions.lock().expect("sessions lock");
        for (session_id, entry) in sessions.iter() {
            tracing::debug!(session_id, peer = %entry.peer_id, "Cancelling session");
            entry.cancel.cancel();
        }
        tracing::info!(live_sessions = sessions.len(), "Engine destroyed");
    }
}

fn transfer_config(config: &EngineConfig) -> TransferConfig {
    TransferConfig {
        chunk_size: config.chunk_size,
        chunk_timeout: config.chunk_timeout,
        chunk_retries: config.chunk_retries,
        consent_timeout: config.consent_timeout,
        cancel_drain: config.cancel_drain,
    }
}

/// Connect, handshake, and stream one outbound plan; the slot guard is
/// held for the whole session so a second attempt fails fast until this
/// one reaches a terminal state.
#[allow(clippy::too_many_arguments)]
async fn run_outbound(
    inner: Arc<Inner>,
    session_id: SessionId,
    peer_id: String,
    addr: String,
    plan: TransferPlan,
    cancel: CancelHandle,
    progress: watch::Sender<TransferProgress>,
    slot: negotiate::SlotGuard,
) {
    let _slot = slot;
    let mut cancel_rx = cancel.subscribe();

    let negotiation = async {
        let credentials = inner
            .trust
            .issue_session_certificate(&peer_id)
            .map_err(|e| anyhow::anyhow!(e))?;
        let mut stream =
            negotiate::connect(&addr, inner.config.connect_timeout).await?;
        let negotiated = tokio::time::timeout(
            inner.config.handshake_timeout,
            negotiate::initiate(&mut stream, &credentials, &inner.trust),
        )
        .await
        .map_err(|_| NegotiationError::HandshakeTimeout)??;
        anyhow::Ok((stream, negotiated))
    };

    let outcome = tokio::select! {
        _ = transfer::cancelled(&mut cancel_rx) => None,
        result = negotiation => Some(result),
    };

    match outcome {
        None => {
            tracing::info!(session_id, "Session cancelled during negotiation");
            let _ = inner.events.send(EngineEvent::SessionStateChanged {
                session_id,
                state: SessionState::Cancelled,
            });
        }
        Some(Err(err)) => {
            tracing::warn!(session_id, error = %err, "Negotiation failed");
            let _ = inner.events.send(EngineEvent::NegotiationFailed {
                session_id,
                message: err.to_string(),
            });
            let _ = inner.events.send(EngineEvent::SessionStateChanged {
                session_id,
                state: SessionState::Failed,
            });
        }
        Some(Ok((stream, negotiated))) if negotiated.peer.peer_id != peer_id => {
            // The endpoint authenticated fine but is not the peer the
            // directory promised. Refuse rather than send to a stranger.
            tracing::warn!(
                session_id,
                expected = %peer_id,
                actual = %negotiated.peer.peer_id,
                "Peer identity mismatch"
            );
            drop(stream);
            let _ = inner.events.send(EngineEvent::NegotiationFailed {
                session_id,
                message: "peer identity does not match directory entry".to_string(),
            });
            let _ = inner.events.send(EngineEvent::SessionStateChanged {
                session_id,
                state: SessionState::Failed,
            });
        }
        Some(Ok((stream, negotiated))) => {
            let (ev_tx, ev_rx) = mpsc::unbounded_channel();
            spawn_session_forwarder(session_id, ev_rx, inner.events.clone(), progress);
            let state = transfer::run_sender(
                session_id,
                stream,
                negotiated.channel,
                plan,
                transfer_config(&inner.config),
                ev_tx,
                cancel_rx,
            )
            .await;
            tracing::info!(session_id, ?state, "Outbound session finished");
        }
    }

    inner
        .sessions
        .lock()
        .expect("sessions lock")
        .remove(&session_id);
}

async fn accept_loop(
    inner: Arc<Inner>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(%addr, "Inbound connection");
                    tokio::spawn(run_inbound(inner.clone(), stream));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Accept failed");
                }
            }
        }
    }
    tracing::debug!("Accept loop stopped");
}

/// Handshake an accepted connection and drive the receiving state
/// machine. Connections that fail the handshake, or whose peer already
/// has a session in flight, are dropped without a session.
async fn run_inbound(inner: Arc<Inner>, mut stream: TcpStream) {
    if inner.destroyed.load(Ordering::SeqCst) {
        tracing::debug!("Dropping inbound connection, engine destroyed");
        return;
    }
    let credentials = match inner.trust.issue_session_certificate("inbound") {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(error = %err, "Cannot mint session certificate");
            return;
        }
    };
    let negotiated = match tokio::time::timeout(
        inner.config.handshake_timeout,
        negotiate::respond(&mut stream, &credentials, &inner.trust),
    )
    .await
    {
        Ok(Ok(n)) => n,
        Ok(Err(err)) => {
            tracing::debug!(error = %err, "Inbound handshake rejected");
            return;
        }
        Err(_) => {
            tracing::debug!("Inbound handshake timed out");
            return;
        }
    };

    let peer_id = negotiated.peer.peer_id.clone();
    let slot = match inner.slots.try_reserve(&peer_id) {
        Ok(slot) => slot,
        Err(_) => {
            tracing::debug!(peer = %peer_id, "Dropping second concurrent session");
            return;
        }
    };
    let _slot = slot;

    let session_id = inner.next_session_id.fetch_add(1, Ordering::SeqCst);
    let cancel = CancelHandle::new();
    let (consent_tx, consent_rx) = oneshot::channel();
    let (progress_tx, progress_rx) = watch::channel(TransferProgress {
        session_id,
        bytes_sent: 0,
        bytes_total: 0,
        state: SessionState::Negotiated,
    });
    inner.sessions.lock().expect("sessions lock").insert(
        session_id,
        SessionEntry {
            peer_id: peer_id.clone(),
            cancel: cancel.clone(),
            consent: Some(consent_tx),
            progress: progress_rx,
        },
    );

    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    spawn_session_forwarder(session_id, ev_rx, inner.events.clone(), progress_tx);

    tracing::info!(session_id, peer = %peer_id, "Inbound session negotiated");
    let state = transfer::run_receiver(
        session_id,
        peer_id,
        stream,
        negotiated.channel,
        inner.store.clone(),
        transfer_config(&inner.config),
        ev_tx,
        cancel.subscribe(),
        consent_rx,
    )
    .await;
    tracing::info!(session_id, ?state, "Inbound session finished");

    inner
        .sessions
        .lock()
        .expect("sessions lock")
        .remove(&session_id);
}

/// Re-publish one session's events on the engine broadcast channel,
/// tagged with the session id, and keep its progress watch current.
fn spawn_session_forwarder(
    session_id: SessionId,
    mut rx: mpsc::UnboundedReceiver<SessionEvent>,
    events: broadcast::Sender<EngineEvent>,
    progress: watch::Sender<TransferProgress>,
) {
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            match ev {
                SessionEvent::StateChanged(state) => {
                    let terminal = state.is_terminal();
                    let _ = events.send(EngineEvent::SessionStateChanged { session_id, state });
                    if terminal {
                        break;
                    }
                }
                SessionEvent::Progress(update) => {
                    let _ = progress.send(update.clone());
                    let _ = events.send(EngineEvent::Progress(update));
                }
                SessionEvent::ConsentRequested { peer_id, plan } => {
                    let _ = events.send(EngineEvent::ConsentRequested {
                        session_id,
                        peer_id,
                        plan,
                    });
                }
                SessionEvent::Failed(error) => {
                    let _ = events.send(EngineEvent::SessionFailed { session_id, error });
                }
            }
        }
        tracing::debug!(session_id, "Session event forwarder stopped");
    });
}

fn spawn_discovery_forwarder(
    mut rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
    events: broadcast::Sender<EngineEvent>,
) {
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            let stopped = matches!(ev, DiscoveryEvent::Stopped);
            let mapped = match ev {
                DiscoveryEvent::ReadinessChanged(state) => EngineEvent::ReadinessChanged(state),
                DiscoveryEvent::PeersChanged => EngineEvent::PeerListChanged,
                DiscoveryEvent::Stopped => EngineEvent::DiscoveryStopped,
            };
            let _ = events.send(mapped);
            if stopped {
                break;
            }
        }
    });
}
