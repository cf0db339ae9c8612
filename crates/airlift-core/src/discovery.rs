//! Presence: advertise the local device and collect peer sightings.
//!
//! Two event sources feed the peer directory while running: opaque
//! short-range radio advertisements from an injected [`RadioTransport`],
//! and mDNS browse events from `discovery-core`. The service starts only
//! when readiness is `Ready` and a background watchdog stops it when
//! readiness is lost, never failing silently.

use crate::config::EngineConfig;
use crate::error::DiscoveryError;
use crate::peers::{Peer, PeerDirectory, Reachability};
use crate::readiness::{ReadinessMonitor, ReadinessState};
use discovery_core::advert::{Advertisement, FINGERPRINT_LEN, MAX_NAME_LEN};
use discovery_core::{net, Announcer, Browser, ServiceAnnouncement, Sighting, SightingEvent, TxtRecord};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

const TXT_FINGERPRINT: &str = "fp";
const TXT_NAME: &str = "name";
const TXT_DISCRIMINATOR: &str = "disc";

/// A raw short-range sighting: undecoded advertisement bytes plus the
/// observed signal strength.
#[derive(Debug, Clone)]
pub struct RawAdvertisement {
    pub bytes: Vec<u8>,
    pub rssi: i16,
}

/// Bridge to a platform radio stack. The engine never interprets radio
/// state itself; it only hands the encoded advertisement payload down
/// and consumes the raw sightings coming back up.
pub trait RadioTransport: Send + Sync {
    /// Begin advertising `payload` and scanning. The returned stream
    /// carries every raw sighting observed until [`stop`](Self::stop).
    fn start(
        &self,
        payload: Vec<u8>,
    ) -> Result<mpsc::UnboundedReceiver<RawAdvertisement>, DiscoveryError>;

    fn stop(&self);
}

/// Radio bridge for deployments without a short-range stack: advertises
/// nothing and never sights anyone. Local-network discovery still works.
#[derive(Default)]
pub struct PassiveRadio {
    // Held so the sighting stream stays open but idle until stop.
    keepalive: Mutex<Option<mpsc::UnboundedSender<RawAdvertisement>>>,
}

impl RadioTransport for PassiveRadio {
    fn start(
        &self,
        _payload: Vec<u8>,
    ) -> Result<mpsc::UnboundedReceiver<RawAdvertisement>, DiscoveryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.keepalive.lock().expect("passive radio lock") = Some(tx);
        Ok(rx)
    }

    fn stop(&self) {
        self.keepalive.lock().expect("passive radio lock").take();
    }
}

/// Events the discovery service reports to the engine.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    ReadinessChanged(ReadinessState),
    PeersChanged,
    Stopped,
}

/// Discovery-relevant slice of the engine configuration.
#[derive(Debug, Clone)]
struct DiscoverySettings {
    service_type: String,
    discriminator: u16,
    device_name: String,
    preferred_interfaces: Vec<String>,
    readiness_poll: Duration,
    sweep_interval: Duration,
    peer_stale_after: Duration,
}

struct Running {
    stop_flag: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    _announcer: Option<Announcer>,
}

/// Advertise the local device and feed validated sightings into the
/// peer directory. `Stopped → Advertising+Scanning → Stopped`; start is
/// idempotent while running, stop is idempotent always.
pub struct DiscoveryService {
    settings: DiscoverySettings,
    readiness: Arc<ReadinessMonitor>,
    radio: Arc<dyn RadioTransport>,
    directory: PeerDirectory,
    running: Arc<Mutex<Option<Running>>>,
    malformed_dropped: Arc<AtomicU64>,
}

impl DiscoveryService {
    pub fn new(
        config: &EngineConfig,
        readiness: Arc<ReadinessMonitor>,
        radio: Arc<dyn RadioTransport>,
        directory: PeerDirectory,
    ) -> Self {
        Self {
            settings: DiscoverySettings {
                service_type: config.service_type.clone(),
                discriminator: config.discriminator,
                device_name: config.device_name.clone(),
                preferred_interfaces: config.preferred_interfaces.clone(),
                readiness_poll: config.readiness_poll,
                sweep_interval: config.sweep_interval,
                peer_stale_after: config.peer_stale_after,
            },
            readiness,
            radio,
            directory,
            running: Arc::new(Mutex::new(None)),
            malformed_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start advertising and scanning. Fails with `NotReady` unless both
    /// transports are usable at this moment. Must run inside a tokio
    /// runtime: the browse, radio, and watchdog loops are spawned here.
    pub fn start(
        &self,
        fingerprint: [u8; FINGERPRINT_LEN],
        listen_port: u16,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<(), DiscoveryError> {
        let mut slot = self.running.lock().expect("discovery state lock");
        if slot.is_some() {
            return Ok(());
        }
        if self.readiness.query() != ReadinessState::Ready {
            return Err(DiscoveryError::NotReady);
        }

        let advert = Advertisement::new(
            fingerprint,
            self.settings.discriminator,
            &advert_name(&self.settings.device_name),
        )
        .map_err(|e| DiscoveryError::Advertise(e.to_string()))?;
        let local_peer_id = advert.peer_id();

        let sightings = self.radio.start(advert.encode())?;

        let announcer = match self.register_presence(&local_peer_id, listen_port) {
            Ok(announcer) => announcer,
            Err(err) => {
                self.radio.stop();
                return Err(err);
            }
        };
        let browser = match Browser::start(&self.settings.service_type) {
            Ok(browser) => browser,
            Err(err) => {
                self.radio.stop();
                return Err(DiscoveryError::Scan(err.to_string()));
            }
        };

        let stop_flag = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(radio_loop(
            sightings,
            self.directory.clone(),
            self.malformed_dropped.clone(),
            self.settings.discriminator,
            events.clone(),
            shutdown_rx.clone(),
        ));
        {
            let directory = self.directory.clone();
            let local_peer_id = local_peer_id.clone();
            let discriminator = self.settings.discriminator;
            let events = events.clone();
            let stop_flag = stop_flag.clone();
            tokio::task::spawn_blocking(move || {
                browse_loop(browser, directory, local_peer_id, discriminator, events, stop_flag)
            });
        }
        tokio::spawn(watchdog_loop(
            self.readiness.clone(),
            self.directory.clone(),
            self.running.clone(),
            self.radio.clone(),
            events,
            self.settings.readiness_poll,
            self.settings.sweep_interval,
            self.settings.peer_stale_after,
            shutdown_rx,
        ));

        *slot = Some(Running {
            stop_flag,
            shutdown: shutdown_tx,
            _announcer: Some(announcer),
        });
        tracing::info!(peer = %local_peer_id, port = listen_port, "Discovery started");
        Ok(())
    }

    fn register_presence(
        &self,
        local_peer_id: &str,
        listen_port: u16,
    ) -> Result<Announcer, DiscoveryError> {
        let candidates =
            net::list_interface_ips().map_err(|e| DiscoveryError::Advertise(e.to_string()))?;
        let ip = net::pick_local_address(&candidates, &self.settings.preferred_interfaces)
            .ok_or_else(|| DiscoveryError::Advertise("no usable interface address".to_string()))?;

        Announcer::register(ServiceAnnouncement {
            service_type: self.settings.service_type.clone(),
            instance_name: local_peer_id.to_string(),
            host_name: format!("{local_peer_id}.local."),
            ip_addr: ip.to_string(),
            port: listen_port,
            txt: Some(TxtRecord(vec![
                (TXT_FINGERPRINT.to_string(), local_peer_id.to_string()),
                (TXT_NAME.to_string(), self.settings.device_name.clone()),
                (
                    TXT_DISCRIMINATOR.to_string(),
                    format!("{:04x}", self.settings.discriminator),
                ),
            ])),
        })
        .map_err(|e| DiscoveryError::Advertise(e.to_string()))
    }

    pub fn stop(&self) {
        if halt(&self.running, self.radio.as_ref()) {
            tracing::info!("Discovery stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().expect("discovery state lock").is_some()
    }

    /// Advertisements that failed to decode since the service was built.
    pub fn malformed_dropped(&self) -> u64 {
        self.malformed_dropped.load(Ordering::Relaxed)
    }
}

/// Tear down the running state, releasing the mDNS registration and the
/// radio. Returns false when discovery was already stopped.
fn halt(running: &Mutex<Option<Running>>, radio: &dyn RadioTransport) -> bool {
    let taken = running.lock().expect("discovery state lock").take();
    match taken {
        Some(active) => {
            active.stop_flag.store(true, Ordering::SeqCst);
            let _ = active.shutdown.send(true);
            radio.stop();
            true
        }
        None => false,
    }
}

/// The advertised name must fit the fixed payload; trim on a char
/// boundary rather than reject long device names.
fn advert_name(device_name: &str) -> String {
    if device_name.len() <= MAX_NAME_LEN {
        return device_name.to_string();
    }
    let mut end = MAX_NAME_LEN;
    while !device_name.is_char_boundary(end) {
        end -= 1;
    }
    device_name[..end].to_string()
}

/// Decode one raw radio sighting into the directory. Malformed payloads
/// are counted and dropped; foreign discriminators are ignored.
fn apply_advert(
    directory: &PeerDirectory,
    malformed: &AtomicU64,
    discriminator: u16,
    raw: &RawAdvertisement,
) -> bool {
    match Advertisement::decode(&raw.bytes) {
        Ok(adv) if adv.discriminator == discriminator => {
            directory.upsert(Peer {
                id: adv.peer_id(),
                display_name: adv.display_name,
                discovery_address: None,
                reachability: Reachability::Radio { rssi: raw.rssi },
                last_seen: Instant::now(),
            });
            true
        }
        Ok(adv) => {
            tracing::trace!(discriminator = adv.discriminator, "Ignoring foreign advertisement");
            false
        }
        Err(err) => {
            malformed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%err, "Dropped malformed advertisement");
            false
        }
    }
}

/// Map a resolved mDNS sighting to a peer. A sighting without our
/// fingerprint and discriminator TXT records never enters the directory.
fn peer_from_sighting(sighting: &Sighting, discriminator: u16) -> Option<Peer> {
    let id = sighting.txt_value(TXT_FINGERPRINT)?.to_string();
    let advertised = sighting.txt_value(TXT_DISCRIMINATOR)?;
    if advertised != format!("{discriminator:04x}") {
        return None;
    }
    let display_name = sighting
        .txt_value(TXT_NAME)
        .unwrap_or(&sighting.instance_name)
        .to_string();
    let discovery_address = sighting
        .addresses
        .first()
        .map(|ip| SocketAddr::new(*ip, sighting.port).to_string());
    Some(Peer {
        id,
        display_name,
        discovery_address,
        reachability: Reachability::LocalNetwork,
        last_seen: Instant::now(),
    })
}

async fn radio_loop(
    mut sightings: mpsc::UnboundedReceiver<RawAdvertisement>,
    directory: PeerDirectory,
    malformed: Arc<AtomicU64>,
    discriminator: u16,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            raw = sightings.recv() => match raw {
                Some(raw) => {
                    if apply_advert(&directory, &malformed, discriminator, &raw) {
                        let _ = events.send(DiscoveryEvent::PeersChanged);
                    }
                }
                None => break,
            }
        }
    }
}

/// Blocking loop over the mDNS browse channel. The half-second poll
/// bounds how long a stop request can go unnoticed.
fn browse_loop(
    browser: Browser,
    directory: PeerDirectory,
    local_peer_id: String,
    discriminator: u16,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    stop_flag: Arc<AtomicBool>,
) {
    while !stop_flag.load(Ordering::SeqCst) {
        match browser.recv_timeout(Duration::from_millis(500)) {
            Some(SightingEvent::Resolved(sighting)) => {
                if sighting.txt_value(TXT_FINGERPRINT) == Some(local_peer_id.as_str()) {
                    continue;
                }
                if let Some(peer) = peer_from_sighting(&sighting, discriminator) {
                    directory.upsert(peer);
                    let _ = events.send(DiscoveryEvent::PeersChanged);
                }
            }
            Some(SightingEvent::Lost { fullname }) => {
                // Instance names are peer ids, so the fullname prefix
                // addresses the directory entry directly.
                let instance = fullname.split('.').next().unwrap_or_default();
                if directory.remove(instance).is_some() {
                    let _ = events.send(DiscoveryEvent::PeersChanged);
                }
            }
            None => {}
        }
    }
}

/// Re-checks readiness on an interval and sweeps stale peers. Readiness
/// loss halts discovery and reports why before the `Stopped` event.
#[allow(clippy::too_many_arguments)]
async fn watchdog_loop(
    readiness: Arc<ReadinessMonitor>,
    directory: PeerDirectory,
    running: Arc<Mutex<Option<Running>>>,
    radio: Arc<dyn RadioTransport>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    poll: Duration,
    sweep_every: Duration,
    stale_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut poll_timer = tokio::time::interval(poll);
    let mut sweep_timer = tokio::time::interval(sweep_every);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = poll_timer.tick() => {
                let state = readiness.query();
                if state != ReadinessState::Ready {
                    tracing::warn!(?state, "Readiness lost, stopping discovery");
                    let _ = events.send(DiscoveryEvent::ReadinessChanged(state));
                    halt(&running, radio.as_ref());
                    let _ = events.send(DiscoveryEvent::Stopped);
                    break;
                }
            }
            _ = sweep_timer.tick() => {
                if directory.sweep(Instant::now(), stale_after) > 0 {
                    let _ = events.send(DiscoveryEvent::PeersChanged);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{RadioTransport, RawAdvertisement};
    use crate::error::DiscoveryError;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Radio whose sightings tests inject by hand.
    #[derive(Default)]
    pub struct StubRadio {
        pub injector: Mutex<Option<mpsc::UnboundedSender<RawAdvertisement>>>,
        pub stopped: AtomicBool,
    }

    impl RadioTransport for StubRadio {
        fn start(
            &self,
            _payload: Vec<u8>,
        ) -> Result<mpsc::UnboundedReceiver<RawAdvertisement>, DiscoveryError> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.injector.lock().expect("stub radio lock") = Some(tx);
            Ok(rx)
        }

        fn stop(&self) {
            self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StubRadio;
    use super::*;
    use crate::readiness::test_support::StubProbe;

    fn service(readiness: Arc<ReadinessMonitor>) -> DiscoveryService {
        DiscoveryService::new(
            &EngineConfig::default(),
            readiness,
            Arc::new(StubRadio::default()),
            PeerDirectory::new(),
        )
    }

    #[test]
    fn start_requires_ready_transports() {
        let (radio_flag, radio_probe) = StubProbe::up();
        let (_, net_probe) = StubProbe::up();
        radio_flag.store(false, Ordering::SeqCst);
        let svc = service(Arc::new(ReadinessMonitor::new(radio_probe, net_probe)));

        let (events, _rx) = mpsc::unbounded_channel();
        let err = svc.start([1u8; FINGERPRINT_LEN], 4000, events);
        assert!(matches!(err, Err(DiscoveryError::NotReady)));
        assert!(!svc.is_running());
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let (_, radio_probe) = StubProbe::up();
        let (_, net_probe) = StubProbe::up();
        let svc = service(Arc::new(ReadinessMonitor::new(radio_probe, net_probe)));
        svc.stop();
        svc.stop();
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn radio_sightings_populate_directory() {
        let directory = PeerDirectory::new();
        let malformed = Arc::new(AtomicU64::new(0));
        let (inject, sightings) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(radio_loop(
            sightings,
            directory.clone(),
            malformed.clone(),
            0x0a1f,
            events_tx,
            shutdown_rx,
        ));

        let good = Advertisement::new([3u8; FINGERPRINT_LEN], 0x0a1f, "kitchen").unwrap();
        let foreign = Advertisement::new([4u8; FINGERPRINT_LEN], 0xbeef, "other").unwrap();
        inject
            .send(RawAdvertisement { bytes: good.encode(), rssi: -48 })
            .unwrap();
        inject
            .send(RawAdvertisement { bytes: vec![0, 1, 2], rssi: -48 })
            .unwrap();
        inject
            .send(RawAdvertisement { bytes: foreign.encode(), rssi: -48 })
            .unwrap();
        drop(inject);
        task.await.unwrap();

        assert_eq!(directory.len(), 1);
        let peer = directory.get(&good.peer_id()).unwrap();
        assert_eq!(peer.display_name, "kitchen");
        assert_eq!(peer.reachability, Reachability::Radio { rssi: -48 });
        assert_eq!(malformed.load(Ordering::SeqCst), 1);
        assert!(matches!(events_rx.try_recv(), Ok(DiscoveryEvent::PeersChanged)));
    }

    #[tokio::test]
    async fn readiness_loss_halts_discovery() {
        let (radio_flag, radio_probe) = StubProbe::up();
        let (_, net_probe) = StubProbe::up();
        let readiness = Arc::new(ReadinessMonitor::new(radio_probe, net_probe));
        let directory = PeerDirectory::new();
        let radio = Arc::new(StubRadio::default());
        let running = Arc::new(Mutex::new(Some(Running {
            stop_flag: Arc::new(AtomicBool::new(false)),
            shutdown: watch::channel(false).0,
            _announcer: None,
        })));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(watchdog_loop(
            readiness,
            directory,
            running.clone(),
            radio.clone(),
            events_tx,
            Duration::from_millis(10),
            Duration::from_secs(60),
            Duration::from_secs(30),
            shutdown_rx,
        ));

        radio_flag.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert!(running.lock().unwrap().is_none());
        assert!(radio.stopped.load(Ordering::SeqCst));
        match events_rx.recv().await {
            Some(DiscoveryEvent::ReadinessChanged(ReadinessState::NoShortRangeRadio)) => {}
            other => panic!("expected readiness event, got {other:?}"),
        }
        assert!(matches!(events_rx.recv().await, Some(DiscoveryEvent::Stopped)));
    }

    #[test]
    fn mdns_sighting_needs_matching_txt_records() {
        let base = Sighting {
            fullname: "abcd1234._airlift._tcp.local.".to_string(),
            instance_name: "abcd1234".to_string(),
            host_name: "abcd1234.local.".to_string(),
            port: 4123,
            addresses: vec!["192.168.1.20".parse().unwrap()],
            txt: vec![
                ("fp".to_string(), "abcd1234abcd1234".to_string()),
                ("name".to_string(), "Den".to_string()),
                ("disc".to_string(), "0a1f".to_string()),
            ],
        };

        let peer = peer_from_sighting(&base, 0x0a1f).unwrap();
        assert_eq!(peer.id, "abcd1234abcd1234");
        assert_eq!(peer.display_name, "Den");
        assert_eq!(peer.discovery_address.as_deref(), Some("192.168.1.20:4123"));
        assert_eq!(peer.reachability, Reachability::LocalNetwork);

        let mut wrong_disc = base.clone();
        wrong_disc.txt[2].1 = "beef".to_string();
        assert!(peer_from_sighting(&wrong_disc, 0x0a1f).is_none());

        let mut no_fp = base;
        no_fp.txt.remove(0);
        assert!(peer_from_sighting(&no_fp, 0x0a1f).is_none());
    }

    #[test]
    fn advertised_name_is_trimmed_on_char_boundaries() {
        assert_eq!(advert_name("short"), "short");
        let long = "device-name-well-over-the-limit";
        assert_eq!(advert_name(long).len(), MAX_NAME_LEN);
        let multibyte = "ドキュメントサーバー試験機"; // 3 bytes per char
        let trimmed = advert_name(multibyte);
        assert!(trimmed.len() <= MAX_NAME_LEN);
        assert!(multibyte.starts_with(&trimmed));
    }
}
