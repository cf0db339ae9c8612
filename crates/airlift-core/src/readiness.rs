//! Composite transport readiness.
//!
//! Readiness is a snapshot, never an error and never cached: every query
//! re-reads the injected probes. `Ready` means both transports were
//! usable at the moment of the check; callers re-check before use.

use discovery_core::net;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadinessState {
    NoLocalNetwork,
    NoShortRangeRadio,
    Ready,
}

/// A live view of one transport. Implementations are handles onto
/// platform state (radio adapter, interface table) supplied at engine
/// construction; the engine never reads ambient globals.
pub trait TransportProbe: Send + Sync {
    fn usable(&self) -> bool;
}

/// Probe with a fixed answer, for transports the platform cannot
/// observe (assumed up) or does not ship (pinned down).
pub struct FixedProbe(pub bool);

impl TransportProbe for FixedProbe {
    fn usable(&self) -> bool {
        self.0
    }
}

/// Local-network probe backed by interface enumeration, preferring the
/// configured interface names.
pub struct InterfaceProbe {
    preferred: Vec<String>,
}

impl InterfaceProbe {
    pub fn new(preferred: Vec<String>) -> Self {
        Self { preferred }
    }
}

impl TransportProbe for InterfaceProbe {
    fn usable(&self) -> bool {
        match net::list_interface_ips() {
            Ok(candidates) => net::pick_local_address(&candidates, &self.preferred).is_some(),
            Err(_) => false,
        }
    }
}

/// Derives the composite state. Radio is checked first, mirroring the
/// external protocol's precedence when both transports are down.
pub struct ReadinessMonitor {
    radio: Arc<dyn TransportProbe>,
    network: Arc<dyn TransportProbe>,
}

impl ReadinessMonitor {
    pub fn new(radio: Arc<dyn TransportProbe>, network: Arc<dyn TransportProbe>) -> Self {
        Self { radio, network }
    }

    pub fn query(&self) -> ReadinessState {
        if !self.radio.usable() {
            return ReadinessState::NoShortRangeRadio;
        }
        if !self.network.usable() {
            return ReadinessState::NoLocalNetwork;
        }
        ReadinessState::Ready
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::TransportProbe;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Probe whose state tests can flip at runtime.
    pub struct StubProbe(pub Arc<AtomicBool>);

    impl StubProbe {
        pub fn up() -> (Arc<AtomicBool>, Arc<Self>) {
            let flag = Arc::new(AtomicBool::new(true));
            (flag.clone(), Arc::new(Self(flag)))
        }
    }

    impl TransportProbe for StubProbe {
        fn usable(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StubProbe;
    use super::*;

    #[test]
    fn ready_requires_both_transports() {
        let (_, radio) = StubProbe::up();
        let (_, network) = StubProbe::up();
        let monitor = ReadinessMonitor::new(radio, network);
        assert_eq!(monitor.query(), ReadinessState::Ready);
    }

    #[test]
    fn radio_loss_reports_missing_radio() {
        let (radio_flag, radio) = StubProbe::up();
        let (_, network) = StubProbe::up();
        let monitor = ReadinessMonitor::new(radio, network);

        radio_flag.store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(monitor.query(), ReadinessState::NoShortRangeRadio);
    }

    #[test]
    fn network_loss_reports_missing_network() {
        let (_, radio) = StubProbe::up();
        let (net_flag, network) = StubProbe::up();
        let monitor = ReadinessMonitor::new(radio, network);

        net_flag.store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(monitor.query(), ReadinessState::NoLocalNetwork);
    }

    #[test]
    fn query_is_a_fresh_snapshot_every_time() {
        let (radio_flag, radio) = StubProbe::up();
        let (_, network) = StubProbe::up();
        let monitor = ReadinessMonitor::new(radio, network);

        assert_eq!(monitor.query(), ReadinessState::Ready);
        radio_flag.store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(monitor.query(), ReadinessState::NoShortRangeRadio);
        radio_flag.store(true, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(monitor.query(), ReadinessState::Ready);
    }
}
