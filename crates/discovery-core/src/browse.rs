use crate::announce::ensure_dot;
use crate::model::Sighting;
use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::time::Duration;

/// A browse event surfaced to the engine.
#[derive(Debug, Clone)]
pub enum SightingEvent {
    Resolved(Sighting),
    Lost { fullname: String },
}

/// Continuous mDNS browse handle.
///
/// `recv_timeout` is blocking, so the engine drives it from a dedicated
/// blocking task and forwards events onto its async channels.
pub struct Browser {
    daemon: ServiceDaemon,
    receiver: mdns_sd::Receiver<ServiceEvent>,
    service_type: String,
}

impl Browser {
    pub fn start(service_type: &str) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        let service_type = ensure_dot(service_type);
        let receiver = daemon.browse(&service_type)?;
        Ok(Self {
            daemon,
            receiver,
            service_type,
        })
    }

    /// Wait up to `timeout` for the next interesting browse event.
    ///
    /// Returns `None` on timeout or when the daemon delivered only
    /// bookkeeping events within the window.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SightingEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                let txt = info
                    .get_properties()
                    .iter()
                    .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
                    .collect::<Vec<_>>();

                Some(SightingEvent::Resolved(Sighting {
                    fullname: info.get_fullname().to_string(),
                    instance_name: info
                        .get_fullname()
                        .split('.')
                        .next()
                        .unwrap_or_default()
                        .to_string(),
                    host_name: info.get_hostname().to_string(),
                    port: info.get_port(),
                    addresses: info.get_addresses().iter().copied().collect(),
                    txt,
                }))
            }
            Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                Some(SightingEvent::Lost { fullname })
            }
            Ok(_) => None,
            Err(_) => None,
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        let _ = self.daemon.stop_browse(&self.service_type);
        let _ = self.daemon.shutdown();
    }
}
