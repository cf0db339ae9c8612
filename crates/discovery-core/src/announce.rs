use crate::model::{ServiceAnnouncement, TxtRecord};
use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceInfo};

/// Handle so the service stays registered while this is alive.
///
/// Dropping the announcer shuts down the daemon and unregisters the
/// service, which is how the discovery service releases its presence on
/// stop/destroy.
pub struct Announcer {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Announcer {
    pub fn register(ann: ServiceAnnouncement) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;

        let txt_kv = ann.txt.unwrap_or(TxtRecord(vec![])).0;

        // mdns-sd expects FQDNs with trailing dots.
        let service_type = ensure_dot(&ann.service_type);
        let host_name = ensure_dot(&ann.host_name);

        let info = ServiceInfo::new(
            &service_type,
            &ann.instance_name,
            &host_name,
            &ann.ip_addr,
            ann.port,
            &txt_kv[..],
        )?;

        daemon.register(info.clone())?;
        tracing::debug!(fullname = %info.get_fullname(), "mDNS service registered");
        Ok(Self {
            daemon,
            fullname: info.get_fullname().to_string(),
        })
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
    }
}

pub(crate) fn ensure_dot(s: &str) -> String {
    if s.ends_with('.') {
        s.to_string()
    } else {
        format!("{}.", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_dot_appends_once() {
        assert_eq!(ensure_dot("_airlift._tcp.local"), "_airlift._tcp.local.");
        assert_eq!(ensure_dot("_airlift._tcp.local."), "_airlift._tcp.local.");
    }
}
