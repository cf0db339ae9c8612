use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxtRecord(pub Vec<(String, String)>);

/// Local presence published over mDNS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAnnouncement {
    /// e.g. "_airlift._tcp.local."
    pub service_type: String,
    /// Instance name, typically the device identity fingerprint.
    pub instance_name: String,
    /// e.g. "myhost.local."
    pub host_name: String,
    pub ip_addr: String,
    pub port: u16,
    pub txt: Option<TxtRecord>,
}

/// A resolved mDNS sighting of a remote peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sighting {
    pub fullname: String,
    pub instance_name: String,
    pub host_name: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub txt: Vec<(String, String)>,
}

impl Sighting {
    /// Look up a TXT property by key.
    pub fn txt_value(&self, key: &str) -> Option<&str> {
        self.txt
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceIp {
    pub name: String,
    pub ip: IpAddr,
    pub is_loopback: bool,
}
