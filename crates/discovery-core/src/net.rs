use crate::model::InterfaceIp;
use std::io::Error;
use std::net::IpAddr;

pub fn list_interface_ips() -> Result<Vec<InterfaceIp>, Error> {
    let ifs = if_addrs::get_if_addrs()?;

    let mut out: Vec<InterfaceIp> = ifs
        .into_iter()
        .map(|ifa| {
            let ip = ifa.ip();
            InterfaceIp {
                name: ifa.name,
                ip,
                is_loopback: ip.is_loopback(),
            }
        })
        .collect();

    out.sort_by(|a, b| (&a.name, &a.ip).cmp(&(&b.name, &b.ip)));
    out.dedup_by(|a, b| a.name == b.name && a.ip == b.ip);
    Ok(out)
}

/// Pick the address to advertise: preferred interface names in order,
/// IPv4 before IPv6 on a given interface, then any non-loopback address.
pub fn pick_local_address(candidates: &[InterfaceIp], preferred: &[String]) -> Option<IpAddr> {
    for name in preferred {
        if let Some(ip) = best_on_interface(candidates, name) {
            return Some(ip);
        }
    }
    candidates
        .iter()
        .filter(|c| !c.is_loopback)
        .map(|c| c.ip)
        .find(|ip| ip.is_ipv4())
        .or_else(|| candidates.iter().filter(|c| !c.is_loopback).map(|c| c.ip).next())
}

fn best_on_interface(candidates: &[InterfaceIp], name: &str) -> Option<IpAddr> {
    let on_iface: Vec<_> = candidates
        .iter()
        .filter(|c| c.name == name && !c.is_loopback)
        .collect();
    on_iface
        .iter()
        .map(|c| c.ip)
        .find(|ip| ip.is_ipv4())
        .or_else(|| on_iface.first().map(|c| c.ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, ip: &str, lo: bool) -> InterfaceIp {
        InterfaceIp {
            name: name.to_string(),
            ip: ip.parse().unwrap(),
            is_loopback: lo,
        }
    }

    #[test]
    fn prefers_configured_interface_order() {
        let candidates = vec![
            iface("eth0", "10.0.0.5", false),
            iface("wlan0", "192.168.1.8", false),
            iface("wlan1", "192.168.7.2", false),
        ];
        let preferred = vec!["wlan1".to_string(), "wlan0".to_string()];
        let picked = pick_local_address(&candidates, &preferred).unwrap();
        assert_eq!(picked, "192.168.7.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn falls_back_to_any_non_loopback() {
        let candidates = vec![
            iface("lo", "127.0.0.1", true),
            iface("eth0", "10.0.0.5", false),
        ];
        let preferred = vec!["wlan0".to_string()];
        let picked = pick_local_address(&candidates, &preferred).unwrap();
        assert_eq!(picked, "10.0.0.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn ipv4_wins_on_same_interface() {
        let candidates = vec![
            iface("wlan0", "fe80::1", false),
            iface("wlan0", "192.168.1.8", false),
        ];
        let preferred = vec!["wlan0".to_string()];
        let picked = pick_local_address(&candidates, &preferred).unwrap();
        assert!(picked.is_ipv4());
    }

    #[test]
    fn loopback_only_yields_none() {
        let candidates = vec![iface("lo", "127.0.0.1", true)];
        assert_eq!(pick_local_address(&candidates, &[]), None);
    }
}
