use get_if_addrs::{get_if_addrs, IfAddr};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

fn is_valid_lan_ipv4(addr: Ipv4Addr) -> bool {
    !addr.is_loopback() && !addr.is_link_local() && !addr.is_unspecified()
}

fn interface_priority(name: &str) -> usize {
    match name {
        "eth0" => 0,
        "wlan0" => 1,
        "en0" => 2,
        "en1" => 3,
        _ if name.starts_with("eth") || name.starts_with("en") => 10,
        _ if name.starts_with("wl") => 15,
        _ if ["docker", "br-", "veth"].iter().any(|p| name.starts_with(p)) => 40,
        _ => 30,
    }
}

pub fn lan_ipv4_candidates() -> Vec<Ipv4Addr> {
    let Ok(addrs) = get_if_addrs() else {
        return Vec::new();
    };

    let mut buckets: Vec<(usize, Ipv4Addr)> = Vec::new();
    let mut seen = BTreeSet::new();
    for iface in addrs {
        let IfAddr::V4(v4) = iface.addr else {
            continue;
        };
        if !is_valid_lan_ipv4(v4.ip) {
            continue;
        }
        if !seen.insert(v4.ip) {
            continue;
        }
        buckets.push((interface_priority(&iface.name), v4.ip));
    }
    buckets.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    buckets.into_iter().map(|(_, ip)| ip).collect()
}

pub fn local_lan_ipv4() -> Option<Ipv4Addr> {
    lan_ipv4_candidates().into_iter().next()
}
