use futures::future::join_all;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::device::Device;
use crate::error::{BootstrapError, BootstrapResult};
use crate::probe::{probe_fleet, HostProbe, ProbeSettings};

/// Strict dotted-quad parse: exactly four decimal octets, each 0-255.
pub fn parse_ipv4(input: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = input.split('.');
    for octet in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 3 || !part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let value: u16 = part.parse().ok()?;
        *octet = u8::try_from(value).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}

pub fn is_valid_hostname(input: &str) -> bool {
    if input.is_empty() || input.len() > 253 {
        return false;
    }
    input.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Splits `a, b c` style host lists on commas and whitespace.
pub fn split_host_list(input: &str) -> Vec<String> {
    input
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn looks_numeric(entry: &str) -> bool {
    entry.chars().all(|c| c.is_ascii_digit() || c == '.')
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedEntries {
    pub devices: Vec<Device>,
    pub rejected: Vec<String>,
}

/// Validates and deduplicates entries, keeping first-seen order.
pub fn parse_entries<I, S>(entries: I) -> ParsedEntries
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parsed = ParsedEntries::default();
    let mut seen = HashSet::new();
    for entry in entries {
        let entry = entry.as_ref().trim();
        if entry.is_empty() {
            continue;
        }
        let device = if looks_numeric(entry) {
            match parse_ipv4(entry) {
                Some(ip) => Device::new(ip.to_string()),
                None => {
                    tracing::warn!(entry = %entry, "ignoring malformed IPv4 address");
                    parsed.rejected.push(entry.to_string());
                    continue;
                }
            }
        } else if is_valid_hostname(entry) {
            Device::named(entry.to_ascii_lowercase())
        } else {
            tracing::warn!(entry = %entry, "ignoring invalid host entry");
            parsed.rejected.push(entry.to_string());
            continue;
        };
        if seen.insert(device.address.clone()) {
            parsed.devices.push(device);
        }
    }
    parsed
}

/// Accepts `a.b.c`, `a.b.c.0/24` or any address inside the /24.
pub fn parse_subnet(input: &str) -> BootstrapResult<[u8; 3]> {
    let trimmed = input.trim();
    let base = trimmed.strip_suffix("/24").unwrap_or(trimmed);
    let candidate = if base.split('.').count() == 3 {
        format!("{base}.0")
    } else {
        base.to_string()
    };
    let ip = parse_ipv4(&candidate).ok_or_else(|| {
        BootstrapError::Input(format!("invalid subnet '{trimmed}' (expected e.g. 192.168.1)"))
    })?;
    let [a, b, c, _] = ip.octets();
    Ok([a, b, c])
}

/// `.1` through `.254` of the /24, skipping `exclude`.
pub fn subnet_hosts(prefix: [u8; 3], exclude: Option<Ipv4Addr>) -> Vec<Device> {
    let [a, b, c] = prefix;
    (1..=254u8)
        .map(|d| Ipv4Addr::new(a, b, c, d))
        .filter(|ip| Some(*ip) != exclude)
        .map(|ip| Device::new(ip.to_string()))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct InventoryRequest {
    /// Command-line entries, listed before config entries.
    pub hosts: Vec<String>,
    pub config_hosts: Vec<String>,
    pub scan: bool,
    pub subnet: Option<String>,
}

pub async fn resolve_inventory<P>(
    request: &InventoryRequest,
    probe: Arc<P>,
    probe_settings: &ProbeSettings,
    local_ip: Option<Ipv4Addr>,
) -> BootstrapResult<Vec<Device>>
where
    P: HostProbe + ?Sized + 'static,
{
    let parsed = parse_entries(request.hosts.iter().chain(request.config_hosts.iter()));
    let mut devices = parsed.devices;

    if request.scan {
        let prefix = match request.subnet.as_deref() {
            Some(subnet) => parse_subnet(subnet)?,
            None => {
                let ip = local_ip.ok_or_else(|| {
                    BootstrapError::Input(
                        "could not determine the local /24; pass --subnet".to_string(),
                    )
                })?;
                let [a, b, c, _] = ip.octets();
                [a, b, c]
            }
        };
        let [a, b, c] = prefix;
        tracing::info!(subnet = %format!("{a}.{b}.{c}.0/24"), "scanning for devices");
        let sweep =
            probe_fleet(probe.clone(), subnet_hosts(prefix, local_ip), probe_settings).await;
        let mut seen: HashSet<String> = devices.iter().map(|d| d.address.clone()).collect();
        let found = sweep.reachable.len();
        let hits: Vec<Device> = sweep
            .reachable
            .into_iter()
            .filter(|hit| seen.insert(hit.address.clone()))
            .map(|hit| Device::new(hit.address))
            .collect();
        let names = join_all(
            hits.iter()
                .map(|hit| probe.hostname(hit.address.clone(), probe_settings.timeout)),
        )
        .await;
        for (mut device, hostname) in hits.into_iter().zip(names) {
            if let Some(name) = &hostname {
                tracing::debug!(device = %device.address, hostname = %name, "resolved name");
            }
            device.hostname = hostname;
            devices.push(device);
        }
        tracing::info!(found, "scan complete");
    } else if devices.is_empty() {
        return Err(BootstrapError::Input(
            "no valid device addresses supplied and scanning is disabled".to_string(),
        ));
    }
    Ok(devices)
}
