//! Parallel reachability checks.
//!
//! Every device gets an ICMP echo and a TCP connect to its SSH port, both
//! bounded by the same timeout. Either one succeeding makes the device
//! reachable. Probing never fails the run; unreachable devices are handed
//! back to the caller for reporting.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::config::SwarmConfig;
use crate::device::Device;

pub const MIN_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub trait HostProbe: Send + Sync {
    fn icmp(&self, host: String, timeout: Duration) -> BoxFuture<'static, bool>;
    fn tcp(&self, host: String, port: u16, timeout: Duration) -> BoxFuture<'static, bool>;

    /// Reverse lookup for an address found by a sweep.
    fn hostname(&self, _address: String, _timeout: Duration) -> BoxFuture<'static, Option<String>> {
        async { None }.boxed()
    }
}

/// System `ping` plus a tokio TCP connect.
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn icmp(&self, host: String, timeout: Duration) -> BoxFuture<'static, bool> {
        async move {
            let wait = if cfg!(target_os = "macos") {
                timeout.as_millis().max(250).to_string()
            } else {
                timeout.as_secs().max(1).to_string()
            };
            let child = Command::new("ping")
                .args(["-n", "-q", "-c", "1", "-W", wait.as_str(), host.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status();
            match tokio::time::timeout(timeout + Duration::from_millis(500), child).await {
                Ok(Ok(status)) => status.success(),
                Ok(Err(err)) => {
                    tracing::debug!(host = %host, error = %err, "ping unavailable");
                    false
                }
                Err(_) => false,
            }
        }
        .boxed()
    }

    fn tcp(&self, host: String, port: u16, timeout: Duration) -> BoxFuture<'static, bool> {
        async move {
            matches!(
                tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await,
                Ok(Ok(_))
            )
        }
        .boxed()
    }

    /// `getent hosts` goes through NSS, so mDNS names resolve where
    /// nss-mdns is installed.
    fn hostname(&self, address: String, timeout: Duration) -> BoxFuture<'static, Option<String>> {
        async move {
            let child = Command::new("getent")
                .args(["hosts", address.as_str()])
                .stdin(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output();
            match tokio::time::timeout(timeout, child).await {
                Ok(Ok(output)) if output.status.success() => {
                    parse_getent_hosts(&String::from_utf8_lossy(&output.stdout))
                }
                Ok(Ok(_)) | Err(_) => None,
                Ok(Err(err)) => {
                    tracing::debug!(address = %address, error = %err, "getent unavailable");
                    None
                }
            }
        }
        .boxed()
    }
}

/// First name from a `getent hosts` line (`<address> <name> [aliases]`).
pub fn parse_getent_hosts(output: &str) -> Option<String> {
    let name = output.lines().next()?.split_whitespace().nth(1)?;
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    (!name.is_empty()).then_some(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub concurrency: usize,
    pub ssh_port: u16,
}

impl ProbeSettings {
    pub fn new(timeout: Duration, concurrency: usize, ssh_port: u16) -> Self {
        Self {
            timeout: timeout.clamp(MIN_PROBE_TIMEOUT, MAX_PROBE_TIMEOUT),
            concurrency: concurrency.max(1),
            ssh_port,
        }
    }

    pub fn from_config(config: &SwarmConfig) -> Self {
        Self::new(
            Duration::from_secs(config.probe.timeout_secs),
            config.probe.concurrency,
            config.ssh.port,
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub reachable: Vec<Device>,
    pub unreachable: Vec<Device>,
}

pub async fn probe_device<P>(probe: &P, mut device: Device, settings: &ProbeSettings) -> Device
where
    P: HostProbe + ?Sized,
{
    let icmp = probe.icmp(device.address.clone(), settings.timeout);
    let tcp = probe.tcp(device.address.clone(), settings.ssh_port, settings.timeout);
    let (icmp_ok, tcp_ok) = tokio::join!(icmp, tcp);
    device.ssh_port_open = tcp_ok;
    device.reachable = icmp_ok || tcp_ok;
    tracing::debug!(
        device = %device.address,
        icmp = icmp_ok,
        ssh_port = tcp_ok,
        "probed device"
    );
    device
}

/// Probes all devices with at most `settings.concurrency` in flight.
/// Input order is preserved within each partition.
pub async fn probe_fleet<P>(
    probe: Arc<P>,
    devices: Vec<Device>,
    settings: &ProbeSettings,
) -> ProbeReport
where
    P: HostProbe + ?Sized + 'static,
{
    let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));
    let mut handles = Vec::with_capacity(devices.len());
    for device in devices {
        let probe = probe.clone();
        let semaphore = semaphore.clone();
        let settings = *settings;
        let fallback = device.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return device;
            };
            probe_device(probe.as_ref(), device, &settings).await
        });
        handles.push((fallback, handle));
    }

    let mut report = ProbeReport::default();
    for (fallback, handle) in handles {
        let device = match handle.await {
            Ok(device) => device,
            Err(err) => {
                tracing::warn!(device = %fallback.address, error = %err, "probe task failed");
                fallback
            }
        };
        if device.reachable {
            report.reachable.push(device);
        } else {
            report.unreachable.push(device);
        }
    }

    if !report.unreachable.is_empty() {
        let addresses: Vec<&str> = report
            .unreachable
            .iter()
            .map(|device| device.address.as_str())
            .collect();
        tracing::warn!(
            count = addresses.len(),
            devices = %addresses.join(", "),
            "devices unreachable; continuing without them"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Instant;

    /// Each host answers after `delay` with a fixed (icmp, tcp) result.
    struct FakeProbe {
        delay: Duration,
        answers: HashMap<String, (bool, bool)>,
    }

    impl HostProbe for FakeProbe {
        fn icmp(&self, host: String, _timeout: Duration) -> BoxFuture<'static, bool> {
            let delay = self.delay;
            let ok = self.answers.get(&host).map(|a| a.0).unwrap_or(false);
            async move {
                tokio::time::sleep(delay).await;
                ok
            }
            .boxed()
        }

        fn tcp(&self, host: String, _port: u16, _timeout: Duration) -> BoxFuture<'static, bool> {
            let delay = self.delay;
            let ok = self.answers.get(&host).map(|a| a.1).unwrap_or(false);
            async move {
                tokio::time::sleep(delay).await;
                ok
            }
            .boxed()
        }
    }

    fn settings() -> ProbeSettings {
        ProbeSettings::new(Duration::from_secs(1), 16, 22)
    }

    #[test]
    fn timeout_is_clamped() {
        assert_eq!(
            ProbeSettings::new(Duration::from_secs(30), 0, 22),
            ProbeSettings {
                timeout: MAX_PROBE_TIMEOUT,
                concurrency: 1,
                ssh_port: 22
            }
        );
        assert_eq!(
            ProbeSettings::new(Duration::ZERO, 4, 22).timeout,
            MIN_PROBE_TIMEOUT
        );
    }

    #[test]
    fn getent_output_yields_the_canonical_name() {
        assert_eq!(
            parse_getent_hosts("192.168.1.40    Pi-Node-3.local pi-node-3\n").as_deref(),
            Some("pi-node-3.local")
        );
        assert_eq!(parse_getent_hosts("192.168.1.40\n"), None);
        assert_eq!(parse_getent_hosts(""), None);
    }

    #[tokio::test]
    async fn tcp_alone_counts_as_reachable() {
        let probe = Arc::new(FakeProbe {
            delay: Duration::from_millis(5),
            answers: HashMap::from([
                ("10.0.0.1".to_string(), (true, true)),
                ("10.0.0.2".to_string(), (false, true)),
                ("10.0.0.3".to_string(), (true, false)),
                ("10.0.0.4".to_string(), (false, false)),
            ]),
        });
        let devices = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]
            .into_iter()
            .map(Device::new)
            .collect();
        let report = probe_fleet(probe, devices, &settings()).await;
        let reachable: Vec<&str> = report.reachable.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(reachable, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(report.unreachable.len(), 1);
        assert_eq!(report.unreachable[0].address, "10.0.0.4");
        assert!(report.reachable[1].ssh_port_open);
        assert!(!report.reachable[2].ssh_port_open);
    }

    #[tokio::test]
    async fn probes_run_concurrently() {
        let delay = Duration::from_millis(400);
        let addresses: Vec<String> = (1..=12).map(|i| format!("10.0.1.{i}")).collect();
        let probe = Arc::new(FakeProbe {
            delay,
            answers: addresses
                .iter()
                .map(|addr| (addr.clone(), (false, true)))
                .collect(),
        });
        let devices = addresses.iter().map(Device::new).collect();
        let started = Instant::now();
        let report = probe_fleet(probe, devices, &settings()).await;
        let elapsed = started.elapsed();
        assert_eq!(report.reachable.len(), 12);
        assert!(
            elapsed < delay * 3,
            "12 probes took {elapsed:?}, expected close to one probe delay"
        );
    }

    #[tokio::test]
    async fn concurrency_cap_is_respected() {
        let delay = Duration::from_millis(150);
        let probe = Arc::new(FakeProbe {
            delay,
            answers: HashMap::new(),
        });
        let devices = (1..=4).map(|i| Device::new(format!("10.0.2.{i}"))).collect();
        let started = Instant::now();
        let report = probe_fleet(
            probe,
            devices,
            &ProbeSettings::new(Duration::from_secs(1), 2, 22),
        )
        .await;
        assert_eq!(report.unreachable.len(), 4);
        assert!(started.elapsed() >= delay * 2);
    }
}
