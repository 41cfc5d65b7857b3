//! Command handlers behind the CLI.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::certs::{
    certificate_name, generate_self_signed, letsencrypt_request, SELF_SIGNED_FALLBACK_DOMAIN,
};
use crate::cli::{
    BootstrapArgs, CredentialFlags, KeygenArgs, ProbeArgs, ScanHostKeyArgs, TargetArgs,
};
use crate::config::SwarmConfig;
use crate::credentials::{
    resolve_credentials, CredentialArgs, Credentials, DialoguerPrompter, Prompter, Secret, KEY_ENV,
};
use crate::device::Device;
use crate::error::BootstrapError;
use crate::inventory::{resolve_inventory, InventoryRequest};
use crate::keys::{default_key_path, ensure_keypair, expand_home, read_public_key};
use crate::net::local_lan_ipv4;
use crate::probe::{probe_fleet, ProbeReport, ProbeSettings, SystemProbe};
use crate::report::{probe_exit_code, render_probe_table, DeviceReport, FleetReport};
use crate::sequencer::{Sequencer, SequencerSettings};
use crate::steps::{normalize_plan, BootstrapStep, CertificatePlan, StepContext, StorageTarget};
use crate::swarm::{SwarmJoiner, SwarmPrepare};
use crate::transport::ssh::{scan_host_key as scan_key, Ssh2Transport};
use crate::transport::Transport;
use crate::util::non_empty;

pub fn selected_plan(args: &BootstrapArgs) -> Vec<BootstrapStep> {
    let mut selection: Vec<BootstrapStep> =
        args.steps.map(|set| set.steps()).unwrap_or_default();
    selection.extend(args.step.iter().copied());
    if selection.is_empty() {
        return BootstrapStep::ALL.to_vec();
    }
    normalize_plan(selection)
}

fn probe_settings(config: &SwarmConfig, target: &TargetArgs) -> ProbeSettings {
    let mut settings = ProbeSettings::from_config(config);
    if let Some(secs) = target.probe_timeout {
        settings = ProbeSettings::new(
            Duration::from_secs(secs),
            settings.concurrency,
            settings.ssh_port,
        );
    }
    settings
}

/// Key path from the same sources the credential broker uses, without
/// requiring the file to exist yet.
fn requested_key_path(flag: Option<&PathBuf>, config: &SwarmConfig) -> Option<PathBuf> {
    flag.cloned()
        .or_else(|| non_empty(std::env::var(KEY_ENV).ok()).map(PathBuf::from))
        .or_else(|| config.ssh.key_path.clone())
        .map(|path| expand_home(&path))
        .or_else(default_key_path)
}

fn credentials_from_flags(
    flags: &CredentialFlags,
    config: &SwarmConfig,
) -> Result<Credentials, BootstrapError> {
    let password = password_from_env(flags.password_env.as_deref(), |name| {
        std::env::var(name).ok()
    })?;
    let explicit = CredentialArgs {
        user: flags.user.clone(),
        password,
        key_path: flags.key.clone(),
    };
    let interactive = !flags.non_interactive && std::io::stdin().is_terminal();
    let mut prompter = DialoguerPrompter;
    resolve_credentials(
        &explicit,
        |name| std::env::var(name).ok(),
        &config.ssh,
        default_key_path(),
        interactive.then_some(&mut prompter as &mut dyn Prompter),
    )
}

/// Reads the password from the variable named by `--password-env`. Naming a
/// variable that is unset or empty is an error rather than a silent fallback.
fn password_from_env(
    var: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<Secret>, BootstrapError> {
    let Some(var) = var else {
        return Ok(None);
    };
    match non_empty(lookup(var)) {
        Some(password) => Ok(Some(Secret::new(password))),
        None => Err(BootstrapError::Credential(format!(
            "--password-env names {var}, which is unset or empty"
        ))),
    }
}

async fn discover(
    config: &SwarmConfig,
    target: &TargetArgs,
) -> Result<(ProbeReport, Vec<Device>), BootstrapError> {
    let settings = probe_settings(config, target);
    let request = InventoryRequest {
        hosts: target.hosts.clone(),
        config_hosts: config.inventory.hosts.clone(),
        scan: target.scan,
        subnet: target.subnet.clone().or_else(|| config.inventory.subnet.clone()),
    };
    let local_ip = if target.scan { local_lan_ipv4() } else { None };
    let probe = Arc::new(SystemProbe);
    let devices = resolve_inventory(&request, probe.clone(), &settings, local_ip).await?;
    tracing::info!(count = devices.len(), "probing devices");
    let report = probe_fleet(probe, devices.clone(), &settings).await;
    Ok((report, devices))
}

pub async fn probe(config: SwarmConfig, args: ProbeArgs) -> Result<u8> {
    let (report, devices) = discover(&config, &args.target).await?;
    let by_address: HashMap<&str, &Device> = report
        .reachable
        .iter()
        .chain(report.unreachable.iter())
        .map(|d| (d.address.as_str(), d))
        .collect();
    let probed: Vec<Device> = devices
        .iter()
        .filter_map(|d| by_address.get(d.address.as_str()).map(|d| (*d).clone()))
        .collect();
    if args.target.json {
        println!("{}", serde_json::to_string_pretty(&probed)?);
    } else {
        print!("{}", render_probe_table(&probed));
    }
    Ok(probe_exit_code(&probed))
}

fn cancel_on_signal_or_deadline(deadline: Option<Duration>) -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; finishing in-flight steps");
            on_signal.cancel();
        }
    });
    if let Some(deadline) = deadline {
        let on_deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            tracing::warn!(
                secs = deadline.as_secs(),
                "deadline reached; cancelling remaining work"
            );
            on_deadline.cancel();
        });
    }
    cancel
}

fn apply_overrides(config: &mut SwarmConfig, args: &BootstrapArgs) {
    if let Some(domain) = non_empty(args.domain.clone()) {
        config.certificate.domain = Some(domain);
    }
    if let Some(email) = non_empty(args.email.clone()) {
        config.certificate.email = Some(email);
    }
    if let Some(manager) = non_empty(args.manager.clone()) {
        config.swarm.manager = Some(manager);
    }
    if let Some(concurrency) = args.concurrency.filter(|c| *c > 0) {
        config.bootstrap.concurrency = concurrency;
    }
    if let Some(timeout) = args.step_timeout.filter(|t| *t > 0) {
        config.bootstrap.step_timeout_secs = timeout;
    }
    if let Some(policy) = args.host_key_policy {
        config.ssh.host_key_policy = policy;
    }
}

fn certificate_plan(config: &SwarmConfig, plan: &[BootstrapStep]) -> Result<CertificatePlan> {
    let settings = &config.certificate;
    let domain = settings.domain.as_deref();
    let name = certificate_name(settings.name.as_deref(), domain);
    let letsencrypt = letsencrypt_request(domain, settings.email.as_deref());
    let self_signed = if plan.contains(&BootstrapStep::IssueCertificate) {
        let domain = domain.unwrap_or(SELF_SIGNED_FALLBACK_DOMAIN);
        let bundle = generate_self_signed(domain, settings.validity_days)
            .context("Failed to generate self-signed certificate")?;
        tracing::info!(
            sans = ?bundle.subject_alt_names,
            not_after = %bundle.not_after,
            "generated self-signed certificate"
        );
        Some(bundle)
    } else {
        None
    };
    Ok(CertificatePlan {
        name,
        letsencrypt,
        self_signed,
    })
}

pub async fn bootstrap(mut config: SwarmConfig, args: BootstrapArgs) -> Result<u8> {
    let started_at = Utc::now();
    apply_overrides(&mut config, &args);
    let plan = selected_plan(&args);
    tracing::info!(plan = ?plan.iter().map(|s| s.as_str()).collect::<Vec<_>>(), "bootstrap plan");

    if args.generate_key {
        let path = requested_key_path(args.credentials.key.as_ref(), &config)
            .context("Cannot determine a key path; pass --key")?;
        ensure_keypair(&path, "swarmctl")?;
    }
    let credentials = Arc::new(credentials_from_flags(&args.credentials, &config)?);

    let public_key = match credentials.key_path() {
        Some(path) => Some(read_public_key(path).map_err(|err| {
            BootstrapError::Credential(format!("{err:#}"))
        })?),
        None => None,
    };
    if public_key.is_none() && plan.contains(&BootstrapStep::InstallKey) {
        return Err(BootstrapError::Credential(
            "installing keys needs a local key pair; pass --generate-key or run `swarmctl keygen`"
                .to_string(),
        )
        .into());
    }

    let (probed, devices) = discover(&config, &args.target).await?;
    let unreachable: Vec<DeviceReport> = probed
        .unreachable
        .iter()
        .map(|device| {
            let err = BootstrapError::Probe {
                device: device.address.clone(),
                message: "no ICMP reply and SSH port closed".to_string(),
            };
            DeviceReport::unreachable(device, err.to_string())
        })
        .collect();

    let mut reports = unreachable;
    if probed.reachable.is_empty() {
        tracing::error!("no devices reachable");
    } else {
        let transport: Arc<dyn Transport> = Arc::new(Ssh2Transport::new(
            expand_home(&PathBuf::from(&config.ssh.known_hosts)),
            config.ssh.host_key_policy,
        ));
        let connect_timeout = Duration::from_secs(config.ssh.connect_timeout_secs);
        let swarm = if plan.contains(&BootstrapStep::JoinSwarm) {
            SwarmJoiner::new(
                transport.clone(),
                credentials.clone(),
                SwarmPrepare {
                    manager: config.swarm.manager.clone(),
                    join_token: config.swarm.join_token.clone(),
                    port: config.swarm.port,
                    ssh_port: config.ssh.port,
                    connect_timeout,
                },
            )
        } else {
            SwarmJoiner::unavailable("join-swarm is not part of this run")
        };
        let storage = config.storage_server().map(|server| StorageTarget {
            server: server.to_string(),
            volume: config.storage.volume.clone(),
            mount_point: config.storage.mount_point.clone(),
        });
        let context = StepContext {
            ssh_user: credentials.username.clone(),
            public_key,
            packages: config.bootstrap.packages.clone(),
            storage,
            swarm: Arc::new(swarm),
            certificate: certificate_plan(&config, &plan)?,
        };

        let sequencer = Sequencer::new(
            transport,
            credentials.clone(),
            Arc::new(context),
            plan.clone(),
            SequencerSettings {
                concurrency: config.bootstrap.concurrency,
                ssh_port: config.ssh.port,
                connect_timeout,
                step_timeout: Duration::from_secs(config.bootstrap.step_timeout_secs),
            },
        );
        let cancel = cancel_on_signal_or_deadline(args.deadline.map(Duration::from_secs));
        reports.extend(sequencer.run(probed.reachable, cancel).await);
    }

    let mut by_address: HashMap<String, DeviceReport> = reports
        .into_iter()
        .map(|report| (report.device.clone(), report))
        .collect();
    let fleet = FleetReport {
        started_at,
        finished_at: Utc::now(),
        plan,
        devices: devices
            .iter()
            .filter_map(|device| by_address.remove(&device.address))
            .collect(),
    };
    if args.target.json {
        println!("{}", serde_json::to_string_pretty(&fleet)?);
    } else {
        print!("{}", fleet.render_table());
    }
    Ok(fleet.exit_code())
}

pub fn keygen(config: &SwarmConfig, args: KeygenArgs) -> Result<u8> {
    let path = requested_key_path(args.key.as_ref(), config)
        .context("Cannot determine a key path; pass --key")?;
    if ensure_keypair(&path, &args.comment)? {
        eprintln!("Created {}", path.display());
    } else {
        eprintln!("Using existing {}", path.display());
    }
    println!("{}", read_public_key(&path)?);
    Ok(0)
}

pub fn scan_host_key(args: ScanHostKeyArgs) -> Result<u8> {
    let scan = scan_key(
        &args.host,
        args.port,
        Duration::from_secs(args.timeout_secs.max(1)),
    )
    .with_context(|| format!("Failed to scan host key for {}", args.host))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&scan)?);
    } else {
        println!("{} {}", scan.key_type, scan.fingerprint_sha256);
        println!("{}", scan.known_hosts_entry);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    fn bootstrap_args(extra: &[&str]) -> BootstrapArgs {
        let mut argv = vec!["swarmctl", "bootstrap"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).expect("parse").command {
            Commands::Bootstrap(args) => args,
            _ => panic!("expected bootstrap"),
        }
    }

    #[test]
    fn default_plan_is_full() {
        assert_eq!(selected_plan(&bootstrap_args(&[])), BootstrapStep::ALL.to_vec());
    }

    #[test]
    fn presets_and_single_steps_combine() {
        let plan = selected_plan(&bootstrap_args(&[
            "--steps",
            "certs-only",
            "--step",
            "install-packages",
        ]));
        assert_eq!(
            plan,
            vec![
                BootstrapStep::InstallKey,
                BootstrapStep::InstallPackages,
                BootstrapStep::IssueCertificate
            ]
        );
    }

    #[test]
    fn overrides_replace_config_values() {
        let mut config = SwarmConfig::default();
        config.certificate.domain = Some("old.example.com".to_string());
        apply_overrides(
            &mut config,
            &bootstrap_args(&[
                "--domain",
                "pi.example.com",
                "--manager",
                "10.0.0.2",
                "--concurrency",
                "0",
            ]),
        );
        assert_eq!(config.certificate.domain.as_deref(), Some("pi.example.com"));
        assert_eq!(config.swarm.manager.as_deref(), Some("10.0.0.2"));
        assert_eq!(config.bootstrap.concurrency, 16);
    }

    #[test]
    fn password_env_must_name_a_set_variable() {
        let lookup = |name: &str| (name == "PI_PASSWORD").then(|| "raspberry".to_string());
        assert!(password_from_env(None, lookup).expect("none").is_none());
        let secret = password_from_env(Some("PI_PASSWORD"), lookup)
            .expect("set")
            .expect("password");
        assert_eq!(secret.expose(), "raspberry");
        let err = password_from_env(Some("PI_PASSWRD"), lookup).expect_err("unset");
        assert!(matches!(err, BootstrapError::Credential(ref msg) if msg.contains("PI_PASSWRD")));
        assert!(!err.to_string().contains("raspberry"));
    }

    #[test]
    fn certificate_material_only_when_requested() {
        let config = SwarmConfig::default();
        let plan = certificate_plan(&config, &[BootstrapStep::InstallKey]).expect("plan");
        assert!(plan.self_signed.is_none());
        assert_eq!(plan.name, "piswarm");
        let plan = certificate_plan(&config, &BootstrapStep::ALL).expect("plan");
        assert!(plan.self_signed.is_some());
        assert!(plan.letsencrypt.is_none());
    }
}
