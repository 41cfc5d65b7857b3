use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::HostKeyPolicy;
use crate::steps::{BootstrapStep, StepSet};

#[derive(Parser)]
#[command(name = "swarmctl", version, about = "Raspberry Pi swarm bootstrap CLI")]
pub struct Cli {
    /// Config file (defaults to $SWARMCTL_CONFIG or ./swarmctl.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Probe devices and run the bootstrap steps on every reachable one.
    Bootstrap(BootstrapArgs),
    /// Resolve and probe devices without touching them.
    Probe(ProbeArgs),
    /// Create the local ed25519 key pair if it does not exist.
    Keygen(KeygenArgs),
    /// Print a host's SSH key fingerprint and known_hosts line.
    ScanHostKey(ScanHostKeyArgs),
}

#[derive(Args, Clone, Default)]
pub struct TargetArgs {
    /// Comma-separated IPv4 addresses or hostnames.
    #[arg(long, value_delimiter = ',')]
    pub hosts: Vec<String>,
    /// Sweep the local /24 for devices.
    #[arg(long, default_value_t = false)]
    pub scan: bool,
    /// /24 to sweep instead of the local one, e.g. 192.168.1.
    #[arg(long)]
    pub subnet: Option<String>,
    /// Per-probe timeout in seconds (1-5).
    #[arg(long)]
    pub probe_timeout: Option<u64>,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Clone, Default)]
pub struct CredentialFlags {
    #[arg(long)]
    pub user: Option<String>,
    /// Name of an environment variable holding the SSH password.
    #[arg(long, value_name = "VAR")]
    pub password_env: Option<String>,
    /// Private key path.
    #[arg(long)]
    pub key: Option<PathBuf>,
    /// Never prompt; missing credentials are an error.
    #[arg(long, default_value_t = false)]
    pub non_interactive: bool,
}

#[derive(Args)]
pub struct BootstrapArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    #[command(flatten)]
    pub credentials: CredentialFlags,
    /// Preset step selection.
    #[arg(long, value_enum)]
    pub steps: Option<StepSet>,
    /// Individual step; may be repeated. Combined with --steps.
    #[arg(long = "step", value_enum)]
    pub step: Vec<BootstrapStep>,
    /// Generate the key pair first when it does not exist.
    #[arg(long, default_value_t = false)]
    pub generate_key: bool,
    #[arg(long)]
    pub domain: Option<String>,
    #[arg(long)]
    pub email: Option<String>,
    #[arg(long)]
    pub manager: Option<String>,
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Per-command timeout for step actions, in seconds.
    #[arg(long)]
    pub step_timeout: Option<u64>,
    /// Overall deadline in seconds; devices not yet started are cancelled.
    #[arg(long)]
    pub deadline: Option<u64>,
    #[arg(long, value_enum)]
    pub host_key_policy: Option<HostKeyPolicy>,
}

#[derive(Args)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Args)]
pub struct KeygenArgs {
    #[arg(long)]
    pub key: Option<PathBuf>,
    #[arg(long, default_value = "swarmctl")]
    pub comment: String,
}

#[derive(Args)]
pub struct ScanHostKeyArgs {
    #[arg(long)]
    pub host: String,
    #[arg(long, default_value_t = 22)]
    pub port: u16,
    #[arg(long, default_value_t = 5)]
    pub timeout_secs: u64,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bootstrap_flags_parse() {
        let cli = Cli::try_parse_from([
            "swarmctl",
            "bootstrap",
            "--hosts",
            "10.0.0.2,10.0.0.3",
            "--user",
            "pi",
            "--password-env",
            "PI_PASSWORD",
            "--steps",
            "storage-only",
            "--step",
            "join-swarm",
            "--non-interactive",
            "--json",
        ])
        .expect("parse");
        let Commands::Bootstrap(args) = cli.command else {
            panic!("expected bootstrap");
        };
        assert_eq!(args.target.hosts, vec!["10.0.0.2", "10.0.0.3"]);
        assert_eq!(args.steps, Some(StepSet::StorageOnly));
        assert_eq!(args.step, vec![BootstrapStep::JoinSwarm]);
        assert_eq!(args.credentials.password_env.as_deref(), Some("PI_PASSWORD"));
        assert!(args.credentials.non_interactive);
        assert!(args.target.json);
    }

    #[test]
    fn scan_host_key_defaults() {
        let cli = Cli::try_parse_from(["swarmctl", "scan-host-key", "--host", "pi.local"])
            .expect("parse");
        let Commands::ScanHostKey(args) = cli.command else {
            panic!("expected scan-host-key");
        };
        assert_eq!(args.port, 22);
        assert!(!args.json);
    }
}
