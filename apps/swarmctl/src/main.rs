use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

use swarmctl::app;
use swarmctl::cli::{Cli, Commands};
use swarmctl::config::{load_config, resolve_config_path};
use swarmctl::report::EXIT_FATAL;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,swarmctl=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

fn run(cli: Cli) -> Result<u8> {
    let config = load_config(&resolve_config_path(cli.config))?;
    match cli.command {
        Commands::Bootstrap(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(app::bootstrap(config, args))
        }
        Commands::Probe(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(app::probe(config, args))
        }
        Commands::Keygen(args) => app::keygen(&config, args),
        Commands::ScanHostKey(args) => app::scan_host_key(args),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing() {
        eprintln!("warning: {err}");
    }
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "swarmctl failed");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
