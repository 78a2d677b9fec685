//! Persona kernel - command line entry point.
//!
//! - `persona run <identity>`: run one identity until SIGINT/SIGTERM
//! - `persona check <identity>`: validate the identity file and plugin names

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use persona_kernel::identity::{FileIdentityLoader, IdentityLoader};
use persona_kernel::plugin::PluginRegistry;
use persona_kernel::{Config, Orchestrator, Result};

#[derive(Debug, Parser)]
#[command(name = "persona", version, about = "Run an autonomous persona")]
struct Cli {
    /// Kernel config file (YAML or JSON). Defaults apply when omitted.
    #[arg(long, global = true, env = "PERSONA_CONFIG")]
    config: Option<PathBuf>,

    /// Directory containing `<identity>/identity.yaml`.
    #[arg(long, global = true)]
    identities_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an identity until interrupted.
    Run { identity: String },
    /// Validate an identity without running it.
    Check { identity: String },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    if let Some(dir) = &cli.identities_dir {
        config.paths.identities_dir = dir.clone();
    }
    Ok(config)
}

async fn run(identity: String, config: Config) -> Result<()> {
    let orchestrator = Orchestrator::builder(identity, config).build()?;
    orchestrator.run().await
}

async fn check(identity: String, config: Config) -> Result<()> {
    let loader = FileIdentityLoader::new(config.paths.identities_dir.clone());
    let identity = loader.load(&identity).await?;
    let registry = PluginRegistry::with_builtins();

    let mut unknown = Vec::new();
    for name in &identity.plugins {
        if !registry.contains(name) {
            unknown.push(name.as_str());
        }
    }
    if !unknown.is_empty() {
        return Err(persona_kernel::Error::validation(format!(
            "unknown plugins: {} (available: {})",
            unknown.join(", "),
            registry.names().join(", ")
        )));
    }

    println!(
        "{}: ok ({} plugins, poll every {:?})",
        identity.name,
        identity.plugins.len(),
        identity.poll_interval
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("persona: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize observability
    persona_kernel::observability::init_tracing_with(&config.observability);

    let result = match cli.command {
        Command::Run { identity } => {
            tracing::info!("persona_starting: identity={}", identity);
            run(identity, config).await
        }
        Command::Check { identity } => check(identity, config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("persona_failed: error={}", e);
            eprintln!("persona: {e}");
            ExitCode::FAILURE
        }
    }
}
