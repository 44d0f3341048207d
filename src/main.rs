use anyhow::{Context, Result};
use calltrack::{
    cli::{Cli, Commands},
    config::AgentConfig,
    replay,
};
use clap::Parser;
use std::io::Write;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    match path {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(AgentConfig::default()),
    }
}

fn run_replay(
    scenario_path: &Path,
    config_path: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let scenario = replay::Scenario::from_file(scenario_path)?;
    let result = replay::replay(&scenario, config)
        .with_context(|| format!("Failed to replay {}", scenario_path.display()))?;
    let ndjson = result.to_ndjson();

    match output {
        Some(path) => std::fs::write(path, &ndjson)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => std::io::stdout()
            .lock()
            .write_all(ndjson.as_bytes())
            .context("Failed to write to stdout")?,
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    match args.command {
        Commands::Replay {
            scenario,
            config,
            output,
        } => run_replay(&scenario, config.as_deref(), output.as_deref()),
        Commands::CheckConfig { file } => {
            let config = load_config(Some(&file))?;
            println!(
                "{}: ok (service {}, breakdown metrics {})",
                file.display(),
                config.service_name,
                if config.breakdown_metrics { "on" } else { "off" }
            );
            Ok(())
        }
    }
}
