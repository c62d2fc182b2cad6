//! Switchyard CLI Application
//!
//! Loads a policy topology, replays a scenario of policy commands against a
//! recording hardware client and prints the resulting state.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use switchyard_core::domain::audio::{DeviceCategory, StreamType};
use switchyard_core::domain::command::{CommandExecutor, PolicyCommand};
use switchyard_core::domain::config::{ConfigManager, ConfigWatcher, PolicyConfig};
use switchyard_core::domain::volume::vol_index_to_db;
use switchyard_infra::{PolicyService, RecordingHal, SettleMode};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "Audio routing policy simulator", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Topology file; the user policy file is used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a scenario and print the final policy state
    Run {
        /// TOML file with a `[[step]]` list of commands
        #[arg(short, long)]
        scenario: Option<PathBuf>,

        /// Print results and the final state as JSON
        #[arg(long)]
        json: bool,

        /// Do not wait for routing changes to settle
        #[arg(long)]
        no_wait: bool,
    },
    /// Print the factory topology as TOML
    DefaultConfig,
    /// Check topology files in the config directory whenever they change
    Watch,
    /// Print the volume curves of the topology in dB per index
    Curves {
        /// Only this stream type, e.g. `music`
        #[arg(long)]
        stream: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct Scenario {
    #[serde(default)]
    step: Vec<PolicyCommand>,
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<PolicyConfig> {
    match path {
        Some(path) => PolicyConfig::load_from_file(path)
            .await
            .with_context(|| format!("loading topology {}", path.display())),
        None => {
            let manager = ConfigManager::new(ConfigManager::default_config_dir()?);
            Ok(manager.load().await)
        }
    }
}

async fn load_scenario(path: Option<&Path>) -> anyhow::Result<Scenario> {
    let Some(path) = path else {
        return Ok(Scenario::default());
    };
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading scenario {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parsing scenario {}", path.display()))
}

async fn run(config: PolicyConfig, scenario: Scenario, json: bool, no_wait: bool) -> anyhow::Result<()> {
    let mode = if no_wait { SettleMode::Report } else { SettleMode::Wait };
    let service = PolicyService::start(RecordingHal::new(), &config)
        .context("starting the policy")?
        .with_settle_mode(mode);

    for (index, step) in scenario.step.into_iter().enumerate() {
        let result = service.execute(step.clone()).await;
        if json {
            println!("{}", serde_json::to_string(&result)?);
        } else {
            println!("[{}] {:?} -> {:?}", index + 1, step, result);
        }
        if result.is_error() {
            tracing::warn!(step = index + 1, "Scenario step failed");
        }
    }

    let dump = service.dump().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&dump)?);
    } else {
        println!("{}", dump);
    }
    Ok(())
}

/// Boot a policy over a recording client to prove a topology usable
async fn check_topology(path: &Path) -> anyhow::Result<usize> {
    let config = PolicyConfig::load_from_file(path).await?;
    let service = PolicyService::start(RecordingHal::new(), &config)?;
    Ok(service.dump().await.outputs.len())
}

async fn watch(config_dir: PathBuf) -> anyhow::Result<()> {
    let watcher = ConfigWatcher::new(config_dir.clone())
        .await
        .with_context(|| format!("watching {}", config_dir.display()))?;
    let mut changes = watcher.subscribe();
    tracing::info!(path = %config_dir.display(), "Waiting for topology changes, Ctrl-C to stop");
    loop {
        tokio::select! {
            changed = changes.recv() => {
                let path = match changed {
                    Ok(path) => path,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Topology changes dropped");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                };
                match check_topology(&path).await {
                    Ok(outputs) => println!("{}: ok, {} outputs open", path.display(), outputs),
                    Err(e) => println!("{}: {:#}", path.display(), e),
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn print_curves(config: &PolicyConfig, stream: Option<&str>) -> anyhow::Result<()> {
    let table = config.volume_table()?;
    let streams = match stream {
        Some(name) => {
            let stream: StreamType = serde_json::from_value(serde_json::Value::String(name.to_string()))
                .with_context(|| format!("unknown stream type {}", name))?;
            vec![stream]
        }
        None => StreamType::ALL.to_vec(),
    };
    for stream in streams {
        let desc = table.stream(stream);
        for category in DeviceCategory::ALL {
            let curve = table.curve(stream, category);
            let points: Vec<String> = (desc.index_min..=desc.index_max)
                .map(|i| format!("{:.1}", vol_index_to_db(curve, i, desc.index_min, desc.index_max)))
                .collect();
            println!("{:<16} {:<10} {}", stream.to_string(), format!("{:?}", category), points.join(" "));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.unwrap_or(Command::Run {
        scenario: None,
        json: false,
        no_wait: false,
    }) {
        Command::Run {
            scenario,
            json,
            no_wait,
        } => {
            let config = load_config(cli.config.as_deref()).await?;
            let scenario = load_scenario(scenario.as_deref()).await?;
            tracing::info!(steps = scenario.step.len(), topology = %config.global.name, "Switchyard starting");
            run(config, scenario, json, no_wait).await
        }
        Command::DefaultConfig => {
            print!("{}", toml::to_string_pretty(&PolicyConfig::factory_default())?);
            Ok(())
        }
        Command::Watch => {
            let dir = match cli.config {
                Some(path) => path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(".")),
                None => ConfigManager::default_config_dir()?,
            };
            watch(dir).await
        }
        Command::Curves { stream } => {
            let config = load_config(cli.config.as_deref()).await?;
            print_curves(&config, stream.as_deref())
        }
    }
}
