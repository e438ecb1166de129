//! Command-line interface for the MTC agent.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mtc_core::config::env_vars;
use mtc_core::AgentConfig;
use mtc_devices::{Agent, MultilineAssembler, ProtocolCommand};
use tracing::{info, warn};

/// MTC Agent - replay adapter streams against device schemas.
#[derive(Parser, Debug)]
#[command(name = "mtc")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Replay an adapter capture against a schema.
    Replay {
        /// Device schema document (JSON).
        #[arg(long)]
        schema: PathBuf,
        /// Adapter capture, one line per batch.
        #[arg(long)]
        shdr: PathBuf,
        /// Device uuid; defaults to the first device in the schema.
        #[arg(short, long)]
        device: Option<String>,
        /// Print the current value of every data item afterwards.
        #[arg(long)]
        current: bool,
        /// Print buffered observations starting at this sequence.
        #[arg(long)]
        from: Option<u64>,
        /// Number of observations to print with --from.
        #[arg(long, default_value_t = 100)]
        count: usize,
        /// Treat the end of the capture as an adapter disconnect.
        #[arg(long)]
        disconnect: bool,
    },
    /// Print the probe summary for a schema.
    Probe {
        /// Device schema document (JSON).
        #[arg(long)]
        schema: PathBuf,
        /// Device uuid; all devices when omitted.
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Check whether a path expression selects any data item.
    CheckPath {
        /// Device schema document (JSON).
        #[arg(long)]
        schema: PathBuf,
        /// Path expression; alternatives separated by `|`.
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };
        tracing_subscriber::EnvFilter::new("warn").add_directive(
            format!("mtc={}", level)
                .parse()
                .unwrap_or_else(|_| tracing::Level::INFO.into()),
        )
    });

    // Logs go to stderr so stdout stays machine readable.
    if env_vars::log_json() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }

    let config = AgentConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Command::Replay {
            schema,
            shdr,
            device,
            current,
            from,
            count,
            disconnect,
        } => {
            run_replay(
                config,
                &schema,
                &shdr,
                device,
                ReplayOutput {
                    current,
                    from,
                    count,
                    disconnect,
                },
            )
            .await
        }
        Command::Probe { schema, device } => run_probe(config, &schema, device.as_deref()).await,
        Command::CheckPath { schema, path } => run_check_path(config, &schema, &path).await,
    }
}

struct ReplayOutput {
    current: bool,
    from: Option<u64>,
    count: usize,
    disconnect: bool,
}

/// Build an agent and ingest the schema file. Returns the first device uuid.
async fn load_agent(config: AgentConfig, schema: &Path) -> Result<(Agent, String)> {
    let text = tokio::fs::read_to_string(schema)
        .await
        .with_context(|| format!("Failed to read schema {}", schema.display()))?;
    let agent = Agent::new(config)?;
    let outcomes = agent.ingest_schema(&text)?;
    let first = outcomes
        .first()
        .map(|o| o.uuid.clone())
        .context("Schema declares no devices")?;
    Ok((agent, first))
}

async fn run_replay(
    config: AgentConfig,
    schema: &Path,
    shdr: &Path,
    device: Option<String>,
    output: ReplayOutput,
) -> Result<()> {
    let (agent, first) = load_agent(config, schema).await?;
    let mut uuid = device.unwrap_or(first);

    let capture = tokio::fs::read_to_string(shdr)
        .await
        .with_context(|| format!("Failed to read capture {}", shdr.display()))?;

    let mut assembler = MultilineAssembler::new();
    let (mut lines, mut committed, mut rejected, mut assets) = (0usize, 0usize, 0usize, 0usize);
    for raw in capture.lines() {
        let Some(line) = assembler.push(raw) else {
            continue;
        };
        let outcome = agent.process_line(&uuid, &line)?;
        lines += 1;
        committed += outcome.observations.len();
        rejected += outcome.rejected.len();
        assets += outcome.assets.len();

        // Follow uuid changes so later lines still resolve.
        if agent.registry().table(&uuid).is_err() {
            if let Some(ProtocolCommand::Uuid(new_uuid)) = &outcome.command {
                uuid = new_uuid.clone();
            }
        }
    }
    if assembler.is_pending() {
        warn!(category = "cli", "Capture ended inside a multiline block");
    }
    if output.disconnect {
        agent.device_disconnected(&uuid)?;
    }

    info!(
        category = "cli",
        uuid = %uuid,
        lines,
        committed,
        rejected,
        assets,
        "Replay complete"
    );

    if output.current {
        let mut snapshot = agent.current_snapshot();
        snapshot.sort_by_key(|o| o.sequence);
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    if let Some(from) = output.from {
        let observations = agent.range(from, output.count)?;
        println!("{}", serde_json::to_string_pretty(&observations)?);
    }
    if !output.current && output.from.is_none() {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "device": uuid,
                "lines": lines,
                "committed": committed,
                "rejected": rejected,
                "assets": assets,
                "buffer": agent.store().stats().len,
            }))?
        );
    }
    Ok(())
}

async fn run_probe(config: AgentConfig, schema: &Path, device: Option<&str>) -> Result<()> {
    let (agent, _) = load_agent(config, schema).await?;
    let probe = agent.probe(device)?;
    println!("{}", probe.to_json()?);
    Ok(())
}

async fn run_check_path(config: AgentConfig, schema: &Path, path: &str) -> Result<()> {
    let (agent, _) = load_agent(config, schema).await?;
    if !agent.path_exists(path) {
        anyhow::bail!("No data item matches {}", path);
    }
    println!("match");
    Ok(())
}
