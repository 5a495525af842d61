#![forbid(unsafe_code)]

use clap::Parser;
use std::io::Write;
use std::time::Duration;
use tether_common::{Cause, Outcome};
use tether_controller::config::{load_config, resolve_data_path, Cli, Commands, ControllerConfig};
use tether_controller::{connect, keyfile, ConnectOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(cli: &Cli) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(cli: &Cli) -> anyhow::Result<ControllerConfig> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(ref agent) = cli.agent {
        config.agent = agent.clone();
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    Ok(config)
}

async fn run_task(
    config: &ControllerConfig,
    task: &str,
    payload: &str,
    interrupt_after_ms: Option<u64>,
    user: &str,
) -> anyhow::Result<bool> {
    let options = ConnectOptions::from_config(config)?;
    let remote = connect(config, &options).await?;
    info!(agent = %config.agent, banner = remote.banner(), "connected");

    let pending = remote.dispatch(task, payload.as_bytes()).await?;
    if let Some(ms) = interrupt_after_ms {
        let id = pending.id();
        tokio::time::sleep(Duration::from_millis(ms)).await;
        remote.interrupt(id, vec![Cause::user(user)]).await?;
    }
    let outcome = pending.outcome().await?;
    remote.close().await;

    let mut stdout = std::io::stdout().lock();
    match &outcome {
        Outcome::Success(value) => {
            stdout.write_all(value)?;
            if !value.ends_with(b"\n") {
                writeln!(stdout)?;
            }
        }
        Outcome::Failure(message) => eprintln!("task failed: {message}"),
        Outcome::Interrupted(causes) => {
            let causes: Vec<String> = causes.iter().map(ToString::to_string).collect();
            eprintln!("task interrupted: {}", causes.join(", "));
        }
    }
    Ok(matches!(outcome, Outcome::Success(_)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match &cli.command {
        Commands::Run {
            task,
            payload,
            interrupt_after_ms,
            user,
        } => {
            let config = load(&cli)?;
            if !run_task(&config, task, payload, *interrupt_after_ms, user).await? {
                std::process::exit(1);
            }
        }
        Commands::Heartbeat => {
            let config = load(&cli)?;
            let heartbeat = config.heartbeat();
            if heartbeat.is_disabled() {
                println!("heartbeat disabled");
            } else {
                println!(
                    "interval {}s, timeout {}s",
                    heartbeat.interval.as_secs(),
                    heartbeat.timeout.as_secs()
                );
            }
        }
        Commands::Keygen { path } => {
            let path = path.clone().unwrap_or_else(|| resolve_data_path("session.key"));
            keyfile::generate_secret_file(&path)?;
            println!("wrote session secret to {}", path.display());
        }
    }

    Ok(())
}
