use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{error, info, warn};

use syndicate::catalog;
use syndicate::runtime::Sweep;
use syndicate::sequencer::RecordingSender;
use syndicate::telemetry;
use syndicate::{AgentRegistry, InMemoryStore, Notice, Op, Runtime, Settings};

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Tiered agent delegation runtime
#[derive(Debug, Parser)]
#[command(name = "syndicate", version, about)]
struct Cli {
    /// Settings file (TOML)
    #[arg(short, long, env = "SYNDICATE_CONFIG")]
    config: Option<PathBuf>,

    /// Run every sweep once and exit
    #[arg(long)]
    once: bool,
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    telemetry::init(&settings.telemetry);

    let registry = Arc::new(
        AgentRegistry::new(catalog::default_registrations(&settings.delegation)?)
            .context("invalid agent catalog")?,
    );
    let (runtime, channel) = Runtime::with_channel(
        registry,
        Arc::new(InMemoryStore::new()),
        Arc::new(RecordingSender::new()),
        catalog::default_event_rules(),
        settings.clone(),
    );

    if cli.once {
        let summary = runtime.maintenance_tick().await?;
        info!(?summary, "Maintenance pass finished");
        return Ok(());
    }

    let mut runtime_task = tokio::spawn(runtime.run());

    let notices = channel.clone();
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice {
                Notice::Error { sub_id, response } => {
                    warn!(%sub_id, errors = ?response.errors, "Operation failed")
                }
                Notice::ShuttingDown { .. } => break,
                other => info!(notice = ?other, "Runtime notice"),
            }
        }
    });

    let mut sagas = ticker(Duration::from_secs(settings.saga.resume_interval_secs));
    let mut events = ticker(Duration::from_secs(settings.events.replay_interval_secs));
    let mut sequences = ticker(Duration::from_secs(settings.sequencer.sweep_interval_secs));
    let mut retention = ticker(RETENTION_INTERVAL);

    loop {
        let sweep = tokio::select! {
            _ = sagas.tick() => Sweep::Sagas,
            _ = events.tick() => Sweep::Events,
            _ = sequences.tick() => Sweep::Sequences,
            _ = retention.tick() => Sweep::Retention,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
            finished = &mut runtime_task => {
                return match finished {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        error!(error = %e, "Runtime stopped");
                        Err(e.into())
                    }
                    Err(e) => Err(e).context("runtime task aborted"),
                };
            }
        };
        channel.send(Op::sweep(sweep))?;
    }

    channel.send(Op::shutdown())?;
    runtime_task.await.context("runtime task aborted")??;
    Ok(())
}
