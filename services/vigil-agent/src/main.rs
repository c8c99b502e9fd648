//! # Vigil Agent
//!
//! Loads settings, then runs keepalives, subscriptions and checks until
//! interrupted. SIGHUP reloads settings and restarts the workers.

use std::process;
use std::sync::Arc;

use anyhow::Context;
use check_engine::PluginRegistry;
use clap::{CommandFactory, Parser};
use message_queue::AmqpBroker;
use tracing::instrument::WithSubscriber;
use tracing::{error, info, warn, Dispatch};
use vigil_agent::{forward_signals, log_dispatch, worker_factory, Cli};
use vigil_core::{Broker, Exit, LoadSettings, Supervisor, BUILD_INFO};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let dispatch = log_dispatch(cli.quiet);
    let exit = run(cli, dispatch.clone()).with_subscriber(dispatch).await?;
    process::exit(exit.code())
}

async fn run(cli: Cli, dispatch: Dispatch) -> anyhow::Result<Exit> {
    info!("Starting {}", BUILD_INFO);

    let loader = cli.loader();
    let settings = match loader.load() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "could not load settings");
            eprintln!("vigil-agent: {err}\n");
            Cli::command()
                .print_help()
                .context("printing usage")?;
            return Ok(Exit::SettingsFailed);
        }
    };
    info!(
        client = %settings.client.name,
        subscriptions = ?settings.client.subscriptions,
        checks = settings.checks.len(),
        "settings loaded"
    );

    let signals = forward_signals().context("installing signal handlers")?;
    // Connection settings are read once; a reload keeps the same broker.
    info!(broker = %settings.rabbitmq.redacted_uri(), "using broker");
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(settings.rabbitmq.uri()));
    let registry = Arc::new(PluginRegistry::with_builtin());

    let exit = Supervisor::new(
        broker,
        Arc::new(loader),
        worker_factory(registry, cli.stat_store.clone()),
        dispatch,
    )
    .run(settings, signals)
    .await;

    match exit {
        Exit::Clean => info!("Vigil Agent stopped"),
        Exit::Forced => warn!("Vigil Agent stopped without draining"),
        Exit::SettingsFailed | Exit::StartupFailed => error!(?exit, "Vigil Agent gave up"),
    }
    Ok(exit)
}
