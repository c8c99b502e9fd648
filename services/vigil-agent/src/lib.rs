//! # Vigil Agent
//!
//! Wiring for the `vigil-agent` binary: command line, logging sink, signal
//! forwarding and the per-generation worker set.

pub mod cli;
pub mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use check_engine::{request_channel, CheckRunner, PluginRegistry};
use message_queue::{Keepalive, Subscriber};
use tracing::Dispatch;
use tracing_subscriber::EnvFilter;
use vigil_core::{Processor, ProcessorFactory};

pub use cli::Cli;
pub use signals::forward_signals;

/// Requests buffered between the subscriber and the runner. The subscriber
/// waits for each reply, so one slot per generation is all that is used.
const REQUEST_QUEUE_DEPTH: usize = 16;

/// Build the logging sink handed to the supervisor.
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn log_dispatch(quiet: bool) -> Dispatch {
    if quiet {
        return Dispatch::none();
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    Dispatch::new(subscriber)
}

/// Fresh keepalive, subscriber and check runner for every generation. The
/// subscriber and runner share a request channel that dies with them.
pub fn worker_factory(
    registry: Arc<PluginRegistry>,
    stat_store: Option<PathBuf>,
) -> Arc<dyn ProcessorFactory> {
    Arc::new(move || {
        let (dispatcher, requests) = request_channel(REQUEST_QUEUE_DEPTH);
        vec![
            Box::new(Keepalive::new()) as Box<dyn Processor>,
            Box::new(Subscriber::new(Arc::new(dispatcher))),
            Box::new(
                CheckRunner::new(Arc::clone(&registry), requests)
                    .with_stat_store(stat_store.clone()),
            ),
        ]
    })
}
