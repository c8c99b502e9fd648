//! Worker contract shared by every role the supervisor runs

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::broker::Broker;
use crate::error::Result;
use crate::settings::Settings;

/// Everything a worker may bind to during one generation.
#[derive(Clone)]
pub struct GenerationContext {
    pub generation: u64,
    pub broker: Arc<dyn Broker>,
    pub settings: Arc<Settings>,
}

impl std::fmt::Debug for GenerationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationContext")
            .field("generation", &self.generation)
            .field("client", &self.settings.client.name)
            .finish()
    }
}

/// One worker role: keepalive, subscriber or check runner.
///
/// `init` binds resources and must leave nothing running on failure.
/// `start` runs until the shutdown signal fires and returns once the worker
/// has fully stopped; returning early is reported to the supervisor as a
/// worker failure.
#[async_trait]
pub trait Processor: Send + 'static {
    fn name(&self) -> &'static str;

    async fn init(&mut self, ctx: &GenerationContext) -> Result<()>;

    async fn start(&mut self, shutdown: Shutdown) -> Result<()>;
}

/// Receiving side of a generation's stop broadcast.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Resolves once shutdown was requested (or the trigger was dropped).
    pub async fn requested(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Sending side of a generation's stop broadcast.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

/// Sent by the supervisor to ask a generation to stop.
#[derive(Debug)]
pub struct StopToken(pub(crate) ());

/// Sent back by a generation once every worker acknowledged the stop.
#[derive(Debug)]
pub struct DoneToken(pub(crate) ());
