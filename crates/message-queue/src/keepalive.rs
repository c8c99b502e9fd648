//! Periodic liveness announcement on the `keepalives` exchange

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use vigil_core::exchanges::KEEPALIVES;
use vigil_core::{
    Broker, ExchangeKind, GenerationContext, Processor, Result, Settings, Shutdown, VigilError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepalivePayload {
    pub name: String,
    pub address: String,
    pub version: String,
    pub subscriptions: Vec<String>,
    /// Unix seconds.
    pub timestamp: i64,
}

impl KeepalivePayload {
    pub fn from_settings(settings: &Settings) -> Self {
        let client = &settings.client;
        Self {
            name: client.name.clone(),
            address: client.address.clone(),
            version: client.version.clone(),
            subscriptions: client.subscriptions.clone(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

#[derive(Default)]
pub struct Keepalive {
    bound: Option<(Arc<dyn Broker>, Arc<Settings>)>,
}

impl Keepalive {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Processor for Keepalive {
    fn name(&self) -> &'static str {
        "keepalive"
    }

    async fn init(&mut self, ctx: &GenerationContext) -> Result<()> {
        ctx.broker
            .declare_exchange(KEEPALIVES, ExchangeKind::Direct)
            .await?;
        self.bound = Some((Arc::clone(&ctx.broker), Arc::clone(&ctx.settings)));
        Ok(())
    }

    #[instrument(name = "keepalive", skip_all)]
    async fn start(&mut self, mut shutdown: Shutdown) -> Result<()> {
        let Some((broker, settings)) = self.bound.clone() else {
            return Err(VigilError::Processor {
                processor: "keepalive",
                reason: "started before init".to_owned(),
            });
        };

        let period = Duration::from_secs(settings.client.keepalive_interval.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = period.as_secs(), "keepalive running");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.requested() => {
                    info!("keepalive stopped");
                    return Ok(());
                }

                _ = ticker.tick() => {
                    let payload = KeepalivePayload::from_settings(&settings);
                    let body = serde_json::to_vec(&payload)?;
                    if let Err(err) = broker.publish(KEEPALIVES, "", body).await {
                        warn!(error = %err, "keepalive publish failed");
                        return Err(err.into());
                    }
                    debug!(timestamp = payload.timestamp, "keepalive sent");
                }
            }
        }
    }
}
