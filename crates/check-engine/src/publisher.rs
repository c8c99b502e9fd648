//! Report publication to the `results` exchange

use std::sync::Arc;

use metrics::CheckReport;
use tracing::{debug, info, warn};
use vigil_core::exchanges::RESULTS;
use vigil_core::{Broker, Result};

use crate::stat_store::StatStore;

pub struct ResultPublisher {
    broker: Arc<dyn Broker>,
    store: Option<StatStore>,
}

impl ResultPublisher {
    pub fn new(broker: Arc<dyn Broker>, store: Option<StatStore>) -> Self {
        Self { broker, store }
    }

    /// Publish one report.
    ///
    /// With a stat store configured a rejected publish is buffered instead of
    /// failing, and buffered reports always go out before newer ones.
    pub async fn publish(&self, report: &CheckReport) -> Result<()> {
        let body = report.to_json()?;

        let Some(store) = &self.store else {
            self.broker.publish(RESULTS, "", body).await?;
            return Ok(());
        };

        if !self.flush(store).await? {
            store.append(&body)?;
            debug!(check = %report.check.name, "report buffered behind earlier ones");
            return Ok(());
        }

        if let Err(err) = self.broker.publish(RESULTS, "", body.clone()).await {
            warn!(check = %report.check.name, error = %err, "publish failed, buffering report");
            store.append(&body)?;
        }
        Ok(())
    }

    /// Push buffered reports out in order. Returns false if the broker
    /// rejected one, leaving it and everything after it buffered.
    async fn flush(&self, store: &StatStore) -> Result<bool> {
        let pending = store.pending()?;
        if pending.is_empty() {
            return Ok(true);
        }

        for (sent, body) in pending.iter().enumerate() {
            if let Err(err) = self.broker.publish(RESULTS, "", body.clone()).await {
                warn!(error = %err, remaining = pending.len() - sent, "stat store flush interrupted");
                store.retain(&pending[sent..])?;
                return Ok(false);
            }
        }
        store.retain(&[])?;
        info!(flushed = pending.len(), "stat store flushed");
        Ok(true)
    }
}
