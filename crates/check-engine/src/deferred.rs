//! One-shot delayed actions

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{debug, warn};

/// An action that fires once after a delay unless cancelled first.
///
/// Dropping the handle does not cancel the action.
#[derive(Debug)]
pub struct DeferredAction {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<bool>,
}

impl DeferredAction {
    pub fn schedule<F>(delay: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (cancel, cancelled) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let fire = async move {
                tokio::time::sleep(delay).await;
                action.await;
            };
            tokio::select! {
                biased;
                Ok(()) = cancelled => {
                    debug!("deferred action cancelled");
                    false
                }
                _ = fire => true,
            }
        }
        .with_current_subscriber());
        Self {
            cancel: Some(cancel),
            task,
        }
    }

    /// Cancel the action. Returns false if it already fired.
    pub fn cancel(&mut self) -> bool {
        if self.task.is_finished() {
            return false;
        }
        match self.cancel.take() {
            Some(cancel) => cancel.send(()).is_ok(),
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the outcome: true if the action ran.
    pub async fn outcome(self) -> bool {
        self.task.await.unwrap_or(false)
    }
}

/// Host-level remedy the TCP check requests once it gives up on the network.
#[async_trait]
pub trait CorrectiveAction: Send + Sync {
    async fn perform(&self, reason: &str);
}

/// Records the request without touching the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnly;

#[async_trait]
impl CorrectiveAction for LogOnly {
    async fn perform(&self, reason: &str) {
        warn!(reason, "corrective restart requested, no restart mechanism configured");
    }
}
