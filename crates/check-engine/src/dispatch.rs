//! Check requests arriving on subscription queues
//!
//! The dispatcher is the subscriber's delivery handler. It parses the body,
//! hands the request to the runner over a channel and waits for the runner
//! to finish it, so deliveries are processed strictly one after another.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use vigil_core::{Delivery, DeliveryHandler, Result, VigilError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub name: String,
    /// Plugin command for checks the agent has no definition for.
    #[serde(default)]
    pub command: Option<String>,
    /// Unix seconds when the request was issued.
    #[serde(default)]
    pub issued: Option<i64>,
}

#[derive(Debug)]
pub struct CheckCommand {
    pub request: CheckRequest,
    pub reply: oneshot::Sender<Result<()>>,
}

/// Runner side of the request channel.
#[derive(Debug)]
pub struct CheckRequests {
    rx: mpsc::Receiver<CheckCommand>,
}

impl CheckRequests {
    pub async fn recv(&mut self) -> Option<CheckCommand> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone)]
pub struct CheckDispatcher {
    tx: mpsc::Sender<CheckCommand>,
}

pub fn request_channel(capacity: usize) -> (CheckDispatcher, CheckRequests) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CheckDispatcher { tx }, CheckRequests { rx })
}

impl CheckDispatcher {
    pub fn parse(body: &[u8]) -> Result<CheckRequest> {
        let request: CheckRequest = serde_json::from_slice(body)
            .map_err(|err| VigilError::dispatch(format!("malformed check request: {err}")))?;
        if request.name.trim().is_empty() {
            return Err(VigilError::dispatch("check request without a name"));
        }
        Ok(request)
    }

    pub async fn request(&self, request: CheckRequest) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(CheckCommand { request, reply })
            .await
            .map_err(|_| VigilError::abandoned("check runner is not accepting requests"))?;
        done.await
            .map_err(|_| VigilError::abandoned("check runner stopped before finishing the request"))?
    }
}

#[async_trait]
impl DeliveryHandler for CheckDispatcher {
    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let request = Self::parse(&delivery.body)?;
        debug!(check = %request.name, redelivered = delivery.redelivered, "check requested");
        self.request(request).await
    }
}
