//! In-process broker transport
//!
//! Implements the [`Broker`] contract with fanout and direct routing,
//! per-queue backlogs, unacked tracking and redelivery. One live consumer is
//! allowed per queue, which is how the agent guarantees a new generation
//! never shares a queue with its predecessor. Recent calls and publications
//! are journaled (the last [`JOURNAL_LIMIT`] of each) and individual calls can
//! be made to fail, which the tests lean on.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use vigil_core::broker::{
    Broker, BrokerError, Delivery, DeliveryStream, DeliveryTag, ExchangeKind, QueueId,
};

/// Broker primitive, used to journal calls and aim injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOp {
    DeclareExchange,
    DeclareQueue,
    Bind,
    Consume,
    Publish,
    Ack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerCall {
    pub op: BrokerOp,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    routing_key: String,
}

#[derive(Debug, Clone)]
struct Pending {
    body: Vec<u8>,
    exchange: String,
    redelivered: bool,
}

#[derive(Debug)]
struct Consumer {
    tag: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Consumer {
    fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    bindings: Vec<Binding>,
    consumer: Option<Consumer>,
    backlog: VecDeque<Pending>,
    unacked: BTreeMap<DeliveryTag, Pending>,
}

#[derive(Debug, Default)]
struct Inner {
    exchanges: DashMap<String, ExchangeKind>,
    queues: DashMap<String, QueueState>,
    tag_owners: DashMap<DeliveryTag, String>,
    next_tag: AtomicU64,
    calls: Mutex<VecDeque<BrokerCall>>,
    faults: Mutex<Vec<BrokerCall>>,
    published: Mutex<VecDeque<Publication>>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

/// Matches any target when used with [`InMemoryBroker::fail_next`].
pub const ANY_TARGET: &str = "*";

/// Entries kept in each journal; older ones are dropped first.
pub const JOURNAL_LIMIT: usize = 1024;

fn push_bounded<T>(journal: &mut VecDeque<T>, entry: T) {
    if journal.len() == JOURNAL_LIMIT {
        journal.pop_front();
    }
    journal.push_back(entry);
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `op` call against `target` fail.
    pub fn fail_next(&self, op: BrokerOp, target: &str) {
        self.inner.faults.lock().push(BrokerCall {
            op,
            target: target.to_owned(),
        });
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.inner.calls.lock().iter().cloned().collect()
    }

    pub fn count(&self, op: BrokerOp) -> usize {
        self.inner.calls.lock().iter().filter(|c| c.op == op).count()
    }

    pub fn published(&self, exchange: &str) -> Vec<Publication> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|p| p.exchange == exchange)
            .cloned()
            .collect()
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.inner.exchanges.get(exchange).map(|kind| *kind)
    }

    /// Exchanges the queue is bound to, in binding order.
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        self.inner
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().map(|b| b.exchange.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.inner
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer.as_ref().is_some_and(Consumer::is_live))
    }

    pub fn consumer_tag(&self, queue: &str) -> Option<String> {
        self.inner.queues.get(queue).and_then(|q| {
            q.consumer
                .as_ref()
                .filter(|c| c.is_live())
                .map(|c| c.tag.clone())
        })
    }

    pub fn backlog_len(&self, queue: &str) -> usize {
        self.inner.queues.get(queue).map_or(0, |q| q.backlog.len())
    }

    pub fn unacked_len(&self, queue: &str) -> usize {
        self.inner.queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Drop the queue's consumer as a lost connection would. Unacked
    /// deliveries are redelivered to the next consumer.
    pub fn disconnect(&self, queue: &str) {
        if let Some(mut state) = self.inner.queues.get_mut(queue) {
            if let Some(consumer) = state.consumer.take() {
                debug!(queue, tag = %consumer.tag, "consumer disconnected");
            }
        }
    }

    fn record(&self, op: BrokerOp, target: &str) -> Result<(), ()> {
        push_bounded(
            &mut self.inner.calls.lock(),
            BrokerCall {
                op,
                target: target.to_owned(),
            },
        );
        let mut faults = self.inner.faults.lock();
        match faults
            .iter()
            .position(|f| f.op == op && (f.target == target || f.target == ANY_TARGET))
        {
            Some(index) => {
                faults.remove(index);
                Err(())
            }
            None => Ok(()),
        }
    }

    fn deliver(&self, queue: &str, state: &mut QueueState, pending: Pending) {
        let live = state.consumer.as_ref().filter(|c| c.is_live());
        let Some(consumer) = live else {
            state.consumer = None;
            state.backlog.push_back(pending);
            return;
        };

        let tag = DeliveryTag(self.inner.next_tag.fetch_add(1, Ordering::SeqCst) + 1);
        let delivery = Delivery {
            body: pending.body.clone(),
            delivery_tag: tag,
            exchange: pending.exchange.clone(),
            redelivered: pending.redelivered,
        };
        match consumer.tx.send(delivery) {
            Ok(()) => {
                trace!(queue, %tag, "delivered");
                state.unacked.insert(tag, pending);
                self.inner.tag_owners.insert(tag, queue.to_owned());
            }
            Err(_) => {
                state.consumer = None;
                state.backlog.push_back(pending);
            }
        }
    }
}

const INJECTED: &str = "injected fault";

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.record(BrokerOp::DeclareExchange, name)
            .map_err(|_| BrokerError::Declare {
                exchange: name.to_owned(),
                reason: INJECTED.to_owned(),
            })?;

        let existing = *self.inner.exchanges.entry(name.to_owned()).or_insert(kind);
        if existing != kind {
            return Err(BrokerError::PreconditionFailed {
                exchange: name.to_owned(),
                existing,
                requested: kind,
            });
        }
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<QueueId, BrokerError> {
        self.record(BrokerOp::DeclareQueue, name)
            .map_err(|_| BrokerError::DeclareQueue {
                queue: name.to_owned(),
                reason: INJECTED.to_owned(),
            })?;

        self.inner.queues.entry(name.to_owned()).or_default();
        Ok(QueueId::new(name))
    }

    async fn bind(
        &self,
        queue: &QueueId,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.record(BrokerOp::Bind, exchange)
            .map_err(|_| BrokerError::Bind {
                queue: queue.name().to_owned(),
                exchange: exchange.to_owned(),
                reason: INJECTED.to_owned(),
            })?;

        if !self.inner.exchanges.contains_key(exchange) {
            return Err(BrokerError::UnknownExchange {
                exchange: exchange.to_owned(),
            });
        }
        let mut state = self
            .inner
            .queues
            .get_mut(queue.name())
            .ok_or_else(|| BrokerError::UnknownQueue {
                queue: queue.name().to_owned(),
            })?;
        let binding = Binding {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &QueueId,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.record(BrokerOp::Consume, queue.name())
            .map_err(|_| BrokerError::Consume {
                queue: queue.name().to_owned(),
                reason: INJECTED.to_owned(),
            })?;

        let mut state = self
            .inner
            .queues
            .get_mut(queue.name())
            .ok_or_else(|| BrokerError::UnknownQueue {
                queue: queue.name().to_owned(),
            })?;
        if state.consumer.as_ref().is_some_and(Consumer::is_live) {
            return Err(BrokerError::ConsumerBusy {
                queue: queue.name().to_owned(),
            });
        }

        // Whatever the previous consumer never acked goes out again first.
        let unacked = std::mem::take(&mut state.unacked);
        for (tag, mut pending) in unacked.into_iter().rev() {
            self.inner.tag_owners.remove(&tag);
            pending.redelivered = true;
            state.backlog.push_front(pending);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.consumer = Some(Consumer {
            tag: consumer_tag.to_owned(),
            tx,
        });
        let backlog = std::mem::take(&mut state.backlog);
        for pending in backlog {
            self.deliver(queue.name(), &mut state, pending);
        }
        debug!(queue = %queue, tag = consumer_tag, "consumer attached");

        Ok(DeliveryStream::new(rx))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        self.record(BrokerOp::Publish, exchange)
            .map_err(|_| BrokerError::Publish {
                exchange: exchange.to_owned(),
                reason: INJECTED.to_owned(),
            })?;

        let kind = self
            .inner
            .exchanges
            .get(exchange)
            .map(|kind| *kind)
            .ok_or_else(|| BrokerError::UnknownExchange {
                exchange: exchange.to_owned(),
            })?;

        push_bounded(
            &mut self.inner.published.lock(),
            Publication {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                body: body.clone(),
            },
        );

        for mut entry in self.inner.queues.iter_mut() {
            let routed = entry.bindings.iter().any(|b| {
                b.exchange == exchange
                    && (kind == ExchangeKind::Fanout || b.routing_key == routing_key)
            });
            if routed {
                let queue = entry.key().clone();
                self.deliver(
                    &queue,
                    entry.value_mut(),
                    Pending {
                        body: body.clone(),
                        exchange: exchange.to_owned(),
                        redelivered: false,
                    },
                );
            }
        }
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.record(BrokerOp::Ack, &tag.to_string())
            .map_err(|_| BrokerError::Ack {
                tag,
                reason: INJECTED.to_owned(),
            })?;

        let (_, queue) = self
            .inner
            .tag_owners
            .remove(&tag)
            .ok_or_else(|| BrokerError::Ack {
                tag,
                reason: "unknown delivery tag".to_owned(),
            })?;
        if let Some(mut state) = self.inner.queues.get_mut(&queue) {
            state.unacked.remove(&tag);
        }
        Ok(())
    }
}
