//! Subscription consumer
//!
//! Binds the client's queue to one fanout exchange per subscription and
//! feeds every delivery, one at a time, to a [`DeliveryHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use vigil_core::broker::{Broker, BrokerError, Delivery, DeliveryHandler, DeliveryStream};
use vigil_core::{ExchangeKind, GenerationContext, Processor, QueueId, Result, Shutdown, VigilError};

pub struct Subscriber {
    handler: Arc<dyn DeliveryHandler>,
    bound: Option<Bound>,
}

struct Bound {
    broker: Arc<dyn Broker>,
    queue: QueueId,
    deliveries: Option<DeliveryStream>,
}

impl Subscriber {
    pub fn new(handler: Arc<dyn DeliveryHandler>) -> Self {
        Self {
            handler,
            bound: None,
        }
    }

    async fn dispatch(&self, broker: &dyn Broker, delivery: Delivery) {
        debug!(
            bytes = delivery.body.len(),
            tag = %delivery.delivery_tag,
            exchange = %delivery.exchange,
            redelivered = delivery.redelivered,
            "got delivery"
        );

        if let Err(err) = self.handler.handle(&delivery).await {
            // Never ran to completion, the next consumer gets it again.
            if err.is_abandoned() {
                debug!(tag = %delivery.delivery_tag, error = %err, "leaving delivery unacked");
                return;
            }
            warn!(tag = %delivery.delivery_tag, error = %err, "dropping delivery");
        }

        // Acked whether or not the handler succeeded, a bad delivery is never retried.
        if let Err(err) = broker.ack(delivery.delivery_tag).await {
            warn!(tag = %delivery.delivery_tag, error = %err, "ack failed");
        }
    }
}

#[async_trait]
impl Processor for Subscriber {
    fn name(&self) -> &'static str {
        "subscriber"
    }

    async fn init(&mut self, ctx: &GenerationContext) -> Result<()> {
        let broker = Arc::clone(&ctx.broker);
        let client = &ctx.settings.client;
        let queue_name = client.queue_name();

        debug!(queue = %queue_name, "declaring queue");
        let queue = broker.declare_queue(&queue_name).await?;
        debug!(queue = %queue, "declared queue");

        for topic in &client.subscriptions {
            debug!(exchange = %topic, "declaring exchange");
            broker.declare_exchange(topic, ExchangeKind::Fanout).await?;

            debug!(queue = %queue, exchange = %topic, "binding queue to exchange");
            broker.bind(&queue, topic, "").await?;
        }

        let consumer_tag = format!("{}-g{}", queue.name(), ctx.generation);
        debug!(queue = %queue, tag = %consumer_tag, "starting consume");
        let deliveries = broker.consume(&queue, &consumer_tag).await?;

        info!(
            queue = %queue,
            subscriptions = client.subscriptions.len(),
            "subscriber bound"
        );
        self.bound = Some(Bound {
            broker,
            queue,
            deliveries: Some(deliveries),
        });
        Ok(())
    }

    #[instrument(name = "subscriber", skip_all)]
    async fn start(&mut self, mut shutdown: Shutdown) -> Result<()> {
        let Some(bound) = self.bound.as_mut() else {
            return Err(VigilError::Processor {
                processor: "subscriber",
                reason: "started before init".to_owned(),
            });
        };
        let broker = Arc::clone(&bound.broker);
        let queue = bound.queue.clone();
        let Some(mut deliveries) = bound.deliveries.take() else {
            return Err(VigilError::Processor {
                processor: "subscriber",
                reason: "delivery stream already taken".to_owned(),
            });
        };

        loop {
            tokio::select! {
                biased;

                _ = shutdown.requested() => {
                    deliveries.close();
                    info!(queue = %queue, "subscriber stopped");
                    return Ok(());
                }

                next = deliveries.next() => match next {
                    Some(delivery) => self.dispatch(broker.as_ref(), delivery).await,
                    None if shutdown.is_requested() => return Ok(()),
                    None => {
                        warn!(queue = %queue, "delivery stream closed");
                        return Err(BrokerError::StreamClosed {
                            queue: queue.name().to_owned(),
                        }
                        .into());
                    }
                },
            }
        }
    }
}
