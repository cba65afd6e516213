// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Channels
//!
//! A [`QueueChannel`] owns one queue on the broker: its own channel, its
//! prefetch window, its consumer registrations and its delivery loop.
//! Consumer registrations are buffered for the lifetime of the queue and
//! replayed on every (re)connection, so a consumer registered once keeps
//! consuming across broker restarts.

use crate::errors::AmqpError;
use crate::events::QueueEvent;
use crate::message::{decode, encode, Payload};
use crate::transport::{
    ConsumeOptions, DeclareQueueOptions, MessageProperties, PublishOutcome, RawDelivery,
    TransportChannel, TransportConnection, TransportEvent,
};
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tracing::debug;

/// Options for asserting a queue. Defaults mirror a work queue: named,
/// durable, non-exclusive, prefetch of one.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub prefetch: u16,
    pub message_ttl: Option<i32>,
    pub max_length: Option<i32>,
    pub routing_keys: Vec<String>,
}

impl Default for QueueOptions {
    fn default() -> QueueOptions {
        QueueOptions {
            name: String::new(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            prefetch: 1,
            message_ttl: None,
            max_length: None,
            routing_keys: vec![],
        }
    }
}

impl QueueOptions {
    pub fn named(name: &str) -> QueueOptions {
        QueueOptions {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = count;
        self
    }

    pub fn message_ttl(mut self, ttl_ms: i32) -> Self {
        self.message_ttl = Some(ttl_ms);
        self
    }

    pub fn max_length(mut self, length: i32) -> Self {
        self.max_length = Some(length);
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_keys.push(key.to_owned());
        self
    }
}

/// How a delivery is rejected. Defaults to requeueing just this message.
#[derive(Debug, Clone, Copy)]
pub struct NackOptions {
    pub all_up_to: bool,
    pub requeue: bool,
}

impl Default for NackOptions {
    fn default() -> NackOptions {
        NackOptions {
            all_up_to: false,
            requeue: true,
        }
    }
}

/// A decoded message handed to a consumer, with its settlement handles.
pub struct Delivery {
    pub payload: Payload,
    pub raw: RawDelivery,
    channel: Arc<dyn TransportChannel>,
}

impl Delivery {
    /// Acknowledges the message. When a reply payload is given and the
    /// message carried both `reply_to` and a correlation id, the reply is
    /// published to `reply_to` on the default exchange first, correlated by
    /// the original id and encoded under the original content type. The ack
    /// always happens, reply or not.
    pub async fn ack(&self, reply: Option<Payload>) -> Result<(), AmqpError> {
        if let Some(reply) = reply {
            let properties = &self.raw.properties;
            if let (Some(reply_to), Some(correlation_id)) =
                (&properties.reply_to, &properties.correlation_id)
            {
                let content_type = properties
                    .content_type
                    .clone()
                    .unwrap_or_else(|| reply.content_type().to_owned());
                let bytes = encode(&reply, &content_type);

                let outcome = self
                    .channel
                    .publish(
                        "",
                        reply_to,
                        bytes,
                        MessageProperties {
                            content_type: Some(content_type),
                            correlation_id: Some(correlation_id.clone()),
                            reply_to: None,
                        },
                    )
                    .await?;
                if let PublishOutcome::Backpressure(drained) = outcome {
                    let _ = drained.await;
                }
            }
        }

        self.channel.ack(self.raw.delivery_tag, false).await
    }

    /// Rejects the message with the given disposition.
    pub async fn nack(&self, options: NackOptions) -> Result<(), AmqpError> {
        self.channel
            .nack(self.raw.delivery_tag, options.all_up_to, options.requeue)
            .await
    }
}

/// Handler invoked once per delivery. The handler owns settlement: it acks or
/// nacks through the [`Delivery`] it receives.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F, Fut>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) {
        (self.f)(delivery).await;
    }
}

/// Adapts an async closure into a [`ConsumerHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _fut: PhantomData,
    })
}

struct ConsumerSpec {
    handler: Arc<dyn ConsumerHandler>,
    options: ConsumeOptions,
}

#[derive(Default)]
struct QueueState {
    channel: Option<Arc<dyn TransportChannel>>,
    amq_label: Option<String>,
    consumer_tag: Option<String>,
}

/// One queue and its consumers, bound to an owning exchange.
pub struct QueueChannel {
    options: QueueOptions,
    events: broadcast::Sender<QueueEvent>,
    state: AsyncMutex<QueueState>,
    consumers: Mutex<Vec<Arc<ConsumerSpec>>>,
    ready_tx: watch::Sender<bool>,
}

impl QueueChannel {
    pub(crate) fn new(options: QueueOptions) -> Arc<QueueChannel> {
        let (events, _) = broadcast::channel(64);
        let (ready_tx, _) = watch::channel(false);
        Arc::new(QueueChannel {
            options,
            events,
            state: AsyncMutex::new(QueueState::default()),
            consumers: Mutex::new(Vec::new()),
            ready_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub(crate) fn routing_keys(&self) -> Vec<String> {
        self.options.routing_keys.clone()
    }

    /// The broker-assigned queue name. Differs from the requested name only
    /// for server-named queues, where it is a generated label.
    pub async fn amq_label(&self) -> Option<String> {
        self.state.lock().await.amq_label.clone()
    }

    /// Asserts the queue on a fresh channel of the given connection and
    /// replays every buffered consumer registration.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        conn: &Arc<dyn TransportConnection>,
    ) -> Result<(), AmqpError> {
        let channel = conn.create_channel().await?;
        let _ = self.events.send(QueueEvent::Connected);

        channel.set_prefetch(self.options.prefetch).await?;

        let label = channel
            .declare_queue(
                &self.options.name,
                &DeclareQueueOptions {
                    durable: self.options.durable,
                    exclusive: self.options.exclusive,
                    auto_delete: self.options.auto_delete,
                    message_ttl: self.options.message_ttl,
                    max_length: self.options.max_length,
                },
            )
            .await?;
        debug!(queue = %label, "queue asserted");

        {
            let mut state = self.state.lock().await;
            state.channel = Some(channel.clone());
            state.amq_label = Some(label.clone());
            state.consumer_tag = None;
        }

        self.watch_channel(&channel);
        let _ = self.ready_tx.send(true);
        let _ = self.events.send(QueueEvent::Ready);

        let specs: Vec<Arc<ConsumerSpec>> =
            self.consumers.lock().unwrap_or_else(|p| p.into_inner()).clone();
        for spec in specs {
            self.start_consumer(&channel, &label, &spec).await?;
        }

        Ok(())
    }

    /// Registers a consumer. Starts immediately when the queue is up,
    /// otherwise the registration waits for the next connection. Either way
    /// it is replayed after every reconnection.
    pub async fn consume(
        &self,
        handler: Arc<dyn ConsumerHandler>,
        options: ConsumeOptions,
    ) -> Result<(), AmqpError> {
        let spec = Arc::new(ConsumerSpec { handler, options });
        self.consumers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(spec.clone());

        let (channel, label) = {
            let state = self.state.lock().await;
            (state.channel.clone(), state.amq_label.clone())
        };
        if let (Some(channel), Some(label)) = (channel, label) {
            self.start_consumer(&channel, &label, &spec).await?;
        }

        Ok(())
    }

    /// Cancels the most recently started consumer. A no-op when nothing is
    /// consuming.
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        let (channel, tag) = {
            let mut state = self.state.lock().await;
            (state.channel.clone(), state.consumer_tag.take())
        };
        match (channel, tag) {
            (Some(channel), Some(tag)) => channel.cancel(&tag).await,
            _ => Ok(()),
        }
    }

    /// Purges the queue and returns the purged message count. When the queue
    /// is not up yet, waits until it is.
    pub async fn purge(&self) -> Result<u32, AmqpError> {
        let mut ready = self.ready_tx.subscribe();
        loop {
            let (channel, label) = {
                let state = self.state.lock().await;
                (state.channel.clone(), state.amq_label.clone())
            };
            if let (Some(channel), Some(label)) = (channel, label) {
                return channel.purge(&label).await;
            }
            if ready.changed().await.is_err() {
                return Err(AmqpError::ConnectionClosed);
            }
        }
    }

    /// Signals that the owning exchange bound every requested routing key.
    pub(crate) fn notify_bound(&self) {
        let _ = self.events.send(QueueEvent::Bound);
    }

    async fn start_consumer(
        &self,
        channel: &Arc<dyn TransportChannel>,
        label: &str,
        spec: &Arc<ConsumerSpec>,
    ) -> Result<(), AmqpError> {
        let (tag, mut deliveries) = channel.consume(label, &spec.options).await?;
        self.state.lock().await.consumer_tag = Some(tag);
        let _ = self.events.send(QueueEvent::Consuming);

        let handler = spec.handler.clone();
        let events = self.events.clone();
        let delivery_channel = channel.clone();
        tokio::spawn(async move {
            while let Some(raw) = deliveries.recv().await {
                let payload = match decode(&raw.payload, raw.properties.content_type.as_deref()) {
                    Ok(payload) => payload,
                    Err(err) => {
                        let _ = events.send(QueueEvent::Error(err.to_string()));
                        continue;
                    }
                };

                handler
                    .handle(Delivery {
                        payload,
                        raw,
                        channel: delivery_channel.clone(),
                    })
                    .await;
            }
        });

        Ok(())
    }

    /// Resets local state and reports the close when the channel dies. The
    /// queue takes no recovery action of its own; the owning exchange
    /// reconnects it on the next connection. A close from a superseded
    /// channel is ignored, so a late close of the previous connection's
    /// channel cannot wipe the reattached state.
    fn watch_channel(self: &Arc<Self>, channel: &Arc<dyn TransportChannel>) {
        let Some(mut events_rx) = channel.take_event_stream() else {
            return;
        };

        let queue = self.clone();
        let watched = channel.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let TransportEvent::Closed(_) = event {
                    let mut state = queue.state.lock().await;
                    let current = state
                        .channel
                        .as_ref()
                        .is_some_and(|channel| Arc::ptr_eq(channel, &watched));
                    if !current {
                        break;
                    }
                    state.channel = None;
                    state.amq_label = None;
                    state.consumer_tag = None;
                    drop(state);
                    let _ = queue.ready_tx.send(false);
                    let _ = queue.events.send(QueueEvent::Close);
                    break;
                }
            }
        });
    }
}
