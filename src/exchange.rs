// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Channels
//!
//! An [`ExchangeChannel`] owns one exchange on the broker: its channel, its
//! registered queues, and optionally a server-named reply queue that backs
//! request/reply calls. Exchanges never reconnect themselves; the connection
//! manager hands them each new connection and they reassert their topology
//! on it.

use crate::errors::AmqpError;
use crate::events::ExchangeEvent;
use crate::message::{decode, encode, Payload};
use crate::queue::{handler_fn, QueueChannel, QueueOptions};
use crate::transport::{
    ConsumeOptions, DeclareQueueOptions, ExchangeType, MessageProperties, PublishOutcome,
    TransportChannel, TransportConnection, TransportEvent,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex as AsyncMutex};
use tracing::debug;
use uuid::Uuid;

/// Options accepted at exchange creation. Named exchanges carry no reply
/// queue unless asked; the default exchange always carries one.
#[derive(Debug, Clone)]
pub struct ExchangeOptions {
    pub no_reply: bool,
}

impl Default for ExchangeOptions {
    fn default() -> ExchangeOptions {
        ExchangeOptions { no_reply: true }
    }
}

impl ExchangeOptions {
    /// Sets up a reply queue on connect, enabling request/reply calls.
    pub fn with_reply() -> ExchangeOptions {
        ExchangeOptions { no_reply: false }
    }
}

/// Per-publish routing and property overrides.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub routing_key: String,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl PublishOptions {
    pub fn key(routing_key: &str) -> PublishOptions {
        PublishOptions {
            routing_key: routing_key.to_owned(),
            ..Default::default()
        }
    }
}

/// Handler invoked once per RPC request; its return value is published back
/// to the caller.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: Payload) -> Payload;
}

#[derive(Default)]
struct ExchangeState {
    conn: Option<Arc<dyn TransportConnection>>,
    channel: Option<Arc<dyn TransportChannel>>,
    reply_label: Option<String>,
}

/// One exchange and everything attached to it.
pub struct ExchangeChannel {
    name: String,
    kind: ExchangeType,
    options: ExchangeOptions,
    events: broadcast::Sender<ExchangeEvent>,
    state: AsyncMutex<ExchangeState>,
    queues: Mutex<Vec<Arc<QueueChannel>>>,
    pending_replies: Arc<AsyncMutex<HashMap<String, oneshot::Sender<Payload>>>>,
    ready_tx: watch::Sender<bool>,
}

impl ExchangeChannel {
    /// An absent name resolves to the broker's built-in exchange for the
    /// type (`amq.direct`, `amq.fanout`, `amq.topic`); an explicitly empty
    /// name is the default nameless exchange.
    pub(crate) fn new(
        kind: ExchangeType,
        name: Option<&str>,
        options: ExchangeOptions,
    ) -> Arc<ExchangeChannel> {
        let name = match name {
            None => format!("amq.{}", kind.as_str()),
            Some(name) => name.to_owned(),
        };
        let (events, _) = broadcast::channel(64);
        let (ready_tx, _) = watch::channel(false);
        Arc::new(ExchangeChannel {
            name,
            kind,
            options,
            events,
            state: AsyncMutex::new(ExchangeState::default()),
            queues: Mutex::new(Vec::new()),
            pending_replies: Arc::new(AsyncMutex::new(HashMap::new())),
            ready_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeType {
        self.kind
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.events.subscribe()
    }

    /// The broker-assigned name of the reply queue, when one is configured
    /// and currently asserted.
    pub async fn reply_label(&self) -> Option<String> {
        self.state.lock().await.reply_label.clone()
    }

    /// Asserts the exchange on a fresh channel of the given connection,
    /// rebuilds the reply queue when one is configured, and reattaches every
    /// registered queue.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        conn: &Arc<dyn TransportConnection>,
    ) -> Result<(), AmqpError> {
        let channel = conn.create_channel().await?;
        let _ = self.events.send(ExchangeEvent::Connected);

        // the nameless default exchange always exists and cannot be declared
        if !self.name.is_empty() {
            channel
                .declare_exchange(&self.name, self.kind, true)
                .await?;
            debug!(exchange = %self.name, "exchange asserted");
        }

        {
            let mut state = self.state.lock().await;
            state.conn = Some(conn.clone());
            state.channel = Some(channel.clone());
            state.reply_label = None;
        }
        self.watch_channel(&channel);

        if !self.options.no_reply {
            self.setup_reply_queue(&channel).await?;
        }

        let queues: Vec<Arc<QueueChannel>> = self
            .queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let results = join_all(queues.iter().map(|queue| queue.connect(conn))).await;
        for result in results {
            result?;
        }
        for queue in &queues {
            self.bind_queue(&channel, queue).await?;
        }

        let _ = self.ready_tx.send(true);
        let _ = self.events.send(ExchangeEvent::Ready);
        Ok(())
    }

    /// Registers a queue on this exchange. When the exchange is connected
    /// the queue is asserted and bound immediately; either way it is
    /// reattached after every reconnection.
    pub async fn queue(&self, options: QueueOptions) -> Result<Arc<QueueChannel>, AmqpError> {
        let queue = QueueChannel::new(options);
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(queue.clone());

        let (conn, channel) = {
            let state = self.state.lock().await;
            (state.conn.clone(), state.channel.clone())
        };
        if let (Some(conn), Some(channel)) = (conn, channel) {
            queue.connect(&conn).await?;
            self.bind_queue(&channel, &queue).await?;
        }

        Ok(queue)
    }

    /// Publishes one message. Completion is deferred until the write is
    /// actually flushed: at least one scheduling turn, longer under
    /// backpressure. Waits for the exchange to be up when it is not.
    pub async fn publish(
        &self,
        payload: &Payload,
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        let channel = self.current_channel().await;

        let content_type = options
            .content_type
            .unwrap_or_else(|| payload.content_type().to_owned());
        let bytes = encode(payload, &content_type);

        let outcome = channel
            .publish(
                &self.name,
                &options.routing_key,
                bytes,
                MessageProperties {
                    content_type: Some(content_type),
                    correlation_id: options.correlation_id,
                    reply_to: options.reply_to,
                },
            )
            .await?;

        match outcome {
            PublishOutcome::Flushed => tokio::task::yield_now().await,
            PublishOutcome::Backpressure(drained) => {
                let _ = drained.await;
            }
        }
        Ok(())
    }

    /// A strictly-ordered write handle. Writes are serialized by a single
    /// worker task and each `write` completes only after its publish fully
    /// flushed, so completion order always matches submission order.
    pub fn writer(self: &Arc<Self>) -> ExchangeWriter {
        let (tx, mut rx) = mpsc::channel::<WriteRequest>(64);
        let exchange = self.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = exchange.publish(&request.payload, request.options).await;
                let _ = request.done.send(result);
            }
        });
        ExchangeWriter { tx }
    }

    /// A request/reply caller publishing to the given routing key. Fails
    /// when this exchange carries no reply queue.
    pub fn rpc_client(self: &Arc<Self>, routing_key: &str) -> Result<RpcClient, AmqpError> {
        if self.options.no_reply {
            return Err(AmqpError::ReplyQueueRequired);
        }
        Ok(RpcClient {
            exchange: self.clone(),
            routing_key: routing_key.to_owned(),
        })
    }

    /// Serves requests published to the given routing key: each request is
    /// handed to the handler and the handler's reply is published back to
    /// the requester before the request is acked.
    pub async fn rpc_server(
        self: &Arc<Self>,
        routing_key: &str,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<Arc<QueueChannel>, AmqpError> {
        if self.options.no_reply {
            return Err(AmqpError::ReplyQueueRequired);
        }

        let queue = self
            .queue(QueueOptions::named(routing_key).routing_key(routing_key))
            .await?;

        let events = self.events.clone();
        queue
            .consume(
                handler_fn(move |delivery| {
                    let handler = handler.clone();
                    let events = events.clone();
                    async move {
                        let reply = handler.handle(delivery.payload.clone()).await;
                        if let Err(err) = delivery.ack(Some(reply)).await {
                            let _ = events.send(ExchangeEvent::Error(err.to_string()));
                        }
                    }
                }),
                ConsumeOptions::default(),
            )
            .await?;

        Ok(queue)
    }

    async fn current_channel(&self) -> Arc<dyn TransportChannel> {
        let mut ready = self.ready_tx.subscribe();
        loop {
            if let Some(channel) = self.state.lock().await.channel.clone() {
                return channel;
            }
            // the sender lives on self, so changed() cannot fail here
            let _ = ready.changed().await;
        }
    }

    async fn bind_queue(
        &self,
        channel: &Arc<dyn TransportChannel>,
        queue: &Arc<QueueChannel>,
    ) -> Result<(), AmqpError> {
        // queues on the default exchange are addressed by name, no binding
        if self.name.is_empty() {
            queue.notify_bound();
            return Ok(());
        }

        let Some(label) = queue.amq_label().await else {
            return Ok(());
        };

        let mut keys = queue.routing_keys();
        if keys.is_empty() {
            keys.push(label.clone());
        }

        let binds = keys
            .iter()
            .map(|key| channel.bind_queue(&label, &self.name, key));
        for result in join_all(binds).await {
            result?;
        }

        queue.notify_bound();
        Ok(())
    }

    async fn setup_reply_queue(
        self: &Arc<Self>,
        channel: &Arc<dyn TransportChannel>,
    ) -> Result<(), AmqpError> {
        let label = channel
            .declare_queue(
                "",
                &DeclareQueueOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    message_ttl: None,
                    max_length: None,
                },
            )
            .await?;

        let (_tag, mut deliveries) = channel
            .consume(
                &label,
                &ConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
            )
            .await?;
        debug!(queue = %label, "reply queue asserted");

        self.state.lock().await.reply_label = Some(label);

        let pending = self.pending_replies.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(raw) = deliveries.recv().await {
                let Some(correlation_id) = raw.properties.correlation_id.clone() else {
                    continue;
                };
                let Some(sender) = pending.lock().await.remove(&correlation_id) else {
                    continue;
                };
                match decode(&raw.payload, raw.properties.content_type.as_deref()) {
                    Ok(payload) => {
                        let _ = sender.send(payload);
                    }
                    Err(err) => {
                        let _ = events.send(ExchangeEvent::Error(err.to_string()));
                    }
                }
            }
        });

        Ok(())
    }

    /// A channel-local close resets this exchange's channel state and is
    /// reported locally; connection-level recovery stays with the manager.
    /// A close from a superseded channel is ignored, so a late close of the
    /// previous connection's channel cannot wipe the reattached state.
    fn watch_channel(self: &Arc<Self>, channel: &Arc<dyn TransportChannel>) {
        let Some(mut events_rx) = channel.take_event_stream() else {
            return;
        };

        let exchange = self.clone();
        let watched = channel.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let TransportEvent::Closed(_) = event {
                    let mut state = exchange.state.lock().await;
                    let current = state
                        .channel
                        .as_ref()
                        .is_some_and(|channel| Arc::ptr_eq(channel, &watched));
                    if !current {
                        break;
                    }
                    state.channel = None;
                    state.reply_label = None;
                    drop(state);
                    let _ = exchange.ready_tx.send(false);
                    let _ = exchange.events.send(ExchangeEvent::Close);
                    break;
                }
            }
        });
    }
}

struct WriteRequest {
    payload: Payload,
    options: PublishOptions,
    done: oneshot::Sender<Result<(), AmqpError>>,
}

/// See [`ExchangeChannel::writer`].
pub struct ExchangeWriter {
    tx: mpsc::Sender<WriteRequest>,
}

impl ExchangeWriter {
    pub async fn write(&self, payload: Payload, options: PublishOptions) -> Result<(), AmqpError> {
        let (done, done_rx) = oneshot::channel();
        self.tx
            .send(WriteRequest {
                payload,
                options,
                done,
            })
            .await
            .map_err(|_| AmqpError::ConnectionClosed)?;
        done_rx.await.map_err(|_| AmqpError::ConnectionClosed)?
    }
}

/// See [`ExchangeChannel::rpc_client`].
pub struct RpcClient {
    exchange: Arc<ExchangeChannel>,
    routing_key: String,
}

impl RpcClient {
    /// Publishes a request and waits for the correlated reply. There is no
    /// default deadline; pass one to get [`AmqpError::RpcTimeout`] instead
    /// of waiting forever.
    pub async fn call(
        &self,
        payload: &Payload,
        timeout: Option<Duration>,
    ) -> Result<Payload, AmqpError> {
        let reply_to = self
            .exchange
            .reply_label()
            .await
            .ok_or(AmqpError::ReplyQueueRequired)?;

        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.exchange
            .pending_replies
            .lock()
            .await
            .insert(correlation_id.clone(), tx);

        let published = self
            .exchange
            .publish(
                payload,
                PublishOptions {
                    routing_key: self.routing_key.clone(),
                    content_type: None,
                    correlation_id: Some(correlation_id.clone()),
                    reply_to: Some(reply_to),
                },
            )
            .await;
        if let Err(err) = published {
            self.exchange.pending_replies.lock().await.remove(&correlation_id);
            return Err(err);
        }

        let reply = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.exchange
                        .pending_replies
                        .lock()
                        .await
                        .remove(&correlation_id);
                    return Err(AmqpError::RpcTimeout);
                }
            },
            None => rx.await,
        };

        reply.map_err(|_| AmqpError::RpcCorrelationDropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::JSON_CONTENT_TYPE;
    use crate::transport::testing::{CallCounters, FakeConnection};
    use crate::transport::RawDelivery;
    use futures_util::FutureExt;
    use serde_json::json;

    fn fake_connection() -> (Arc<FakeConnection>, Arc<dyn TransportConnection>) {
        let fake = Arc::new(FakeConnection::new(Arc::new(CallCounters::default())));
        let conn: Arc<dyn TransportConnection> = fake.clone();
        (fake, conn)
    }

    #[tokio::test]
    async fn absent_name_resolves_to_the_builtin_exchange() {
        let exchange = ExchangeChannel::new(ExchangeType::Fanout, None, ExchangeOptions::default());
        assert_eq!(exchange.name(), "amq.fanout");
    }

    #[tokio::test]
    async fn default_exchange_skips_assertion() {
        let (fake, conn) = fake_connection();
        let exchange =
            ExchangeChannel::new(ExchangeType::Direct, Some(""), ExchangeOptions::with_reply());
        exchange.connect(&conn).await.unwrap();

        let ops = fake.channel(0).ops.lock().unwrap().clone();
        assert!(ops.iter().all(|op| !op.starts_with("declare_exchange:")));
    }

    #[tokio::test]
    async fn named_exchange_is_asserted_durable() {
        let (fake, conn) = fake_connection();
        let exchange =
            ExchangeChannel::new(ExchangeType::Topic, Some("events"), ExchangeOptions::default());
        exchange.connect(&conn).await.unwrap();

        assert_eq!(
            fake.channel(0).op_index("declare_exchange:events:topic"),
            Some(0)
        );
    }

    #[tokio::test]
    async fn flushed_publish_never_completes_in_the_same_turn() {
        let (_fake, conn) = fake_connection();
        let exchange =
            ExchangeChannel::new(ExchangeType::Direct, Some("jobs"), ExchangeOptions::default());
        exchange.connect(&conn).await.unwrap();

        let payload = Payload::Json(json!({ "id": 1 }));
        let publish = exchange.publish(&payload, PublishOptions::key("jobs.created"));
        assert!(
            publish.now_or_never().is_none(),
            "publish must defer at least one scheduling turn"
        );
    }

    #[tokio::test]
    async fn backpressured_publish_completes_only_after_drain() {
        let (fake, conn) = fake_connection();
        let exchange =
            ExchangeChannel::new(ExchangeType::Direct, Some("jobs"), ExchangeOptions::default());
        exchange.connect(&conn).await.unwrap();

        let channel = fake.channel(0);
        channel.arm_backpressure();

        let publishing = {
            let exchange = exchange.clone();
            tokio::spawn(async move {
                exchange
                    .publish(&Payload::Raw(vec![1, 2, 3]), PublishOptions::key("jobs.raw"))
                    .await
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!publishing.is_finished(), "must wait for the drain signal");

        channel.drain();
        publishing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn writer_serializes_and_never_reorders() {
        let (fake, conn) = fake_connection();
        let exchange =
            ExchangeChannel::new(ExchangeType::Direct, Some("jobs"), ExchangeOptions::default());
        exchange.connect(&conn).await.unwrap();

        let channel = fake.channel(0);
        channel.arm_backpressure();
        let writer = Arc::new(exchange.writer());

        let first = {
            let writer = writer.clone();
            tokio::spawn(async move {
                writer
                    .write(Payload::Raw(vec![1]), PublishOptions::key("first"))
                    .await
            })
        };
        let second = {
            let writer = writer.clone();
            tokio::spawn(async move {
                writer
                    .write(Payload::Raw(vec![2]), PublishOptions::key("second"))
                    .await
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // the second write must not reach the wire while the first waits
        assert_eq!(channel.published.lock().unwrap().len(), 1);
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        channel.drain();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(fake.counters.publish.load(std::sync::atomic::Ordering::SeqCst), 2);
        let published = channel.published.lock().unwrap();
        assert_eq!(published[0].routing_key, "first");
        assert_eq!(published[1].routing_key, "second");
    }

    #[tokio::test]
    async fn queues_are_bound_on_every_routing_key() {
        let (fake, conn) = fake_connection();
        let exchange =
            ExchangeChannel::new(ExchangeType::Topic, Some("events"), ExchangeOptions::default());

        // registered while disconnected, attached when the exchange comes up
        let queue = exchange
            .queue(
                QueueOptions::named("audit")
                    .routing_key("events.created")
                    .routing_key("events.deleted"),
            )
            .await
            .unwrap();
        let mut events = queue.subscribe();

        exchange.connect(&conn).await.unwrap();

        let exchange_channel = fake.channel(0);
        assert!(exchange_channel
            .op_index("bind_queue:audit:events:events.created")
            .is_some());
        assert!(exchange_channel
            .op_index("bind_queue:audit:events:events.deleted")
            .is_some());

        loop {
            if events.recv().await.unwrap() == crate::events::QueueEvent::Bound {
                break;
            }
        }
    }

    #[tokio::test]
    async fn registered_queues_are_reattached_on_reconnect() {
        let (_first, first_conn) = fake_connection();
        let exchange =
            ExchangeChannel::new(ExchangeType::Direct, Some("jobs"), ExchangeOptions::default());
        exchange.connect(&first_conn).await.unwrap();
        exchange
            .queue(QueueOptions::named("work").routing_key("work"))
            .await
            .unwrap();

        let (second, second_conn) = fake_connection();
        exchange.connect(&second_conn).await.unwrap();

        // exchange channel plus the queue's own channel
        assert_eq!(second.channels.lock().unwrap().len(), 2);
        assert!(second
            .channel(1)
            .op_index("declare_queue:work")
            .is_some());
        assert!(second
            .channel(0)
            .op_index("bind_queue:work:jobs:work")
            .is_some());
    }

    #[tokio::test]
    async fn reply_queue_is_exclusive_server_named_and_consumed() {
        let (fake, conn) = fake_connection();
        let exchange =
            ExchangeChannel::new(ExchangeType::Direct, Some("rpc"), ExchangeOptions::with_reply());
        exchange.connect(&conn).await.unwrap();

        let label = exchange.reply_label().await.unwrap();
        assert!(label.starts_with("amq.gen-"));

        let channel = fake.channel(0);
        assert!(channel.op_index(&format!("declare_queue:{label}")).is_some());
        assert!(channel
            .ops
            .lock()
            .unwrap()
            .iter()
            .any(|op| op.starts_with(&format!("consume:{label}"))));
    }

    #[tokio::test]
    async fn stale_channel_close_leaves_reconnected_state_alone() {
        let (first, first_conn) = fake_connection();
        let exchange =
            ExchangeChannel::new(ExchangeType::Direct, Some("rpc"), ExchangeOptions::with_reply());
        exchange.connect(&first_conn).await.unwrap();

        let (_second, second_conn) = fake_connection();
        exchange.connect(&second_conn).await.unwrap();
        let mut events = exchange.subscribe();

        // the old connection's channel reports its close after the reattach
        first.channel(0).close_channel();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(
            exchange.reply_label().await.is_some(),
            "stale close must not wipe the new connection's state"
        );
        assert!(events.try_recv().is_err(), "no close may be reported");

        // the exchange is still usable for publishing
        let publishing = {
            let exchange = exchange.clone();
            tokio::spawn(async move {
                exchange
                    .publish(&Payload::Raw(vec![1]), PublishOptions::key("rpc.ping"))
                    .await
            })
        };
        publishing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rpc_client_requires_a_reply_queue() {
        let exchange =
            ExchangeChannel::new(ExchangeType::Direct, Some("rpc"), ExchangeOptions::default());
        assert_eq!(
            exchange.rpc_client("rpc.call").err(),
            Some(AmqpError::ReplyQueueRequired)
        );
    }

    #[tokio::test]
    async fn rpc_server_requires_a_reply_queue() {
        struct Echo;
        #[async_trait]
        impl RpcHandler for Echo {
            async fn handle(&self, request: Payload) -> Payload {
                request
            }
        }

        let exchange =
            ExchangeChannel::new(ExchangeType::Direct, Some("rpc"), ExchangeOptions::default());
        let result = exchange.rpc_server("rpc.call", Arc::new(Echo)).await;
        assert_eq!(result.err(), Some(AmqpError::ReplyQueueRequired));
    }

    #[tokio::test]
    async fn rpc_call_resolves_with_the_correlated_reply() {
        let (fake, conn) = fake_connection();
        let exchange =
            ExchangeChannel::new(ExchangeType::Direct, Some("rpc"), ExchangeOptions::with_reply());
        exchange.connect(&conn).await.unwrap();
        let reply_label = exchange.reply_label().await.unwrap();

        let client = exchange.rpc_client("rpc.sum").unwrap();
        let calling = tokio::spawn(async move {
            client
                .call(&Payload::Json(json!({ "a": 2, "b": 3 })), None)
                .await
        });

        let channel = fake.channel(0);
        let correlation_id = loop {
            tokio::task::yield_now().await;
            let published = channel.published.lock().unwrap();
            if let Some(request) = published.first() {
                assert_eq!(request.routing_key, "rpc.sum");
                assert_eq!(
                    request.properties.reply_to.as_deref(),
                    Some(reply_label.as_str())
                );
                break request.properties.correlation_id.clone().unwrap();
            }
        };

        channel.deliver(
            &reply_label,
            RawDelivery {
                delivery_tag: 1,
                routing_key: reply_label.clone(),
                redelivered: false,
                payload: br#"{"sum":5}"#.to_vec(),
                properties: MessageProperties {
                    content_type: Some(JSON_CONTENT_TYPE.to_owned()),
                    correlation_id: Some(correlation_id),
                    reply_to: None,
                },
            },
        );

        let reply = calling.await.unwrap().unwrap();
        assert_eq!(reply, Payload::Json(json!({ "sum": 5 })));
    }

    #[tokio::test(start_paused = true)]
    async fn rpc_call_times_out_when_a_deadline_is_given() {
        let (_fake, conn) = fake_connection();
        let exchange =
            ExchangeChannel::new(ExchangeType::Direct, Some("rpc"), ExchangeOptions::with_reply());
        exchange.connect(&conn).await.unwrap();

        let client = exchange.rpc_client("rpc.never").unwrap();
        let result = client
            .call(&Payload::Raw(vec![0]), Some(Duration::from_millis(50)))
            .await;
        assert_eq!(result, Err(AmqpError::RpcTimeout));

        // the registration is withdrawn so a late reply is simply dropped
        assert!(exchange.pending_replies.lock().await.is_empty());
    }
}
