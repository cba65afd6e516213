// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin-backed Transport
//!
//! This module implements the [`Transport`] contract on top of `lapin`. It
//! establishes named connections to the RabbitMQ server, forwards deliveries
//! from lapin consumer streams into the transport's delivery channels, and
//! maps lapin failures into [`TransportFailure`] for the reconnection
//! classifier.

use crate::errors::AmqpError;
use crate::transport::{
    ConsumeOptions, DeclareQueueOptions, ExchangeType, MessageProperties, PublishOutcome,
    RawDelivery, Transport, TransportChannel, TransportConnection, TransportEvent,
    TransportFailure,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Connection, ConnectionProperties, ExchangeKind,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Header field used to specify message TTL on a queue
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Header field used to specify a consumer's priority
pub const AMQP_HEADERS_CONSUMER_PRIORITY: &str = "x-priority";

/// How often connection and channel status is sampled for close/blocked
/// transitions lapin does not surface through its error callback
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn failure_from_lapin(err: &lapin::Error) -> TransportFailure {
    match err {
        lapin::Error::ProtocolError(amqp) => {
            TransportFailure::new(Some(amqp.get_id()), amqp.to_string())
        }
        lapin::Error::IOError(io) => TransportFailure::from_io(io.kind(), io.to_string()),
        other => TransportFailure::new(None, other.to_string()),
    }
}

/// [`Transport`] implementation backed by `lapin`.
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Arc<AmqpTransport> {
        Arc::new(AmqpTransport)
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        url: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn TransportConnection>, TransportFailure> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let conn = match Connection::connect(url, options).await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(failure_from_lapin(&err));
            }
        };
        debug!("amqp connected");

        Ok(Arc::new(AmqpConnection::new(conn)))
    }
}

pub struct AmqpConnection {
    conn: Connection,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl AmqpConnection {
    fn new(conn: Connection) -> AmqpConnection {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let error_tx = events_tx.clone();
        conn.on_error(move |err| {
            let _ = error_tx.send(TransportEvent::Closed(Some(failure_from_lapin(&err))));
        });

        // lapin reports connection.blocked through its status, not through
        // the error callback, so transitions are sampled.
        let status = conn.status().clone();
        tokio::spawn(async move {
            let mut blocked = false;
            loop {
                tokio::time::sleep(STATUS_POLL_INTERVAL).await;
                if !status.connected() {
                    break;
                }
                let now_blocked = status.blocked();
                if now_blocked != blocked {
                    blocked = now_blocked;
                    let event = if blocked {
                        TransportEvent::Blocked("connection blocked by broker".to_owned())
                    } else {
                        TransportEvent::Unblocked
                    };
                    if events_tx.send(event).is_err() {
                        break;
                    }
                }
            }
        });

        AmqpConnection {
            conn,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }
}

#[async_trait]
impl TransportConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel::new(channel)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn is_writable(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(200, "closed by client")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

pub struct AmqpChannel {
    channel: lapin::Channel,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl AmqpChannel {
    fn new(channel: lapin::Channel) -> AmqpChannel {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Channel-local closes (precondition failures, forced closes) do not
        // reach the connection error callback; the status is sampled instead.
        let status = channel.status().clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(STATUS_POLL_INTERVAL).await;
                if !status.connected() {
                    let _ = events_tx.send(TransportEvent::Closed(None));
                    break;
                }
            }
        });

        AmqpChannel {
            channel,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
    }
}

fn queue_arguments(options: &DeclareQueueOptions) -> FieldTable {
    let mut map = BTreeMap::<ShortString, AMQPValue>::new();

    if let Some(ttl) = options.message_ttl {
        map.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(ttl),
        );
    }

    if let Some(max_length) = options.max_length {
        map.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(max_length),
        );
    }

    FieldTable::from(map)
}

fn consume_arguments(options: &ConsumeOptions) -> FieldTable {
    let mut map = BTreeMap::<ShortString, AMQPValue>::new();

    if let Some(priority) = options.priority {
        map.insert(
            ShortString::from(AMQP_HEADERS_CONSUMER_PRIORITY),
            AMQPValue::LongInt(priority),
        );
    }

    FieldTable::from(map)
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default();

    if let Some(content_type) = &properties.content_type {
        props = props.with_content_type(ShortString::from(content_type.clone()));
    }

    if let Some(correlation_id) = &properties.correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id.clone()));
    }

    if let Some(reply_to) = &properties.reply_to {
        props = props.with_reply_to(ShortString::from(reply_to.clone()));
    }

    props
}

#[async_trait]
impl TransportChannel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to declare the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &DeclareQueueOptions,
    ) -> Result<String, AmqpError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                queue_arguments(options),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to declare the queue");
                AmqpError::DeclareQueueError(name.to_owned())
            })?;

        Ok(queue.name().as_str().to_owned())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to bind the queue");
                AmqpError::BindQueueError(queue.to_owned(), exchange.to_owned())
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|err| AmqpError::QosError(err.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<PublishOutcome, AmqpError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                basic_properties(&properties),
            )
            .await
            .map_err(|err| AmqpError::PublishError(err.to_string()))?;

        // lapin buffers outbound frames internally and never exposes a
        // saturated write buffer to the caller.
        Ok(PublishOutcome::Flushed)
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<(String, mpsc::UnboundedReceiver<RawDelivery>), AmqpError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                options.consumer_tag.as_deref().unwrap_or(""),
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                consume_arguments(options),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to start the consumer");
                AmqpError::ConsumerError(err.to_string())
            })?;

        let tag = consumer.tag().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(err) => {
                        error!(error = err.to_string(), "consumer stream error");
                        break;
                    }
                };

                let raw = RawDelivery {
                    delivery_tag: delivery.delivery_tag,
                    routing_key: delivery.routing_key.to_string(),
                    redelivered: delivery.redelivered,
                    payload: delivery.data,
                    properties: MessageProperties {
                        content_type: delivery
                            .properties
                            .content_type()
                            .as_ref()
                            .map(|ct| ct.to_string()),
                        correlation_id: delivery
                            .properties
                            .correlation_id()
                            .as_ref()
                            .map(|id| id.to_string()),
                        reply_to: delivery
                            .properties
                            .reply_to()
                            .as_ref()
                            .map(|rt| rt.to_string()),
                    },
                };

                if tx.send(raw).is_err() {
                    break;
                }
            }
        });

        Ok((tag, rx))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| AmqpError::AckError(err.to_string()))
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        all_up_to: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: all_up_to,
                    requeue,
                },
            )
            .await
            .map_err(|err| AmqpError::NackError(err.to_string()))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::CancelError(err.to_string()))
    }

    async fn purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|err| AmqpError::PurgeError(err.to_string()))
    }

    fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}
