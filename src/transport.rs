// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Contract
//!
//! The resilience core never talks to `lapin` directly; it drives these
//! object-safe traits instead. The production implementation lives in
//! [`crate::channel`]; tests drive the core with an in-memory transport that
//! counts every call and scripts failures.

use crate::errors::AmqpError;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// AMQP soft-close code the broker uses when it forcibly closes a connection
pub const CONNECTION_FORCED_CODE: u16 = 320;

/// Message produced when the socket dies mid-handshake
pub const HANDSHAKE_ABORT_MESSAGE: &str = "Socket closed abruptly during opening handshake";

/// A connection-level failure reported by the transport.
///
/// Carries enough structure for the reconnection classifier: the AMQP reply
/// code when the broker closed the connection, the IO error kind when the
/// socket failed, and the raw message for substring matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub code: Option<u16>,
    pub io_kind: Option<io::ErrorKind>,
    pub message: String,
}

impl TransportFailure {
    pub fn new(code: Option<u16>, message: impl Into<String>) -> TransportFailure {
        TransportFailure {
            code,
            io_kind: None,
            message: message.into(),
        }
    }

    pub fn from_io(kind: io::ErrorKind, message: impl Into<String>) -> TransportFailure {
        TransportFailure {
            code: None,
            io_kind: Some(kind),
            message: message.into(),
        }
    }

    /// Whether losing the connection for this reason warrants a retry.
    ///
    /// Reconnectable: the broker's forced-close code, a handshake abort, or a
    /// TCP-level connection error (refused, reset, or generic). Everything
    /// else is fatal.
    pub fn is_reconnectable(&self) -> bool {
        if self.code == Some(CONNECTION_FORCED_CODE) {
            return true;
        }

        if self.message == HANDSHAKE_ABORT_MESSAGE || self.message.contains("ECONN") {
            return true;
        }

        matches!(
            self.io_kind,
            Some(
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            )
        )
    }
}

/// Out-of-band notifications from a live connection or channel.
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection or channel closed; `None` when no failure was reported
    Closed(Option<TransportFailure>),
    Blocked(String),
    Unblocked,
}

/// Properties carried alongside a message body on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

/// A message as delivered by the broker, before decoding.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

/// Result of handing a message to the channel's write side.
#[derive(Debug)]
pub enum PublishOutcome {
    /// The outbound buffer accepted the frame
    Flushed,
    /// The outbound buffer is saturated; the receiver resolves on drain
    Backpressure(oneshot::Receiver<()>),
}

/// Routing behavior of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
        }
    }
}

/// Options for asserting a queue.
#[derive(Debug, Clone, Default)]
pub struct DeclareQueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub message_ttl: Option<i32>,
    pub max_length: Option<i32>,
}

/// Options for registering a consumer.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub consumer_tag: Option<String>,
    pub no_ack: bool,
    pub exclusive: bool,
    /// Consumer priority; higher-priority consumers receive messages while
    /// active, lower ones only when they are blocked
    pub priority: Option<i32>,
}

/// Connection factory. One `connect` call per attempt; the returned handle is
/// owned exclusively by the connection manager.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn TransportConnection>, TransportFailure>;
}

/// A live broker connection.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError>;

    /// Close/blocked/unblocked notifications for this connection. Takeable
    /// exactly once; the manager's supervision task owns the stream.
    fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Whether the write side of the underlying socket is currently open.
    fn is_writable(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel scoped to one exchange or one queue.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
    ) -> Result<(), AmqpError>;

    /// Asserts a queue and returns the broker-assigned name (a generated
    /// label when the requested name is empty).
    async fn declare_queue(
        &self,
        name: &str,
        options: &DeclareQueueOptions,
    ) -> Result<String, AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<PublishOutcome, AmqpError>;

    /// Registers a consumer; returns the broker-issued consumer tag and the
    /// delivery stream.
    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<(String, mpsc::UnboundedReceiver<RawDelivery>), AmqpError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, all_up_to: bool, requeue: bool)
        -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Purges the queue, returning the purged message count.
    async fn purge(&self, queue: &str) -> Result<u32, AmqpError>;

    /// Channel-local close notifications. Takeable exactly once.
    fn take_event_stream(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_close_code_is_reconnectable() {
        let failure = TransportFailure::new(Some(CONNECTION_FORCED_CODE), "Connection to RabbitMQ lost");
        assert!(failure.is_reconnectable());
    }

    #[test]
    fn handshake_abort_is_reconnectable() {
        let failure = TransportFailure::new(None, HANDSHAKE_ABORT_MESSAGE);
        assert!(failure.is_reconnectable());
    }

    #[test]
    fn econn_substrings_are_reconnectable() {
        for message in ["ECONNREFUSED", "ECONNRESET", "read ECONNRESET by peer"] {
            assert!(TransportFailure::new(None, message).is_reconnectable());
        }
    }

    #[test]
    fn tcp_level_io_kinds_are_reconnectable() {
        for kind in [
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
        ] {
            assert!(TransportFailure::from_io(kind, "socket error").is_reconnectable());
        }
    }

    #[test]
    fn anything_else_is_fatal() {
        assert!(!TransportFailure::new(None, "ACCESS_REFUSED - login refused").is_reconnectable());
        assert!(!TransportFailure::new(Some(403), "forbidden").is_reconnectable());
        assert!(!TransportFailure::from_io(io::ErrorKind::PermissionDenied, "denied").is_reconnectable());
    }
}
