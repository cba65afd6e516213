// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Layer
//!
//! This module provides the error types for connection, channel, exchange, queue
//! and RPC operations. Construction errors are returned synchronously from the
//! constructors that detect them; transport errors flow through the reconnection
//! classifier before they surface here.

use thiserror::Error;

/// Represents errors that can occur while orchestrating AMQP resources.
///
/// The enum covers the full taxonomy: synchronous construction errors,
/// connection-level failures (including retry exhaustion), topology
/// declaration failures, message-level failures and RPC failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// A manager was constructed without a broker url
    #[error("url required for rabbit connection")]
    UrlRequired,

    /// An exchange was constructed without a type
    #[error("missing exchange type")]
    MissingExchangeType,

    /// An RPC client or server was requested on an exchange with no reply queue
    #[error("exchange has no reply queue configured")]
    ReplyQueueRequired,

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Reconnection attempts were exhausted without recovering the connection
    #[error("reconnection retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// An operation was issued while no connection is live
    #[error("connection closed")]
    ConnectionClosed,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// Error configuring the per-queue prefetch
    #[error("failure to configure qos: {0}")]
    QosError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishError(String),

    /// Error registering or driving a consumer
    #[error("failure to consume: {0}")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackError(String),

    /// Error cancelling a consumer by tag
    #[error("failure to cancel consumer: {0}")]
    CancelError(String),

    /// Error purging a queue
    #[error("failure to purge queue: {0}")]
    PurgeError(String),

    /// A message declared as JSON could not be parsed
    #[error("unable to parse message as JSON")]
    DecodePayloadError,

    /// An RPC call hit its caller-imposed deadline
    #[error("rpc call timed out")]
    RpcTimeout,

    /// The reply registration for an RPC call was dropped before a reply arrived
    #[error("rpc reply channel dropped")]
    RpcCorrelationDropped,
}
