// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

pub mod channel;
pub mod config;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod manager;
pub mod message;
pub mod queue;
pub mod transport;

pub use channel::AmqpTransport;
pub use config::ConnectOptions;
pub use errors::AmqpError;
pub use events::{Event, ExchangeEvent, LogLevel, Logger, QueueEvent, TracingLogger};
pub use exchange::{
    ExchangeChannel, ExchangeOptions, ExchangeWriter, PublishOptions, RpcClient, RpcHandler,
};
pub use manager::{ConnectionManager, ConnectionState};
pub use message::Payload;
pub use queue::{handler_fn, ConsumerHandler, Delivery, NackOptions, QueueChannel, QueueOptions};
pub use transport::{ConsumeOptions, ExchangeType};
