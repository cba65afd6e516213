// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle Events and the Logger Capability
//!
//! Every manager, exchange and queue broadcasts its lifecycle transitions so
//! the application can observe connection health without polling. When no
//! [`Logger`] capability is injected into the manager, log records are emitted
//! as [`Event::Log`] on the manager's event stream instead of being written to
//! a sink.

use crate::errors::AmqpError;
use std::fmt;

/// Severity of a log record produced by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Fatal => write!(f, "fatal"),
        }
    }
}

/// Logging capability accepted by the connection manager.
///
/// The manager never writes to a sink itself; it either calls this capability
/// or falls back to emitting [`Event::Log`].
#[cfg_attr(test, mockall::automock)]
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// [`Logger`] implementation that forwards records to `tracing` at the
/// matching level.
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Fatal => tracing::error!("{message}"),
        }
    }
}

/// Connection-level lifecycle events broadcast by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The initial connection is up and every pending exchange reported ready
    Connected,
    /// A reconnection attempt is about to be issued
    Reconnecting { attempt: u32, max_retries: u32 },
    /// A lost connection was recovered and the whole topology reattached
    Reconnected,
    /// The broker blocked the connection (resource alarm)
    Blocked { reason: String },
    /// The broker unblocked the connection
    Unblocked,
    /// The connection was closed explicitly
    Close,
    /// A fatal, non-recoverable failure; the manager stays disconnected and
    /// the owning application decides whether to exit
    Error(AmqpError),
    /// Log record fallback used when no [`Logger`] capability was injected
    Log { level: LogLevel, message: String },
}

/// Per-exchange lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// The exchange obtained a channel on the current connection
    Connected,
    /// Exchange assertion (and reply-queue setup, if any) completed and all
    /// registered queues reattached
    Ready,
    /// The exchange's channel closed; local state was reset
    Close,
    Error(String),
}

/// Per-queue lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// The queue obtained its own channel
    Connected,
    /// Queue assertion completed and buffered consumers were replayed
    Ready,
    /// Every requested routing key was bound to the owning exchange
    Bound,
    /// A consumer registration went live on the broker
    Consuming,
    /// The queue's channel closed; local state was reset
    Close,
    Error(String),
}
