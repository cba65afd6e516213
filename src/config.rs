// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnection Configuration
//!
//! Options are resolved exactly once at manager construction, with a fixed
//! precedence: explicit option > environment override > hard-coded default.
//! Nothing is re-read afterwards. When the exact-timeout flag is off, the
//! effective reconnection timeout is rolled once with up to 10% of random
//! overhead and held fixed for the lifetime of the manager.

use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_RECONNECTION_TIMEOUT: &str = "RABBIT_RECONNECTION_TIMEOUT";
pub const ENV_RECONNECTION_RETRIES: &str = "RABBIT_RECONNECTION_RETRIES";
pub const ENV_CONNECTION_NAME: &str = "RABBIT_CONNECTION_NAME";
pub const ENV_EXACT_TIMEOUT: &str = "RABBIT_RECONNECTION_EXACT_TIMEOUT";

const DEFAULT_RECONNECTION_TIMEOUT_MS: u64 = 2000;
const DEFAULT_MAX_RETRIES: u32 = 20;
const DEFAULT_CONNECTION_NAME: &str = "rabbitmq-resilience";

/// Options accepted at manager construction. Every field is optional; unset
/// fields fall back to the environment, then to the hard defaults.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub reconnection_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub connection_name: Option<String>,
    pub exact_timeout: Option<bool>,
}

impl ConnectOptions {
    pub fn new() -> ConnectOptions {
        ConnectOptions::default()
    }

    pub fn reconnection_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.reconnection_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    /// Disables the random timeout overhead so retries use the base timeout
    /// exactly.
    pub fn exact_timeout(mut self) -> Self {
        self.exact_timeout = Some(true);
        self
    }
}

/// The resolved reconnection policy. The effective timeout is computed once
/// here and never re-rolled per attempt.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    effective_timeout_ms: u64,
    max_retries: u32,
    connection_name: String,
}

impl ReconnectPolicy {
    pub fn resolve(options: &ConnectOptions) -> ReconnectPolicy {
        let base = options
            .reconnection_timeout_ms
            .or_else(|| env_parse(ENV_RECONNECTION_TIMEOUT))
            .unwrap_or(DEFAULT_RECONNECTION_TIMEOUT_MS);

        let max_retries = options
            .max_retries
            .or_else(|| env_parse(ENV_RECONNECTION_RETRIES))
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let connection_name = options
            .connection_name
            .clone()
            .or_else(|| env::var(ENV_CONNECTION_NAME).ok())
            .unwrap_or_else(|| DEFAULT_CONNECTION_NAME.to_owned());

        let exact = options
            .exact_timeout
            .unwrap_or_else(|| env::var(ENV_EXACT_TIMEOUT).is_ok_and(|v| v == "true"));

        let effective_timeout_ms = if exact {
            base
        } else {
            (base as f64 * (1.0 + rand::random::<f64>() * 0.1)).floor() as u64
        };

        ReconnectPolicy {
            effective_timeout_ms,
            max_retries,
            connection_name,
        }
    }

    pub fn effective_timeout(&self) -> Duration {
        Duration::from_millis(self.effective_timeout_ms)
    }

    pub fn effective_timeout_ms(&self) -> u64 {
        self.effective_timeout_ms
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // process environment is shared across the test binary
    static ENV_GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn hard_defaults_apply_when_nothing_is_set() {
        let _guard = ENV_GUARD.lock().unwrap();
        env::remove_var(ENV_RECONNECTION_TIMEOUT);
        env::remove_var(ENV_RECONNECTION_RETRIES);
        env::remove_var(ENV_CONNECTION_NAME);
        env::remove_var(ENV_EXACT_TIMEOUT);

        let policy = ReconnectPolicy::resolve(&ConnectOptions::new().exact_timeout());

        assert_eq!(policy.effective_timeout_ms(), DEFAULT_RECONNECTION_TIMEOUT_MS);
        assert_eq!(policy.max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(policy.connection_name(), DEFAULT_CONNECTION_NAME);
    }

    #[test]
    fn explicit_options_win_over_environment() {
        let _guard = ENV_GUARD.lock().unwrap();
        env::set_var(ENV_RECONNECTION_TIMEOUT, "9999");
        env::set_var(ENV_RECONNECTION_RETRIES, "3");
        env::set_var(ENV_CONNECTION_NAME, "from-env");

        let options = ConnectOptions::new()
            .reconnection_timeout_ms(100)
            .max_retries(7)
            .connection_name("explicit")
            .exact_timeout();
        let policy = ReconnectPolicy::resolve(&options);

        assert_eq!(policy.effective_timeout_ms(), 100);
        assert_eq!(policy.max_retries(), 7);
        assert_eq!(policy.connection_name(), "explicit");

        env::remove_var(ENV_RECONNECTION_TIMEOUT);
        env::remove_var(ENV_RECONNECTION_RETRIES);
        env::remove_var(ENV_CONNECTION_NAME);
    }

    #[test]
    fn environment_wins_over_hard_defaults() {
        let _guard = ENV_GUARD.lock().unwrap();
        env::set_var(ENV_RECONNECTION_TIMEOUT, "1234");
        env::set_var(ENV_RECONNECTION_RETRIES, "5");

        let policy = ReconnectPolicy::resolve(&ConnectOptions::new().exact_timeout());

        assert_eq!(policy.effective_timeout_ms(), 1234);
        assert_eq!(policy.max_retries(), 5);

        env::remove_var(ENV_RECONNECTION_TIMEOUT);
        env::remove_var(ENV_RECONNECTION_RETRIES);
    }

    #[test]
    fn jittered_timeout_stays_within_ten_percent_overhead() {
        let _guard = ENV_GUARD.lock().unwrap();
        env::remove_var(ENV_RECONNECTION_TIMEOUT);
        env::remove_var(ENV_EXACT_TIMEOUT);

        for _ in 0..200 {
            let options = ConnectOptions::new().reconnection_timeout_ms(1000);
            let policy = ReconnectPolicy::resolve(&options);
            let ms = policy.effective_timeout_ms();
            assert!((1000..1100).contains(&ms), "effective timeout {ms} out of range");
        }
    }

    #[test]
    fn effective_timeout_is_rolled_once_per_policy() {
        let _guard = ENV_GUARD.lock().unwrap();
        env::remove_var(ENV_EXACT_TIMEOUT);

        let policy = ReconnectPolicy::resolve(&ConnectOptions::new().reconnection_timeout_ms(1000));
        let first = policy.effective_timeout_ms();
        for _ in 0..10 {
            assert_eq!(policy.effective_timeout_ms(), first);
        }
    }
}
