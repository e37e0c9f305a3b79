use std::time::Duration;

use crate::protocol::DEFAULT_MAX_STRING_LEN;

pub const DEFAULT_PORT: u16 = 14005;
pub const DEFAULT_WORKERS: usize = 2;

/// How accepted connections are turned into running sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// A fixed number of workers claim connections from a shared queue and run each session
    /// inline. At most `workers` sessions are active at once.
    #[default]
    Pool,
    /// Every connection gets its own handler thread, tracked in a session registry.
    /// Concurrency is unbounded.
    PerConnection,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub workers: usize,
    pub dispatch: DispatchMode,
    /// How long the acceptor and idle workers sleep between polls.
    pub poll_interval: Duration,
    /// Read and write timeout on accepted streams; bounds how long a stop request can go
    /// unnoticed by a session blocked on a silent peer.
    pub io_timeout: Duration,
    pub max_string_len: u32,
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            dispatch: DispatchMode::Pool,
            poll_interval: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
            max_string_len: DEFAULT_MAX_STRING_LEN,
            backlog: 128,
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16, workers: usize) -> Self {
        Self {
            port,
            workers,
            ..Self::default()
        }
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_max_string_len(mut self, max: u32) -> Self {
        self.max_string_len = max;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Checks the settings that would otherwise fail deep inside a running server.
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("worker count must be at least 1".to_string());
        }
        if self.poll_interval.is_zero() {
            return Err("poll interval must be non-zero".to_string());
        }
        // A zero timeout is rejected by set_read_timeout.
        if self.io_timeout.is_zero() {
            return Err("io timeout must be non-zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.dispatch, DispatchMode::Pool);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_is_invalid() {
        let config = ServerConfig::new(0, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeouts_are_invalid() {
        let config = ServerConfig::default().with_io_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = ServerConfig::default().with_poll_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
