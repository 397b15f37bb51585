//! Leveled logging interface used by the relay
//!
//! Levels are numeric: 0 logs only fatal errors, higher numbers are
//! increasingly verbose. [`TracingLogger`] forwards everything that passes its
//! verbosity check to `tracing`.

use std::error::Error;
use tracing::{debug, error, info, trace, warn};

/// Well-known log levels used by the gateway
pub mod level {
    /// Unexpected failures
    pub const FATAL: u8 = 0;
    /// Recognized but abnormal network conditions
    pub const ABNORMAL: u8 = 1;
    /// Connections arriving, leaving and being evicted
    pub const CONNECTION: u8 = 2;
    /// Retention buffer overflow
    pub const OVERFLOW: u8 = 3;
    /// Gateway open/close
    pub const GATEWAY: u8 = 5;
    /// Listener open/close
    pub const LISTENER: u8 = 6;
    /// Channel open/close
    pub const CHANNEL: u8 = 7;
    /// Per-transfer byte counts
    pub const DATA: u8 = 9;
    /// Most verbose level accepted by the configuration
    pub const MAX: u8 = 9;
}

/// Thread-safe leveled log sink
pub trait Logger: Send + Sync {
    /// Returns true when messages at `level` would be written.
    ///
    /// Callers use this to skip building expensive messages.
    fn check_level(&self, level: u8) -> bool;

    fn log(&self, level: u8, message: &str);

    fn log_error(&self, level: u8, message: &str, error: &dyn Error);
}

/// Logger backed by the `tracing` macros
#[derive(Debug, Clone, Copy)]
pub struct TracingLogger {
    verbosity: u8,
}

impl TracingLogger {
    pub fn new(verbosity: u8) -> Self {
        Self { verbosity }
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new(level::GATEWAY)
    }
}

impl Logger for TracingLogger {
    fn check_level(&self, level: u8) -> bool {
        level <= self.verbosity
    }

    fn log(&self, level: u8, message: &str) {
        if !self.check_level(level) {
            return;
        }
        match level {
            0 => error!("{}", message),
            1 => warn!("{}", message),
            2..=5 => info!("{}", message),
            6..=8 => debug!("{}", message),
            _ => trace!("{}", message),
        }
    }

    fn log_error(&self, level: u8, message: &str, err: &dyn Error) {
        if !self.check_level(level) {
            return;
        }
        match level {
            0 => error!(error = %err, "{}", message),
            1 => warn!(error = %err, "{}", message),
            2..=5 => info!(error = %err, "{}", message),
            6..=8 => debug!(error = %err, "{}", message),
            _ => trace!(error = %err, "{}", message),
        }
    }
}

/// Maps a numeric verbosity onto the `tracing` filter directive that lets
/// every admitted message through.
pub fn tracing_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2..=5 => "info",
        6..=8 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_level() {
        let logger = TracingLogger::new(level::CONNECTION);
        assert!(logger.check_level(level::FATAL));
        assert!(logger.check_level(level::CONNECTION));
        assert!(!logger.check_level(level::OVERFLOW));
        assert!(!logger.check_level(level::DATA));
    }

    #[test]
    fn test_default_verbosity() {
        assert_eq!(TracingLogger::default().verbosity(), level::GATEWAY);
    }

    #[test]
    fn test_tracing_directive() {
        assert_eq!(tracing_directive(0), "error");
        assert_eq!(tracing_directive(1), "warn");
        assert_eq!(tracing_directive(5), "info");
        assert_eq!(tracing_directive(7), "debug");
        assert_eq!(tracing_directive(9), "trace");
    }
}
