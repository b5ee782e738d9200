//! Logging Bridge
//!
//! Guest code logs through the `host.log_utf8_string` import. Each call is
//! checked against three gates before it reaches the host sink:
//!
//! 1. the module's `logger_enabled` flag,
//! 2. the level's bit in the module's `logging_mask`,
//! 3. the module's resolved `WASM_LOG` directives.
//!
//! ## Levels
//!
//! ```text
//! guest int   level   mask bit
//! 1           error   0x01
//! 2           warn    0x02
//! 3           info    0x04
//! 4           debug   0x08
//! 5           trace   0x10
//! ```
//!
//! Any other integer is treated as trace.

mod filter;

pub use filter::{level_admits, LogFilter};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Log level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
    ];

    /// Decode the level integer passed by guest code.
    pub fn from_guest(raw: i32) -> Self {
        match raw {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn to_guest(self) -> i32 {
        match self {
            LogLevel::Error => 1,
            LogLevel::Warn => 2,
            LogLevel::Info => 3,
            LogLevel::Debug => 4,
            LogLevel::Trace => 5,
        }
    }

    pub fn mask_bit(self) -> i64 {
        1 << (self.to_guest() - 1)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    /// Level names, case-insensitive, or guest numbers `1..=5`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<tracing::Level>()
            .map(LogLevel::from)
            .map_err(|e| format!("invalid log level `{s}`: {e}"))
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        if level == tracing::Level::ERROR {
            LogLevel::Error
        } else if level == tracing::Level::WARN {
            LogLevel::Warn
        } else if level == tracing::Level::INFO {
            LogLevel::Info
        } else if level == tracing::Level::DEBUG {
            LogLevel::Debug
        } else {
            LogLevel::Trace
        }
    }
}

/// Set of levels a module is allowed to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingMask(i64);

impl LoggingMask {
    pub const ALL: LoggingMask = LoggingMask(0x1f);
    pub const NONE: LoggingMask = LoggingMask(0);

    pub fn from_bits(bits: i64) -> Self {
        LoggingMask(bits)
    }

    pub fn bits(self) -> i64 {
        self.0
    }

    pub fn allows(self, level: LogLevel) -> bool {
        self.0 & level.mask_bit() != 0
    }
}

impl Default for LoggingMask {
    fn default() -> Self {
        LoggingMask::ALL
    }
}

/// A guest log record that passed filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Id of the service whose module logged.
    pub service: String,
    pub message: String,
    pub level: LogLevel,
}

/// Host callback receiving guest log records.
pub type LogSink = Arc<dyn Fn(LogMessage) + Send + Sync>;

/// Sink that forwards guest records to `tracing`.
pub fn tracing_sink() -> LogSink {
    Arc::new(|record: LogMessage| {
        let service = record.service.as_str();
        let guest_message = record.message.as_str();
        match record.level {
            LogLevel::Trace => tracing::trace!(service, guest_message, "guest log"),
            LogLevel::Debug => tracing::debug!(service, guest_message, "guest log"),
            LogLevel::Info => tracing::info!(service, guest_message, "guest log"),
            LogLevel::Warn => tracing::warn!(service, guest_message, "guest log"),
            LogLevel::Error => tracing::error!(service, guest_message, "guest log"),
        }
    })
}

/// Per-module logger installed behind `host.log_utf8_string`.
#[derive(Clone)]
pub struct ModuleLogger {
    service_id: String,
    module: String,
    enabled: bool,
    mask: LoggingMask,
    level: Option<LevelFilter>,
    sink: LogSink,
}

impl fmt::Debug for ModuleLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLogger")
            .field("service_id", &self.service_id)
            .field("module", &self.module)
            .field("enabled", &self.enabled)
            .field("mask", &self.mask)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

impl ModuleLogger {
    /// Build a logger for `module`; `wasm_log` is its resolved `WASM_LOG`.
    pub fn new(
        service_id: impl Into<String>,
        module: impl Into<String>,
        enabled: bool,
        mask: LoggingMask,
        wasm_log: &str,
        sink: LogSink,
    ) -> Self {
        let module = module.into();
        let level = LogFilter::parse(wasm_log).module_level(&module);
        Self {
            service_id: service_id.into(),
            module,
            enabled,
            mask,
            level,
            sink,
        }
    }

    pub fn admits(&self, level: LogLevel) -> bool {
        self.enabled
            && self.mask.allows(level)
            && self.level.is_some_and(|filter| level_admits(filter, level))
    }

    /// Forward one guest record if it passes all gates.
    pub fn log(&self, raw_level: i32, target: &str, message: &str) {
        let level = LogLevel::from_guest(raw_level);
        if !self.admits(level) {
            return;
        }

        tracing::trace!(
            service_id = %self.service_id,
            module = %self.module,
            target,
            %level,
            "forwarding guest log"
        );

        (self.sink)(LogMessage {
            service: self.service_id.clone(),
            message: message.to_string(),
            level,
        });
    }

    /// Forward a record given as raw guest bytes. Records whose target or
    /// message is not valid UTF-8 are dropped with a host-side warning.
    pub fn log_bytes(&self, raw_level: i32, target: &[u8], message: &[u8]) {
        let decoded = std::str::from_utf8(target)
            .and_then(|target| std::str::from_utf8(message).map(|message| (target, message)));
        match decoded {
            Ok((target, message)) => self.log(raw_level, target, message),
            Err(error) => tracing::warn!(
                service_id = %self.service_id,
                module = %self.module,
                %error,
                "guest log record is not valid UTF-8, dropping it"
            ),
        }
    }
}
