//! `WASM_LOG` directive parsing
//!
//! ```text
//! WASM_LOG=info                 every module logs info and above
//! WASM_LOG=warn,greeting=trace  greeting logs everything, others warn+
//! WASM_LOG=greeting             greeting logs everything, others nothing
//! WASM_LOG=off                  nothing
//! ```
//!
//! Levels may also be written as numbers: `0` is off, `1` is error up to
//! `5` for trace.

use std::collections::HashMap;

use tracing::level_filters::LevelFilter;

use super::LogLevel;

/// A level passes when it is at least as severe as the filter.
pub fn level_admits(filter: LevelFilter, level: LogLevel) -> bool {
    tracing::Level::from(level) <= filter
}

/// Parsed `WASM_LOG` value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    default_level: Option<LevelFilter>,
    module_levels: HashMap<String, LevelFilter>,
}

impl LogFilter {
    /// Parse a comma separated directive list. Invalid directives are
    /// skipped with a warning.
    pub fn parse(env: &str) -> Self {
        let mut filter = LogFilter::default();

        for directive in env.split(',').map(str::trim) {
            if directive.is_empty() {
                continue;
            }

            let mut parts = directive.split('=');
            let head = parts.next().unwrap_or_default().trim();
            let tail = parts.next().map(str::trim);
            if parts.next().is_some() {
                tracing::warn!(directive, "invalid WASM_LOG directive, ignoring it");
                continue;
            }

            let (module, level) = match tail {
                // "info", "1", or a bare module name
                None => match head.parse::<LevelFilter>() {
                    Ok(level) => (None, level),
                    Err(_) => (Some(head), LevelFilter::TRACE),
                },
                // "module="
                Some("") => (Some(head), LevelFilter::TRACE),
                // "module=info"
                Some(level) => match level.parse::<LevelFilter>() {
                    Ok(level) => (Some(head), level),
                    Err(error) => {
                        tracing::warn!(directive, %error, "invalid WASM_LOG level, ignoring it");
                        continue;
                    }
                },
            };

            match module {
                Some(module) if module.is_empty() => {
                    tracing::warn!(directive, "WASM_LOG directive without a module name, ignoring it");
                }
                Some(module) => {
                    filter.module_levels.insert(module.to_string(), level);
                }
                None if filter.default_level.is_some() => {
                    tracing::warn!(directive, "WASM_LOG default level set twice, ignoring it");
                }
                None => filter.default_level = Some(level),
            }
        }

        filter
    }

    /// Level filter for a module: its own directive, else the default.
    pub fn module_level(&self, module: &str) -> Option<LevelFilter> {
        self.module_levels
            .get(module)
            .copied()
            .or(self.default_level)
    }

    /// Whether `module` may emit `level`. Modules without any applicable
    /// directive emit nothing.
    pub fn admits(&self, module: &str, level: LogLevel) -> bool {
        self.module_level(module)
            .is_some_and(|filter| level_admits(filter, level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_admits_nothing() {
        let filter = LogFilter::parse("off");
        for level in LogLevel::ALL {
            assert!(!filter.admits("greeting", level));
        }
    }

    #[test]
    fn level_admits_itself_and_more_severe() {
        let filter = LogFilter::parse("info");
        assert!(filter.admits("m", LogLevel::Error));
        assert!(filter.admits("m", LogLevel::Warn));
        assert!(filter.admits("m", LogLevel::Info));
        assert!(!filter.admits("m", LogLevel::Debug));
        assert!(!filter.admits("m", LogLevel::Trace));
    }

    #[test]
    fn numeric_levels() {
        assert_eq!(LogFilter::parse("2").module_level("m"), Some(LevelFilter::WARN));
        assert_eq!(LogFilter::parse("0").module_level("m"), Some(LevelFilter::OFF));
    }

    #[test]
    fn module_directive_overrides_default() {
        let filter = LogFilter::parse("error,greeting=debug");
        assert!(filter.admits("greeting", LogLevel::Debug));
        assert!(!filter.admits("other", LogLevel::Warn));
        assert!(filter.admits("other", LogLevel::Error));
    }

    #[test]
    fn bare_module_enables_everything_for_it_only() {
        let filter = LogFilter::parse("greeting");
        assert!(filter.admits("greeting", LogLevel::Trace));
        assert!(!filter.admits("other", LogLevel::Error));

        let filter = LogFilter::parse("greeting=");
        assert!(filter.admits("greeting", LogLevel::Trace));
    }

    #[test]
    fn invalid_directives_are_skipped() {
        let filter = LogFilter::parse("a=b=c,greeting=loud,warn");
        assert_eq!(filter.module_level("a"), Some(LevelFilter::WARN));
        assert_eq!(filter.module_level("greeting"), Some(LevelFilter::WARN));
    }

    #[test]
    fn first_default_wins() {
        let filter = LogFilter::parse("error,trace");
        assert_eq!(filter.module_level("m"), Some(LevelFilter::ERROR));
    }
}
