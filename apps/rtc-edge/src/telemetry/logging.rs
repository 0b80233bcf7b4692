//! Subscriber setup for the device binary.
//!
//! The webrtc crates log every ICE check and SCTP chunk at debug, so they
//! stay capped at `warn` while the engine's own targets follow the chosen
//! level. `RTC_EDGE_TRACE_DEPS=1` lifts the cap and `RTC_EDGE_LOG_FILTER`
//! replaces the directives outright.

use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

pub const FILTER_ENV: &str = "RTC_EDGE_LOG_FILTER";
pub const TRACE_DEPS_ENV: &str = "RTC_EDGE_TRACE_DEPS";

/// Targets of the peer-connection stack.
const WEBRTC_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
    "webrtc_data",
    "webrtc_util",
    "interceptor",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
    /// Complete `EnvFilter` directives, used verbatim when set.
    pub filter: Option<String>,
    pub dependency_traces: bool,
}

impl LogConfig {
    /// Level and file from the command line, overrides from the environment.
    pub fn from_env(level: LogLevel, file: Option<PathBuf>) -> Self {
        Self {
            level,
            file,
            filter: std::env::var(FILTER_ENV).ok().filter(|filter| !filter.trim().is_empty()),
            dependency_traces: super::env_truthy(TRACE_DEPS_ENV).unwrap_or(false),
        }
    }

    /// Whether the webrtc targets end up quieter than the engine's own.
    pub fn caps_webrtc(&self) -> bool {
        self.filter.is_none() && !self.dependency_traces && self.level > LogLevel::Info
    }

    pub fn directives(&self) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        // Unrelated crates never go below info.
        let global = self.level.min(LogLevel::Info);
        let mut directives = global.directive().to_owned();
        if self.level > global {
            directives.push_str(&format!(",rtc_edge={}", self.level.directive()));
        }
        if self.caps_webrtc() {
            for target in WEBRTC_TARGETS {
                directives.push_str(&format!(",{target}=warn"));
            }
        } else if self.dependency_traces && self.level > global {
            for target in WEBRTC_TARGETS {
                directives.push_str(&format!(",{target}={}", self.level.directive()));
            }
        }
        directives
    }

    fn writer(&self) -> Result<(NonBlocking, WorkerGuard), InitError> {
        let Some(path) = &self.file else {
            return Ok(tracing_appender::non_blocking(std::io::stderr()));
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| InitError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(tracing_appender::non_blocking(file))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("failed to install subscriber: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Flushes buffered log lines when dropped. Keep it alive until exit.
#[must_use]
pub struct LogGuard(#[allow(dead_code)] WorkerGuard);

/// Install the global subscriber. Returns `None` when one is already set.
pub fn init(config: &LogConfig) -> Result<Option<LogGuard>, InitError> {
    if tracing::dispatcher::has_been_set() {
        return Ok(None);
    }
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(config.level).into())
        .parse(config.directives())?;
    let (writer, guard) = config.writer()?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    if config.caps_webrtc() {
        tracing::info!("webrtc logs capped at warn; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to lift");
    }
    Ok(Some(LogGuard(guard)))
}

/// Lazily rendered dump of a signaling frame: offset, hex pairs, printable text.
pub struct FrameDump<'a>(pub &'a [u8]);

impl fmt::Display for FrameDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const ROW: usize = 16;
        for (row, chunk) in self.0.chunks(ROW).enumerate() {
            write!(f, "\n{:06x} ", row * ROW)?;
            for slot in 0..ROW {
                match chunk.get(slot) {
                    Some(byte) => write!(f, " {byte:02x}")?,
                    None => f.write_str("   ")?,
                }
            }
            f.write_str("  |")?;
            for &byte in chunk {
                let shown = if byte.is_ascii_graphic() || byte == b' ' { byte as char } else { '.' };
                write!(f, "{shown}")?;
            }
            f.write_str("|")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: LogLevel) -> LogConfig {
        LogConfig {
            level,
            ..LogConfig::default()
        }
    }

    #[test]
    fn quiet_levels_apply_everywhere() {
        assert_eq!(config(LogLevel::Warn).directives(), "warn");
        assert_eq!(config(LogLevel::Info).directives(), "info");
        assert!(!config(LogLevel::Info).caps_webrtc());
    }

    #[test]
    fn verbose_levels_only_reach_the_engine() {
        let directives = config(LogLevel::Debug).directives();
        assert!(directives.starts_with("info,rtc_edge=debug,"));
        assert!(directives.contains("webrtc_ice=warn"));
        assert!(directives.contains("webrtc_sctp=warn"));
    }

    #[test]
    fn dependency_traces_follow_the_level() {
        let config = LogConfig {
            dependency_traces: true,
            ..config(LogLevel::Trace)
        };
        assert!(!config.caps_webrtc());
        let directives = config.directives();
        assert!(directives.starts_with("info,rtc_edge=trace,"));
        assert!(directives.contains("webrtc_dtls=trace"));
        assert!(!directives.contains("=warn"));
    }

    #[test]
    fn explicit_filter_wins() {
        let config = LogConfig {
            filter: Some("rtc_edge::signaling=trace".into()),
            ..config(LogLevel::Debug)
        };
        assert_eq!(config.directives(), "rtc_edge::signaling=trace");
        assert!(!config.caps_webrtc());
    }

    #[test]
    fn directives_parse_as_env_filter() {
        for level in [LogLevel::Error, LogLevel::Info, LogLevel::Trace] {
            assert!(EnvFilter::builder().parse(config(level).directives()).is_ok());
        }
    }

    #[test]
    fn frame_dump_pads_the_last_row() {
        let dump = FrameDump(b"{\"type\":3}\x00").to_string();
        let row = dump.trim_start_matches('\n');
        assert!(row.starts_with("000000  7b 22 74 79"));
        assert!(row.ends_with("|{\"type\":3}.|"));
        assert_eq!(dump.lines().count(), 2);

        let long = FrameDump(&[0u8; 20]).to_string();
        assert!(long.contains("\n000010  00 00 00 00"));
    }
}
