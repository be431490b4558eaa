//! Log output for the library and the `undertow` binary
//!
//! The per-download event loops log every tick at `debug`, so they get a
//! level of their own next to the console level. The simulated engine is
//! capped at `warn` unless the console asks for `trace`. `RUST_LOG` still
//! overrides the console filter when set.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Buffer windows, readers and the per-download event loop.
pub const STREAMING_TARGET: &str = "undertow_core::streaming";
/// Add/remove, space checks and the library sweep.
pub const SESSION_TARGET: &str = "undertow_core::session";
const ENGINE_TARGET: &str = "undertow_core::engine";

#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("Cannot open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid log filter: {0}")]
    Filter(#[from] ParseError),

    #[error("Logging already initialized: {0}")]
    Install(#[from] TryInitError),
}

/// Which levels go where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub console: Level,
    /// Streaming level, defaults to `console`
    pub streaming: Option<Level>,
    /// Session level, defaults to `console`
    pub session: Option<Level>,
    /// Full trace of the last run, overwritten on every start
    pub file: Option<PathBuf>,
}

impl LogSettings {
    pub fn new(console: Level) -> Self {
        Self {
            console,
            streaming: None,
            session: None,
            file: None,
        }
    }

    pub fn with_streaming(mut self, level: Level) -> Self {
        self.streaming = Some(level);
        self
    }

    pub fn with_session(mut self, level: Level) -> Self {
        self.session = Some(level);
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// `EnvFilter` directives for the console layer.
    pub fn console_directives(&self) -> String {
        let mut directives = vec![level_name(self.console)];
        if let Some(level) = self.streaming {
            directives.push(format!("{STREAMING_TARGET}={}", level_name(level)));
        }
        if let Some(level) = self.session {
            directives.push(format!("{SESSION_TARGET}={}", level_name(level)));
        }
        let engine = if self.console == Level::TRACE {
            Level::TRACE
        } else {
            Level::WARN
        };
        directives.push(format!("{ENGINE_TARGET}={}", level_name(engine)));
        directives.join(",")
    }
}

fn level_name(level: Level) -> String {
    level.as_str().to_ascii_lowercase()
}

/// Installs the global subscriber.
///
/// # Errors
///
/// - `TracingSetupError::LogFile` - Log directory or file cannot be created
/// - `TracingSetupError::Filter` - `RUST_LOG` does not parse
/// - `TracingSetupError::Install` - A global subscriber is already set
pub fn init_tracing(settings: &LogSettings) -> Result<(), TracingSetupError> {
    let console_filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(directives)?,
        Err(_) => EnvFilter::try_new(settings.console_directives())?,
    };
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    let file_layer = match &settings.file {
        Some(path) => {
            let file = open_log_file(path)?;
            let layer = fmt::layer()
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(file)
                .with_filter(EnvFilter::try_new("trace")?);
            Some(layer)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Logging to console at {} ({})",
        level_name(settings.console),
        settings.console_directives()
    );
    if let Some(path) = &settings.file {
        tracing::info!("Full trace in {}", path.display());
    }
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File, TracingSetupError> {
    let to_error = |source| TracingSetupError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        create_dir_all(dir).map_err(to_error)?;
    }
    File::create(path).map_err(to_error)
}

/// Log levels accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl CliLogLevel {
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::*;

    #[test]
    fn test_default_directives_quiet_the_engine() {
        let settings = LogSettings::new(Level::INFO);
        assert_eq!(
            settings.console_directives(),
            "info,undertow_core::engine=warn"
        );
    }

    #[test]
    fn test_area_levels_become_directives() {
        let settings = LogSettings::new(Level::WARN)
            .with_streaming(Level::DEBUG)
            .with_session(Level::INFO);
        assert_eq!(
            settings.console_directives(),
            "warn,undertow_core::streaming=debug,undertow_core::session=info,undertow_core::engine=warn"
        );
        assert!(EnvFilter::try_new(settings.console_directives()).is_ok());
    }

    #[test]
    fn test_trace_console_includes_engine() {
        let settings = LogSettings::new(Level::TRACE);
        assert!(
            settings
                .console_directives()
                .ends_with("undertow_core::engine=trace")
        );
    }

    #[test]
    fn test_unwritable_log_file_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let settings = LogSettings::new(Level::INFO).with_file(blocker.join("run.log"));
        let result = init_tracing(&settings);
        assert!(matches!(result, Err(TracingSetupError::LogFile { .. })));
    }

    #[test]
    fn test_cli_levels_parse_case_insensitively() {
        let level = CliLogLevel::from_str("DEBUG", true).unwrap();
        assert_eq!(level.as_tracing_level(), Level::DEBUG);
        assert!(CliLogLevel::from_str("loud", true).is_err());
    }
}
