//! Logging setup.
//!
//! Events go through `tracing`; this module installs the `tracing-subscriber`
//! stack once per process. `RUST_LOG` wins over the configured level when set.
//! Thread names are on by default because the two real-time threads are named
//! `acquisition` and `behavior`, and most rig problems are about which of the
//! two did what.
//!
//! ```no_run
//! use behavior_daq::{config::RigConfig, tracing_setup};
//!
//! # fn main() -> Result<(), behavior_daq::DaqError> {
//! let config = RigConfig::load_from("config/default.toml")?;
//! tracing_setup::init_from_config(&config)?;
//! tracing::info!("Rig ready");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::RigConfig;
use crate::error::{DaqError, DaqResult};

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line, coloured.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// One JSON object per event.
    Json,
}

impl FromStr for OutputFormat {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(DaqError::InvalidConfiguration(format!(
                "unknown log format '{s}' (expected pretty, compact or json)"
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Pretty => "pretty",
            OutputFormat::Compact => "compact",
            OutputFormat::Json => "json",
        })
    }
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Maximum level for this crate's events.
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
    /// Log span open/close, e.g. the `session` span.
    pub span_events: bool,
    /// Source file and line on every event.
    pub file_and_line: bool,
    /// Thread name on every event.
    pub thread_names: bool,
    /// Colours (pretty format only).
    pub ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl TracingConfig {
    /// Options for `level` with everything else at its default.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::default(),
            span_events: false,
            file_and_line: false,
            thread_names: true,
            ansi: true,
        }
    }

    /// Options for the level in `session.log_level`.
    pub fn from_rig_config(config: &RigConfig) -> DaqResult<Self> {
        Ok(Self::new(parse_level(&config.session.log_level)?))
    }

    /// Set the output format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Enable or disable colours.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("behavior_daq={}", self.level.as_str().to_ascii_lowercase()))
        })
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let spans = if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = tracing_subscriber::fmt::layer()
            .with_span_events(spans)
            .with_file(self.file_and_line)
            .with_line_number(self.file_and_line)
            .with_thread_names(self.thread_names);

        match self.format {
            OutputFormat::Pretty => base.pretty().with_ansi(self.ansi).with_filter(self.filter()).boxed(),
            OutputFormat::Compact => base.compact().with_ansi(false).with_filter(self.filter()).boxed(),
            OutputFormat::Json => base.json().with_filter(self.filter()).boxed(),
        }
    }
}

/// Install the subscriber for `config.session.log_level`.
pub fn init_from_config(config: &RigConfig) -> DaqResult<()> {
    init(TracingConfig::from_rig_config(config)?)
}

/// Install the subscriber.
///
/// Safe to call more than once: when a global subscriber is already set
/// (another test got there first) the call is a no-op.
pub fn init(config: TracingConfig) -> DaqResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    tracing_subscriber::registry()
        .with(config.layer())
        .try_init()
        .or_else(|e| {
            if tracing::dispatcher::has_been_set() {
                Ok(())
            } else {
                Err(DaqError::InvalidConfiguration(format!(
                    "failed to install tracing subscriber: {e}"
                )))
            }
        })
}

fn parse_level(level: &str) -> DaqResult<Level> {
    Level::from_str(level).map_err(|_| {
        DaqError::InvalidConfiguration(format!(
            "unknown log level '{level}' (expected trace, debug, info, warn or error)"
        ))
    })
}
