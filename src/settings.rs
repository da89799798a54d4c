//! Environment-variable surface for progress backends.
//!
//! The engine itself renders nothing; it only parses the switches that
//! progress backends honor:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `TASKI_PROGRESS` | `0`/`false`/`off` disables progress display |
//! | `TASKI_PROGRESS_MODE` | `tree` (default), `simple`, or `log` |
//! | `TASKI_DEBUG` | truthy value raises log verbosity |

use std::env;
use std::str::FromStr;

/// How a progress backend should render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressMode {
    #[default]
    Tree,
    Simple,
    Log,
}

impl FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tree" => Ok(Self::Tree),
            "simple" => Ok(Self::Simple),
            "log" => Ok(Self::Log),
            other => Err(format!("unknown progress mode '{}'", other)),
        }
    }
}

/// Parsed progress switches, consumed by rendering backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSettings {
    /// Whether progress display is enabled at all.
    pub enabled: bool,
    /// Selected rendering mode.
    pub mode: ProgressMode,
    /// Whether debug verbosity was requested.
    pub debug: bool,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ProgressMode::default(),
            debug: false,
        }
    }
}

impl ProgressSettings {
    /// Read the `TASKI_*` switches from the process environment.
    ///
    /// Unknown values fall back to the defaults rather than failing; the
    /// engine must keep working under a misspelled variable.
    pub fn from_env() -> Self {
        let enabled = env::var("TASKI_PROGRESS")
            .map(|v| !is_falsy(&v))
            .unwrap_or(true);
        let mode = env::var("TASKI_PROGRESS_MODE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let debug = env::var("TASKI_DEBUG").map(|v| is_truthy(&v)).unwrap_or(false);
        Self {
            enabled,
            mode,
            debug,
        }
    }
}

/// Install a global tracing subscriber for embedders that do not bring
/// their own: `RUST_LOG` wins, otherwise `TASKI_DEBUG` selects the debug
/// level. Calling it when a subscriber is already set is a no-op.
pub fn init_logging() {
    let settings = ProgressSettings::from_env();
    let default_level = if settings.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn is_falsy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "off" | "no"
    )
}

fn is_truthy(value: &str) -> bool {
    !value.trim().is_empty() && !is_falsy(value)
}
