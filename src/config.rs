use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the frametrace consumer.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Present-tracking configuration.
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Frequency of the event timestamp counter, in ticks per second.
    /// Default: 10MHz.
    #[serde(default = "default_timestamp_frequency")]
    pub timestamp_frequency: u64,

    /// How often the consumer drains the output queues. Default: 100ms.
    #[serde(default = "default_drain_interval", with = "humantime_serde")]
    pub drain_interval: Duration,
}

/// Present-tracking configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Track presents all the way to the display. When disabled, presents
    /// complete at their runtime present stop. Default: true.
    #[serde(default = "default_true")]
    pub track_display: bool,

    /// Emit the debug columns (WasBatched, DwmNotified). Default: false.
    #[serde(default)]
    pub track_debug: bool,

    /// The recorded session delivered only the consumed event set; any
    /// unrecognized event is then counted as dropped instead of skipped.
    /// Default: false.
    #[serde(default)]
    pub filtered_events: bool,

    /// Capacity of the in-flight present ring; the oldest present is
    /// surfaced as lost when the ring wraps onto it. Default: 4096.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// How many further present stops from the same process resolve a
    /// deferred completion. Default: 3.
    #[serde(default = "default_deferral_presents")]
    pub deferral_presents: u32,

    /// Restrict tracking to these process ids. Empty means all processes.
    #[serde(default)]
    pub tracked_processes: Vec<u32>,
}

/// Output configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct OutputConfig {
    /// Write completed presents to this CSV file.
    #[serde(default)]
    pub csv_path: Option<PathBuf>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ring_capacity() -> usize {
    4096
}

fn default_deferral_presents() -> u32 {
    3
}

fn default_timestamp_frequency() -> u64 {
    10_000_000
}

fn default_drain_interval() -> Duration {
    Duration::from_millis(100)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            tracking: TrackingConfig::default(),
            output: OutputConfig::default(),
            timestamp_frequency: default_timestamp_frequency(),
            drain_interval: default_drain_interval(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            track_display: true,
            track_debug: false,
            filtered_events: false,
            ring_capacity: default_ring_capacity(),
            deferral_presents: default_deferral_presents(),
            tracked_processes: Vec::new(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.tracking.ring_capacity == 0 {
            bail!("tracking.ring_capacity must be positive");
        }

        if self.tracking.deferral_presents == 0 {
            bail!("tracking.deferral_presents must be positive");
        }

        if self.timestamp_frequency == 0 {
            bail!("timestamp_frequency must be positive");
        }

        if self.drain_interval.is_zero() {
            bail!("drain_interval must be positive");
        }

        Ok(())
    }
}
