//! Agent configuration: a TOML file mapped onto the programmatic settings of
//! the bundler, the tailers, and the sink.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use snafu::{ensure, ResultExt, Snafu};

use crate::bundler::BundlerSettings;
use crate::sinks::console::Encoding;
use crate::sources::file::FileTailerConfig;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("could not read config file {}: {}", path.display(), source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("could not parse config file {}: {}", path.display(), source))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("`timeout_secs` must be greater than zero"))]
    InvalidTimeout,
    #[snafu(display("`max_events` must be greater than zero"))]
    InvalidMaxEvents,
    #[snafu(display("`max_bytes` must be greater than zero"))]
    InvalidMaxBytes,
    #[snafu(display("`concurrency` must be greater than zero"))]
    InvalidConcurrency,
    #[snafu(display("no files to tail; provide `files` in the config or on the command line"))]
    NoFiles,
}

/// Top-level agent configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Files to tail.
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Whether to read files from the beginning instead of the end.
    #[serde(default)]
    pub read_from_start: bool,

    /// The delay between end-of-file checks, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// The maximum size of a line before it is discarded.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    #[serde(default)]
    pub bundle: BundleConfig,

    #[serde(default)]
    pub sink: SinkConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            read_from_start: false,
            poll_interval_ms: default_poll_interval_ms(),
            max_line_bytes: default_max_line_bytes(),
            bundle: BundleConfig::default(),
            sink: SinkConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Loads the configuration from a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        toml::from_str(&contents).context(ParseSnafu { path })
    }

    /// Tailer settings for one of the configured files.
    pub fn tailer_config(&self, path: PathBuf) -> FileTailerConfig {
        FileTailerConfig {
            read_from_start: self.read_from_start,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_line_bytes: self.max_line_bytes,
            ..FileTailerConfig::new(path)
        }
    }
}

/// Bundle thresholds and limits.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleConfig {
    /// Maximum age of the oldest buffered line before an automatic flush.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,

    /// Flush after this many lines.
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Flush after this many buffered bytes.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Hard cap on a single shipped bundle. Zero disables the cap.
    #[serde(default = "default_max_bundle_bytes")]
    pub max_bundle_bytes: usize,

    /// Global cap on bytes buffered across in-flight bundles.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,

    /// Maximum concurrent handler invocations.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_events: default_max_events(),
            max_bytes: default_max_bytes(),
            max_bundle_bytes: default_max_bundle_bytes(),
            max_buffer_bytes: default_max_buffer_bytes(),
            concurrency: default_concurrency(),
        }
    }
}

impl BundleConfig {
    /// Validates the section and converts it into bundler settings.
    pub fn to_settings(&self) -> Result<BundlerSettings, ConfigError> {
        ensure!(self.timeout_secs > 0.0, InvalidTimeoutSnafu);
        ensure!(self.max_events > 0, InvalidMaxEventsSnafu);
        ensure!(self.max_bytes > 0, InvalidMaxBytesSnafu);
        ensure!(self.concurrency > 0, InvalidConcurrencySnafu);
        Ok(BundlerSettings {
            time_threshold: Duration::from_secs_f64(self.timeout_secs),
            count_threshold: self.max_events,
            size_threshold: self.max_bytes,
            bundle_size_limit: self.max_bundle_bytes,
            buffer_size_limit: self.max_buffer_bytes,
            handler_limit: self.concurrency,
        })
    }
}

/// Sink options.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    #[serde(default)]
    pub encoding: Encoding,
}

const fn default_poll_interval_ms() -> u64 {
    250
}

const fn default_max_line_bytes() -> usize {
    102_400
}

const fn default_timeout_secs() -> f64 {
    1.0
}

const fn default_max_events() -> usize {
    10
}

const fn default_max_bytes() -> usize {
    1_000_000
}

const fn default_max_bundle_bytes() -> usize {
    10_000_000
}

const fn default_max_buffer_bytes() -> usize {
    1_000_000_000
}

const fn default_concurrency() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config: AgentConfig = toml::from_str("").unwrap();
        let settings = config.bundle.to_settings().unwrap();
        assert_eq!(settings.time_threshold, Duration::from_secs(1));
        assert_eq!(settings.count_threshold, 10);
        assert_eq!(settings.size_threshold, 1_000_000);
        assert_eq!(settings.bundle_size_limit, 10_000_000);
        assert_eq!(settings.buffer_size_limit, 1_000_000_000);
        assert_eq!(settings.handler_limit, 1);
    }

    #[test]
    fn full_config_parses() {
        let config: AgentConfig = toml::from_str(
            r#"
            files = ["/var/log/app.log", "/var/log/other.log"]
            read_from_start = true
            poll_interval_ms = 100
            max_line_bytes = 4096

            [bundle]
            timeout_secs = 0.5
            max_events = 100
            max_bytes = 65536
            concurrency = 4

            [sink]
            encoding = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.files.len(), 2);
        assert!(config.read_from_start);
        assert_eq!(config.sink.encoding, Encoding::Json);

        let settings = config.bundle.to_settings().unwrap();
        assert_eq!(settings.time_threshold, Duration::from_millis(500));
        assert_eq!(settings.count_threshold, 100);
        assert_eq!(settings.handler_limit, 4);

        let tailer = config.tailer_config(config.files[0].clone());
        assert!(tailer.read_from_start);
        assert_eq!(tailer.poll_interval, Duration::from_millis(100));
        assert_eq!(tailer.max_line_bytes, 4096);
    }

    #[test]
    fn zero_thresholds_are_rejected() {
        let config = BundleConfig {
            max_events: 0,
            ..BundleConfig::default()
        };
        assert!(matches!(
            config.to_settings(),
            Err(ConfigError::InvalidMaxEvents),
        ));

        let config = BundleConfig {
            timeout_secs: 0.0,
            ..BundleConfig::default()
        };
        assert!(matches!(
            config.to_settings(),
            Err(ConfigError::InvalidTimeout),
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<AgentConfig>("unknown = 1").is_err());
    }
}
