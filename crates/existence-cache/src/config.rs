use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "existence".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Controls how long existence answers are kept.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum age of a cached answer.
    ///
    /// Answers at or above this age are treated as missing and trigger a new probe.
    ///
    /// Defaults to `5m`.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Maximum number of identifiers kept in memory.
    ///
    /// The limit is a best-effort approximation, and not an exact limit.
    ///
    /// Defaults to `100_000`.
    pub in_memory_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            in_memory_capacity: 100_000,
        }
    }
}

/// Controls how indeterminate probe results are retried.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// The delay between two probe attempts for the same identifier.
    ///
    /// Defaults to `1s`.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,

    /// The maximum number of probe attempts, including the first one.
    ///
    /// A value of `None` retries until the origin answers definitively or the probe is
    /// cancelled.
    ///
    /// Defaults to `30`.
    pub max_attempts: Option<NonZeroUsize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            max_attempts: NonZeroUsize::new(30),
        }
    }
}

/// Where and how the origin is probed.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct OriginConfig {
    /// Base URL of the icon origin.
    ///
    /// Existence checks go to `assets/icon/check` and display URLs point at `assets/icon`,
    /// both relative to this URL.
    pub url: Url,

    /// Asks the origin for the collection icon of an asset instead of its own.
    pub use_collection_icon: bool,

    /// The timeout for establishing a connection to the origin.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for a single `HEAD` probe.
    ///
    /// A probe running into this timeout counts as indeterminate and is retried.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            url: Url::parse("http://127.0.0.1:4242/").expect("default origin url is valid"),
            use_collection_icon: false,
            connect_timeout: Duration::from_secs(1),
            head_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// Fine-tune how long answers are cached.
    pub cache: CacheConfig,

    /// Fine-tune retries of indeterminate answers.
    pub retry: RetryConfig,

    /// The origin that is asked for existence.
    pub origin: OriginConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
