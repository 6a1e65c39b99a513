//! Exposes the command line application.
use std::num::NonZeroUsize;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use existence_cache::ExistenceCache;
use existence_cache::config::Config;
use existence_cache::{logging, metrics};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use url::Url;

/// Checks whether the given identifiers exist at the icon origin.
///
/// Prints one line per identifier: the identifier, `found` or `missing`, and the URL the
/// icon can be displayed from.
#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about)]
struct Cli {
    /// The identifiers to check.
    #[arg(required = true, value_name = "IDENTIFIER")]
    identifiers: Vec<String>,

    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The base URL of the origin, overriding the configuration file.
    #[arg(long)]
    origin: Option<Url>,

    /// The severity level of logging output, overriding the configuration file.
    ///
    /// Possible values:
    /// off, error, warn, info, debug, trace
    #[arg(long)]
    log_level: Option<LevelFilter>,

    /// Forget all cached answers before every repeated round.
    ///
    /// Combined with `--repeat`, every round asks the origin again. The first round always
    /// does, since the cache starts out empty.
    #[arg(long)]
    refresh: bool,

    /// How often to check the whole batch.
    ///
    /// Every round after the first one is answered from the cache, unless `--refresh` is set.
    #[arg(long, default_value = "1")]
    repeat: NonZeroUsize,
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = Config::get(self.config.as_deref()).context("failed loading config")?;
        if let Some(origin) = &self.origin {
            config.origin.url = origin.clone();
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        Ok(config)
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // SAFETY: no other threads exist before the runtime is built.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("existence-probe")
        .build()
        .context("failed to create the tokio runtime")?;

    runtime.block_on(run(cli, config))
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let cache = ExistenceCache::from_config(&config).context("failed to create the cache")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, cancelling running checks");
                cancel.cancel();
            }
        }
    });

    for round in 1..=cli.repeat.get() {
        tracing::debug!(round, "Checking {} identifiers", cli.identifiers.len());
        let answers = check_round(&cache, &cli.identifiers, round, cli.refresh, &cancel).await;
        print_answers(&cache, &cli.identifiers, answers);

        if cancel.is_cancelled() {
            anyhow::bail!("interrupted");
        }
    }

    Ok(())
}

/// Checks all identifiers concurrently, returning the answers in order.
///
/// With `refresh`, every round after the first one starts from an empty cache.
async fn check_round(
    cache: &ExistenceCache,
    identifiers: &[String],
    round: usize,
    refresh: bool,
    cancel: &CancellationToken,
) -> Vec<bool> {
    if refresh && round > 1 {
        cache.invalidate_all();
    }

    let checks = identifiers
        .iter()
        .map(|identifier| cache.check_exists(identifier, Some(cancel)));
    futures::future::join_all(checks).await
}

fn print_answers(cache: &ExistenceCache, identifiers: &[String], answers: Vec<bool>) {
    for (identifier, exists) in identifiers.iter().zip(answers) {
        let verdict = if exists { "found" } else { "missing" };
        println!(
            "{identifier}\t{verdict}\t{}",
            cache.build_display_url(identifier)
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use existence_cache_test::{self as test, MockProbe};

    use super::*;

    fn identifiers() -> Vec<String> {
        vec!["ETH".to_owned(), "UNKNOWN".to_owned()]
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_rounds_use_the_cache() {
        let mock = MockProbe::new();
        mock.respond("ETH", [200]);
        let cache = ExistenceCache::new(
            &test::test_config(),
            Arc::new(mock.clone()),
            test::display_urls(),
        );
        let cancel = CancellationToken::new();

        for round in 1..=3 {
            let answers = check_round(&cache, &identifiers(), round, false, &cancel).await;
            assert_eq!(answers, [true, false]);
        }

        assert_eq!(mock.calls("ETH"), 1);
        assert_eq!(mock.calls("UNKNOWN"), 1);
        assert_eq!(cache.cache_marker(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_checks_every_round() {
        let mock = MockProbe::new();
        mock.respond("ETH", [200]);
        let cache = ExistenceCache::new(
            &test::test_config(),
            Arc::new(mock.clone()),
            test::display_urls(),
        );
        let cancel = CancellationToken::new();

        for round in 1..=3 {
            let answers = check_round(&cache, &identifiers(), round, true, &cancel).await;
            assert_eq!(answers, [true, false]);
        }

        assert_eq!(mock.calls("ETH"), 3);
        assert_eq!(mock.calls("UNKNOWN"), 3);
        assert_eq!(cache.cache_marker(), 2);
    }

    #[test]
    fn test_parse_args() {
        let cli = Cli::try_parse_from([
            "existence-probe",
            "--origin",
            "http://localhost:4242/",
            "--log-level",
            "debug",
            "--repeat",
            "3",
            "ETH",
            "BTC",
        ])
        .unwrap();

        assert_eq!(cli.identifiers, ["ETH", "BTC"]);
        assert_eq!(cli.repeat.get(), 3);
        assert!(!cli.refresh);

        let config = cli.load_config().unwrap();
        assert_eq!(config.origin.url.as_str(), "http://localhost:4242/");
        assert_eq!(config.logging.level, LevelFilter::DEBUG);
    }

    #[test]
    fn test_requires_identifiers() {
        assert!(Cli::try_parse_from(["existence-probe"]).is_err());
        assert!(Cli::try_parse_from(["existence-probe", "--repeat", "0", "ETH"]).is_err());
    }
}
