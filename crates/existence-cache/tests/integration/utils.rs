use std::sync::Arc;

use existence_cache::ExistenceCache;
use existence_cache::config::Config;

pub use existence_cache_test::{self as test, MockProbe};

/// Creates a cache on top of `probe` with the test configuration.
pub fn mock_cache(probe: &MockProbe) -> Arc<ExistenceCache> {
    mock_cache_with_config(probe, test::test_config())
}

pub fn mock_cache_with_config(probe: &MockProbe, config: Config) -> Arc<ExistenceCache> {
    ExistenceCache::new(&config, Arc::new(probe.clone()), test::display_urls())
}
