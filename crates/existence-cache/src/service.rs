//! The public face of the existence cache.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

use crate::caching::{Admission, EntryStore, InFlightRegistry, ProbeTicket};
use crate::config::{Config, RetryConfig};
use crate::display_url::{DisplayUrl, IconUrlBuilder};
use crate::probe::{HttpProbeClient, ProbeClient, RetryController};

fn exists_tag(exists: bool) -> &'static str {
    if exists { "true" } else { "false" }
}

/// Answers whether resources exist at the origin, caching definitive answers for a TTL and
/// sharing running probes between concurrent callers.
///
/// Construct it once and share the returned [`Arc`].
pub struct ExistenceCache {
    store: EntryStore,
    inflight: InFlightRegistry,
    client: Arc<dyn ProbeClient>,
    urls: Box<dyn DisplayUrl>,
    retry: RetryConfig,
    marker: AtomicU64,
}

impl fmt::Debug for ExistenceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExistenceCache")
            .field("store", &self.store)
            .field("inflight", &self.inflight)
            .field("retry", &self.retry)
            .field("marker", &self.cache_marker())
            .finish()
    }
}

impl ExistenceCache {
    pub fn new(
        config: &Config,
        client: Arc<dyn ProbeClient>,
        urls: impl DisplayUrl + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: EntryStore::new(&config.cache),
            inflight: InFlightRegistry::new(),
            client,
            urls: Box::new(urls),
            retry: config.retry,
            marker: AtomicU64::new(0),
        })
    }

    /// Creates a cache probing the configured origin over HTTP.
    pub fn from_config(config: &Config) -> anyhow::Result<Arc<Self>> {
        let client = HttpProbeClient::new(&config.origin)?;
        let urls = IconUrlBuilder::new(&config.origin)?;
        Ok(Self::new(config, Arc::new(client), urls))
    }

    /// Checks whether `identifier` exists.
    ///
    /// A fresh cached answer is returned right away. Otherwise the caller joins the probe that
    /// is already running for `identifier`, or starts a new one.
    ///
    /// Never fails: transport errors, exhausted retries and cancellation all yield `false`.
    /// When `cancel` fires the call returns `false` right away, while the probe keeps running
    /// for any other waiters. A fresh cached answer is returned even if `cancel` has already
    /// fired.
    ///
    /// Must be called from within a tokio runtime, as new probes are spawned onto it.
    pub async fn check_exists(&self, identifier: &str, cancel: Option<&CancellationToken>) -> bool {
        metric!(counter("cache.access") += 1);

        if let Some(exists) = self.store.get(identifier) {
            metric!(counter("cache.hit") += 1, "exists" => exists_tag(exists));
            return exists;
        }

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return false;
        }

        let handle = match self
            .inflight
            .join_or_start(identifier, || self.store.get(identifier))
        {
            Admission::Cached(exists) => {
                metric!(counter("cache.hit") += 1, "exists" => exists_tag(exists));
                return exists;
            }
            Admission::Joined(handle) => {
                metric!(counter("cache.coalesced") += 1);
                handle
            }
            Admission::Started(ticket, handle) => {
                self.spawn_probe(ticket);
                metric!(gauge("cache.inflight") = self.inflight.len() as u64);
                handle
            }
        };

        handle.wait(cancel).await
    }

    /// Runs the probe for `ticket` in the background.
    ///
    /// The probe outlives the caller that started it. It only stops early once every waiter
    /// has gone away.
    fn spawn_probe(&self, ticket: ProbeTicket) {
        let store = self.store.clone();
        let inflight = self.inflight.clone();
        let client = Arc::clone(&self.client);
        let retry = self.retry;

        tokio::spawn(async move {
            let identifier = ticket.identifier();
            let outcome = RetryController::new(&*client, identifier, &retry, ticket.cancellation())
                .run()
                .await;

            metric!(counter("cache.outcome") += 1, "outcome" => outcome.as_tag());
            tracing::trace!(identifier, outcome = outcome.as_tag(), "Probe settled");

            // late joiners must find the answer in the store once the probe is gone
            if outcome.is_cacheable() {
                store.put(identifier, outcome.exists());
            }
            inflight.resolve(ticket, outcome.exists());
            metric!(gauge("cache.inflight") = inflight.len() as u64);
        });
    }

    /// Forgets every cached answer and moves display URLs to a new marker.
    ///
    /// Probes that are currently running are not affected.
    pub fn invalidate_all(&self) {
        self.store.clear();
        let marker = self.marker.fetch_add(1, Ordering::SeqCst) + 1;

        metric!(counter("cache.invalidate") += 1);
        tracing::debug!(marker, "Invalidated all existence answers");
    }

    /// Builds the display URL for `identifier` using the current cache marker.
    pub fn build_display_url(&self, identifier: &str) -> String {
        self.urls.display_url(identifier, self.cache_marker())
    }

    /// The current cache-busting marker. It only changes through
    /// [`invalidate_all`](Self::invalidate_all).
    pub fn cache_marker(&self) -> u64 {
        self.marker.load(Ordering::SeqCst)
    }

    /// Peeks at the cached answer for `identifier` without probing.
    pub fn cached(&self, identifier: &str) -> Option<bool> {
        self.store.get(identifier)
    }

    /// Number of probes currently running.
    pub fn running_probes(&self) -> usize {
        self.inflight.len()
    }
}
