use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A probe that is currently running for one identifier.
struct InFlightProbe {
    /// Distinguishes this probe from earlier and later probes for the same identifier.
    generation: u64,
    /// Number of handles still waiting for the outcome, including the starter's.
    waiters: usize,
    /// Fired once every waiter has gone away.
    cancel: CancellationToken,
    outcome: watch::Sender<Option<bool>>,
}

#[derive(Default)]
struct Inner {
    probes: Mutex<HashMap<String, InFlightProbe>>,
    next_generation: AtomicU64,
}

/// Tracks running probes so that concurrent callers share a single outcome.
///
/// There is at most one probe per identifier. The record is removed in the same critical
/// section that publishes its outcome, so nobody can join a probe that has already settled.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for InFlightRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("running probes", &self.len())
            .finish()
    }
}

/// The result of [`InFlightRegistry::join_or_start`].
#[derive(Debug)]
pub enum Admission {
    /// Nothing was running, but an answer was available after all.
    Cached(bool),
    /// The caller joined a running probe.
    Joined(ProbeHandle),
    /// The caller started a new probe and is responsible for resolving the ticket.
    Started(ProbeTicket, ProbeHandle),
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn probes(&self) -> MutexGuard<'_, HashMap<String, InFlightProbe>> {
        self.inner
            .probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Joins the probe running for `identifier`, if there is one.
    pub fn join(&self, identifier: &str) -> Option<ProbeHandle> {
        let mut probes = self.probes();
        self.join_locked(&mut probes, identifier)
    }

    /// Registers a new probe for `identifier`.
    ///
    /// Callers must try [`join`](Self::join) first. Use [`join_or_start`](Self::join_or_start)
    /// to do both atomically.
    pub fn start(&self, identifier: &str) -> (ProbeTicket, ProbeHandle) {
        let mut probes = self.probes();
        debug_assert!(
            !probes.contains_key(identifier),
            "started a second probe for {identifier}"
        );
        self.start_locked(&mut probes, identifier)
    }

    /// Joins a running probe, or starts a new one.
    ///
    /// `cached` is consulted under the registry lock right before starting. A probe that settled
    /// after the caller missed the cache has already written its answer by then, which avoids
    /// probing the same identifier twice in a row.
    pub fn join_or_start<F>(&self, identifier: &str, cached: F) -> Admission
    where
        F: FnOnce() -> Option<bool>,
    {
        let mut probes = self.probes();
        if let Some(handle) = self.join_locked(&mut probes, identifier) {
            return Admission::Joined(handle);
        }
        if let Some(exists) = cached() {
            return Admission::Cached(exists);
        }
        let (ticket, handle) = self.start_locked(&mut probes, identifier);
        Admission::Started(ticket, handle)
    }

    /// Delivers `exists` to every waiter of the ticket's probe and forgets the probe.
    ///
    /// This is a no-op if every waiter already left, in which case the probe was
    /// cancelled and removed earlier.
    pub fn resolve(&self, mut ticket: ProbeTicket, exists: bool) {
        debug_assert!(Arc::ptr_eq(&self.inner, &ticket.registry.inner));
        ticket.settled = true;
        self.settle(&ticket.identifier, ticket.generation, Some(exists));
    }

    /// Number of running probes.
    pub fn len(&self) -> usize {
        self.probes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn join_locked(
        &self,
        probes: &mut HashMap<String, InFlightProbe>,
        identifier: &str,
    ) -> Option<ProbeHandle> {
        let probe = probes.get_mut(identifier)?;
        probe.waiters += 1;

        Some(ProbeHandle {
            registry: self.clone(),
            identifier: identifier.to_owned(),
            generation: probe.generation,
            outcome: probe.outcome.subscribe(),
        })
    }

    fn start_locked(
        &self,
        probes: &mut HashMap<String, InFlightProbe>,
        identifier: &str,
    ) -> (ProbeTicket, ProbeHandle) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        let cancel = CancellationToken::new();

        probes.insert(
            identifier.to_owned(),
            InFlightProbe {
                generation,
                waiters: 1,
                cancel: cancel.clone(),
                outcome: sender,
            },
        );

        let ticket = ProbeTicket {
            registry: self.clone(),
            identifier: identifier.to_owned(),
            generation,
            cancel,
            settled: false,
        };
        let handle = ProbeHandle {
            registry: self.clone(),
            identifier: identifier.to_owned(),
            generation,
            outcome: receiver,
        };
        (ticket, handle)
    }

    /// Removes the probe, publishing `exists` if there is one.
    ///
    /// Without an outcome the sender is just dropped, which waiters observe as `false`.
    fn settle(&self, identifier: &str, generation: u64, exists: Option<bool>) {
        let mut probes = self.probes();
        if !probes
            .get(identifier)
            .is_some_and(|probe| probe.generation == generation)
        {
            return;
        }
        if let (Some(probe), Some(exists)) = (probes.remove(identifier), exists) {
            probe.outcome.send_replace(Some(exists));
        }
    }

    /// Removes one waiter, cancelling and forgetting the probe once nobody is left.
    fn leave(&self, identifier: &str, generation: u64) {
        let mut probes = self.probes();
        let Some(probe) = probes.get_mut(identifier) else {
            return;
        };
        if probe.generation != generation {
            return;
        }

        probe.waiters = probe.waiters.saturating_sub(1);
        if probe.waiters == 0
            && let Some(probe) = probes.remove(identifier)
        {
            tracing::trace!(identifier, "all waiters left, cancelling probe");
            probe.cancel.cancel();
        }
    }
}

/// The obligation to settle a started probe.
///
/// Pass it to [`InFlightRegistry::resolve`] once the probe has an outcome. Dropping an
/// unresolved ticket removes the probe and resolves every waiter to `false`.
pub struct ProbeTicket {
    registry: InFlightRegistry,
    identifier: String,
    generation: u64,
    cancel: CancellationToken,
    settled: bool,
}

impl ProbeTicket {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Fires once every waiter of this probe has cancelled or gone away.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for ProbeTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeTicket")
            .field("identifier", &self.identifier)
            .field("generation", &self.generation)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Drop for ProbeTicket {
    fn drop(&mut self) {
        if !self.settled {
            self.registry
                .settle(&self.identifier, self.generation, None);
        }
    }
}

/// A waiter's view on a running probe.
///
/// Dropping the handle without waiting for the outcome counts as leaving the probe.
pub struct ProbeHandle {
    registry: InFlightRegistry,
    identifier: String,
    generation: u64,
    outcome: watch::Receiver<Option<bool>>,
}

impl std::fmt::Debug for ProbeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeHandle")
            .field("identifier", &self.identifier)
            .field("generation", &self.generation)
            .finish()
    }
}

impl ProbeHandle {
    /// Waits for the shared outcome.
    ///
    /// Resolves to `false` as soon as `cancel` fires, and when the probe went away without an
    /// outcome. The probe itself keeps running as long as other waiters remain.
    pub async fn wait(mut self, cancel: Option<&CancellationToken>) -> bool {
        let outcome = &mut self.outcome;
        let settled = async {
            match outcome.wait_for(Option::is_some).await {
                Ok(outcome) => (*outcome).unwrap_or(false),
                Err(_) => false,
            }
        };

        match cancel {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::trace!(identifier = %self.identifier, "stopped waiting for probe");
                    false
                }
                exists = settled => exists,
            },
            None => settled.await,
        }
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        self.registry.leave(&self.identifier, self.generation);
    }
}
