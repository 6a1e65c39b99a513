//! # Existence Caching
//!
//! Answering "does this resource exist?" involves a round-trip to the origin, which may in turn
//! have to look the resource up somewhere else first. This module holds the two pieces of state
//! that keep those round-trips to a minimum:
//!
//! - The [`EntryStore`] remembers *definitive* answers (found or not found) for a fixed TTL.
//!   Negative answers are cached exactly like positive ones. Answers derived from transport
//!   failures, exhausted retries or cancellation are never stored, so a local network hiccup
//!   can not poison later lookups.
//! - The [`InFlightRegistry`] does request coalescing. While a probe for an identifier is
//!   running, every other caller joins it and receives the same outcome.
//!
//! A lookup first consults the store. On a miss it joins the running probe, or starts a new one
//! if there is none. A started probe is driven by the
//! [`RetryController`](crate::probe::RetryController), which writes definitive answers to the
//! store before resolving all waiters.
//!
//! ## Cancellation
//!
//! Every waiter may bring its own cancellation token. A waiter whose token fires stops waiting
//! right away and observes `false`. The probe itself is only cancelled once *all* of its waiters
//! are gone, and a cancelled probe never writes to the store.
//!
//! ## Invalidation
//!
//! [`EntryStore::clear`] drops all answers at once. Running probes are not affected and will
//! store their answers in the emptied store when they finish.

mod inflight;
mod store;

pub use inflight::{Admission, InFlightRegistry, ProbeHandle, ProbeTicket};
pub use store::EntryStore;
