//! A cache answering "does this resource exist at the origin?".
//!
//! The entry point is [`ExistenceCache`](service::ExistenceCache), which layers a TTL bounded
//! [`EntryStore`](caching::EntryStore) and an [`InFlightRegistry`](caching::InFlightRegistry)
//! for request coalescing in front of a [`ProbeClient`](probe::ProbeClient).

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod display_url;
pub mod logging;
pub mod probe;
pub mod service;

pub use service::ExistenceCache;
