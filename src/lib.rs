//! Palisade
//!
//! A caching DNS proxy that sits between stub resolvers and recursive
//! upstream servers and vets unknown clients before resolving for them.
//!
//! Before an unknown client gets an answer it must complete a CNAME
//! redirection round-trip: the proxy replies with a CNAME pointing the
//! queried name at a per-client label, and only a conforming recursive
//! resolver follows the redirection back. Spoofed sources and reflection
//! targets never do, so they never generate upstream traffic. See
//! [`proxy`] for the full loop.
//!
//! Validated clients are remembered for a revalidation period and their
//! queries are served from a response cache or forwarded to an ordered list
//! of upstream servers over UDP or TCP. All three stores (responses, pending
//! challenges, validated clients) persist across restarts via periodic JSON
//! snapshots.
//!
#![warn(clippy::pedantic)]

pub mod cache;
pub mod challenge;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod proxy;
pub mod rewrite;
pub mod stats;
pub mod upstream;

pub use cache::{Caches, TtlCache};
pub use config::{Config, Shared};
pub use error::Error;
pub use proxy::new as new_dns;
pub use stats::Stats;
