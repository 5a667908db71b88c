//! Proxy configuration.
//!
//! All options arrive as command-line flags and are frozen into an immutable
//! [`Config`] shared by the handler tasks. Lifetimes configured as `-1`
//! seconds mean "never expires" and surface here as `None`.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::upstream::{self, Endpoint};

pub type Shared = Arc<Config>;

/// Snapshot file for the pending-challenge cache.
pub const PENDING_CACHE_FILE: &str = "validation_cache.dat";

/// Snapshot file for the validated-client cache.
pub const VALIDATED_CACHE_FILE: &str = "validated_cache.dat";

#[derive(Debug, Clone)]
pub struct Config {
    /// Local address both listeners bind.
    pub listen: SocketAddr,
    /// Upstream servers, tried in this order.
    pub upstreams: Vec<Endpoint>,
    /// Verbosity 0-2.
    pub debug: u8,
    /// Whether resolved responses are cached at all.
    pub cache_enabled: bool,
    /// Fallback response-cache lifetime when the answer carries no usable
    /// TTL. `None` keeps such entries forever.
    pub cache_expire: Option<Duration>,
    /// Lifetime of a completed validation.
    pub revalidation: Option<Duration>,
    /// Challenge CNAME TTL, also the pending-challenge lifetime.
    pub challenge_ttl: Option<Duration>,
    /// Response-cache snapshot path.
    pub cache_file: PathBuf,
    /// Serve AAAA questions instead of dropping them.
    pub ipv6_enabled: bool,
    /// Per-upstream read/write timeout.
    pub timeout: Duration,
    /// Address answered for the root query in place of a challenge.
    pub sentinel: Ipv4Addr,
}

impl Config {
    /// The challenge TTL as a record TTL value. An unlimited lifetime maps
    /// onto the largest representable TTL.
    pub fn challenge_ttl_secs(&self) -> u32 {
        self.challenge_ttl
            .map_or(u32::MAX, |ttl| u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX))
    }

    /// Validate raw flag values into a `Config`, or fail startup.
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        listen: &str,
        upstreams: &str,
        debug: u8,
        cache_enabled: bool,
        expire_secs: i64,
        revalidation_secs: i64,
        ttl_secs: i64,
        cache_file: Option<PathBuf>,
        ipv6_enabled: bool,
        timeout_ms: u64,
        sentinel: Ipv4Addr,
    ) -> Result<Self, Error> {
        Ok(Self {
            listen: parse_listen_addr(listen)?,
            upstreams: upstream::parse_endpoints(upstreams)?,
            debug,
            cache_enabled,
            cache_expire: lifetime_secs(expire_secs),
            revalidation: lifetime_secs(revalidation_secs),
            challenge_ttl: lifetime_secs(ttl_secs),
            cache_file: cache_file.unwrap_or_else(default_cache_file),
            ipv6_enabled,
            timeout: Duration::from_millis(timeout_ms),
            sentinel,
        })
    }
}

/// Interpret a `-1 = forever` seconds value.
pub fn lifetime_secs(secs: i64) -> Option<Duration> {
    u64::try_from(secs).ok().map(Duration::from_secs)
}

/// Parse a listen address, accepting the bare `:port` shorthand for
/// all-interfaces binds.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, Error> {
    let candidate = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    candidate
        .parse()
        .map_err(|_| Error::InvalidListenAddr(addr.to_string()))
}

/// Default response-cache snapshot location: `resp_cache.dat` beside the
/// binary, falling back to the working directory.
pub fn default_cache_file() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .unwrap_or_default()
        .join("resp_cache.dat")
}
