//! Proxy statistics.
//!
//! Ten monotonic counters incremented from the request state machine and the
//! upstream dispatcher. They are only read at shutdown for the summary table;
//! there is no reset.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for the lifetime of the proxy process.
#[derive(Debug, Default)]
pub struct Stats {
    /// Requests received, including ones dropped by filtering.
    pub total_requests: AtomicU64,
    /// Responses served straight from the response cache.
    pub cache_hits: AtomicU64,
    /// Follow-up queries that completed a pending challenge.
    pub validation_requests: AtomicU64,
    /// Follow-up queries that did not match their pending challenge.
    pub validation_errors: AtomicU64,
    /// Individual upstream exchange attempts.
    pub dns_queries: AtomicU64,
    /// Upstream attempts that produced no usable answer.
    pub dns_failures: AtomicU64,
    /// Upstream replies with rcode NoError.
    pub resolved: AtomicU64,
    /// Upstream replies with rcode NXDomain.
    pub nxdomain: AtomicU64,
    /// Upstream replies with rcode Refused.
    pub refused: AtomicU64,
    /// Upstream replies with any rcode other than NoError.
    pub total_errors: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_total_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_validation_requests(&self) {
        self.validation_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_validation_errors(&self) {
        self.validation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dns_queries(&self) {
        self.dns_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dns_failures(&self) {
        self.dns_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_nxdomain(&self) {
        self.nxdomain.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_total_errors(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Render the shutdown summary table.
    pub fn summary(&self) -> String {
        let rows = [
            ("Total Req", &self.total_requests),
            ("Cache Hit", &self.cache_hits),
            ("Validation Req", &self.validation_requests),
            ("Validation Err", &self.validation_errors),
            ("Dns Query", &self.dns_queries),
            ("Dns Failure", &self.dns_failures),
            ("Resolved", &self.resolved),
            ("NXDomain", &self.nxdomain),
            ("Refused", &self.refused),
            ("Total Failure", &self.total_errors),
        ];

        let mut out = String::from("\nPALISADE STAT:\n");
        out.push_str(&format!("{:>25} |{:>10}\n", "COUNTER", "VALUE"));
        out.push_str("-------------------------------------------\n");
        for (label, counter) in rows {
            out.push_str(&format!(
                "{:>25} |{:>10}\n",
                label,
                counter.load(Ordering::Relaxed)
            ));
        }
        out
    }
}
