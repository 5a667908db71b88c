//! Error types.

use std::net::SocketAddr;
use trust_dns_proto::error::ProtoError;

/// Error enumerates the possible Palisade error states.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Returned when a follow-up query does not match the challenge that was
    /// issued to the client. The request is abandoned without a reply and the
    /// incident is logged.
    #[error("invalid request, questions don't match: got \"{got}\", expected \"{want}\"")]
    ChallengeMismatch { got: String, want: String },

    /// Returned when an entry in the upstream list cannot be parsed as
    /// `host:port[:proto]` with `proto` one of `udp` or `tcp`. Fails startup.
    #[error("wrong dns address \"{0}\"")]
    InvalidUpstream(String),

    /// Returned when the upstream list is empty after parsing. Fails startup.
    #[error("dns address must be not empty")]
    NoUpstreams,

    /// Returned when an upstream exchange exceeded the configured read/write
    /// timeout. The dispatcher advances to the next endpoint.
    #[error("upstream {0} timed out")]
    UpstreamTimeout(SocketAddr),

    /// Returned when the local listen address cannot be parsed.
    #[error("invalid listen address \"{0}\"")]
    InvalidListenAddr(String),

    /// Returned when a generic IO error occurs.
    #[error("an IO error occurred")]
    Io(#[from] std::io::Error),

    /// Returned when packing or unpacking a DNS message fails, either for a
    /// cached entry or an outgoing reply.
    #[error("DNS error")]
    Proto(#[from] ProtoError),

    /// Returned when a cache snapshot cannot be serialized or parsed.
    #[error("invalid JSON")]
    InvalidJson(#[from] serde_json::Error),
}
