//! Query and client fingerprints.
//!
//! Three kinds of keys are derived from incoming traffic, all 32-character
//! lowercase MD5 hex digests:
//!
//! - the **request key** identifies a query independent of who sent it and
//!   keys the response cache;
//! - the **validation key** binds a client identity to a question set and
//!   keys the pending-challenge and validated-client caches;
//! - the **LDNS key** identifies a client alone and becomes the label that
//!   prefixes a challenge CNAME target.

use md5::{Digest, Md5};
use std::net::SocketAddr;
use trust_dns_proto::error::ProtoError;
use trust_dns_proto::op::{Message, Query};
use trust_dns_proto::rr::rdata::opt::EdnsCode;

use crate::upstream::Transport;

/// Fixed client cookie used by the (currently inert) EDNS COOKIE scaffolding.
pub const CLIENT_COOKIE: &str = "24";

/// Server secret mixed into generated server cookies.
pub const SERVER_SECRET: &str = "CDNW";

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Fingerprint a query independent of its ID and any EDNS COOKIE option.
///
/// Two queries that differ only in ID or COOKIE share a request key, so a
/// revalidating client still hits the response cache. The message itself is
/// left untouched; the normalization happens on an internal copy.
pub fn request_key(msg: &Message) -> Result<String, ProtoError> {
    let mut probe = msg.clone();
    probe.set_id(0);
    if let Some(edns) = probe.edns() {
        if edns.options().as_ref().contains_key(&EdnsCode::Cookie) {
            let mut stripped = edns.clone();
            stripped.options_mut().as_mut().remove(&EdnsCode::Cookie);
            probe.set_edns(stripped);
        }
    }
    Ok(md5_hex(&probe.to_vec()?))
}

/// Fingerprint a client + question set.
///
/// Only the question section contributes, combined with the client's host
/// (port stripped) and transport. Queries from the same host over the same
/// transport for the same questions collapse onto one key regardless of
/// source port or message ID.
pub fn validation_key(
    questions: &[Query],
    client: SocketAddr,
    transport: Transport,
) -> Result<String, ProtoError> {
    let mut probe = Message::new();
    probe.add_queries(questions.to_vec());
    let mut buf = probe.to_vec()?;
    buf.extend_from_slice(client.ip().to_string().as_bytes());
    buf.extend_from_slice(transport.as_str().as_bytes());
    Ok(md5_hex(&buf))
}

/// Fingerprint a client endpoint (full address, port included).
///
/// Used as the unique first label of a challenge CNAME target.
pub fn ldns_key(client: SocketAddr, transport: Transport) -> String {
    md5_hex(format!("{client}{transport}").as_bytes())
}

/// Compute a server cookie per draft-eastlake-dnsext-cookies-04 §4.2:
/// `FNV-64a(client cookie bytes || server secret || client IP)`, hex encoded.
///
/// Returns an empty string when the client cookie is not valid hex. Cookie
/// enforcement is not wired into request handling; this exists so that
/// enabling it later only touches the handler.
pub fn server_cookie(client_cookie_hex: &str, server_secret: &str, client_ip: &str) -> String {
    let Ok(cookie) = hex::decode(client_cookie_hex) else {
        return String::new();
    };
    let mut hash = fnv64a(0xcbf2_9ce4_8422_2325, &cookie);
    hash = fnv64a(hash, server_secret.as_bytes());
    hash = fnv64a(hash, client_ip.as_bytes());
    hex::encode(hash.to_be_bytes())
}

fn fnv64a(mut hash: u64, data: &[u8]) -> u64 {
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    for b in data {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
