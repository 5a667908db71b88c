//! The DNS-facing proxy.
//!
//! # Validation loop
//!
//! Palisade answers an unknown client's first query with a CNAME pointing
//! each queried name at `<ldns_key>.<name>`. A real recursive resolver
//! follows the redirection and comes back asking for the rewritten name;
//! that follow-up is matched against the stored challenge, the client is
//! marked validated, and the query is forwarded upstream under its original
//! name. Spoofed sources never complete the round-trip and never trigger
//! upstream traffic.
//!
//! ```text
//! client                        palisade                     upstream
//!   | A example.com               |                              |
//!   |----------------------------->                              |
//!   | CNAME example.com -> <key>.example.com                     |
//!   <-----------------------------|                              |
//!   | A <key>.example.com         |                              |
//!   |----------------------------->  A example.com               |
//!   |                              |----------------------------->
//!   |                              |  example.com A 93.184.216.34|
//!   | <key>.example.com A 93.184.216.34                          |
//!   <-----------------------------|                              |
//! ```
//!
//! Validated clients skip the loop for the configured revalidation period,
//! and cached responses are served without upstream traffic at all.

mod handler;
pub mod server;

pub use handler::Handler;
pub use server::new;
