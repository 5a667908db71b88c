//! CNAME validation challenges.
//!
//! An unknown client is answered with a CNAME pointing each queried name at
//! `<ldns_key>.<name>`, where the LDNS key is unique to the client. Only a
//! conforming recursive resolver will chase the redirection and come back
//! asking for the rewritten name; a spoofed source or reflection target never
//! does. The root name cannot be prefixed, so a query for `.` is answered
//! with a fixed sentinel A record instead and short-circuits the loop.

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::str::FromStr;

use trust_dns_proto::op::{Message, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::{Name, RData, Record};

use crate::error::Error;
use crate::fingerprint;
use crate::upstream::Transport;

/// A challenge reply plus the entry destined for the pending cache.
pub struct Challenge {
    /// The response handed back to the client.
    pub response: Message,
    /// The expected follow-up, present iff at least one CNAME was issued.
    ///
    /// Its questions are the rewritten `<ldns_key>.<name>` forms and its
    /// answers the issued CNAME records, so a verifier can recover both the
    /// original names and the mapping.
    pub pending: Option<Message>,
}

/// Build the challenge for `query` from `client`.
///
/// The reply echoes the query's ID, questions and recursion-desired flag and
/// never offers recursion itself. Each non-root question gains a CNAME with
/// the given TTL; a root question gains an A record for `sentinel`.
pub fn build(
    query: &Message,
    client: SocketAddr,
    transport: Transport,
    ttl: u32,
    sentinel: Ipv4Addr,
) -> Result<Challenge, Error> {
    let key = fingerprint::ldns_key(client, transport);

    let mut answers = Vec::with_capacity(query.queries().len());
    let mut followups = Vec::new();

    for q in query.queries() {
        if q.name().is_root() {
            answers.push(Record::from_rdata(Name::root(), ttl, RData::A(sentinel)));
        } else {
            let target = Name::from_str(&format!("{}.{}", key, q.name()))?;
            answers.push(Record::from_rdata(
                q.name().clone(),
                ttl,
                RData::CNAME(target.clone()),
            ));
            let mut followup = q.clone();
            followup.set_name(target);
            followups.push(followup);
        }
    }

    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_response_code(ResponseCode::NoError)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(false);
    response.add_queries(query.queries().to_vec());
    for record in &answers {
        response.add_answer(record.clone());
    }

    let pending = if followups.is_empty() {
        None
    } else {
        let mut pending = Message::new();
        pending
            .set_id(0)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(query.recursion_desired());
        pending.add_queries(followups);
        for record in answers {
            pending.add_answer(record);
        }
        Some(pending)
    };

    Ok(Challenge { response, pending })
}
