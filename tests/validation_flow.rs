//! The validation loop, end to end at the library level: an unknown client
//! is challenged, follows the CNAME like a real recursive resolver, and the
//! pieces agree with each other across both requests.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use trust_dns_proto::op::{Message, Query};
use trust_dns_proto::rr::{Name, RData, Record, RecordType};

use palisade::cache::TtlCache;
use palisade::upstream::Transport;
use palisade::{challenge, fingerprint, rewrite};

const SENTINEL: Ipv4Addr = Ipv4Addr::new(10, 40, 221, 132);

fn query_for(id: u16, name: &str) -> Message {
    let mut msg = Message::new();
    msg.set_id(id).set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    msg
}

#[tokio::test]
async fn conforming_resolver_completes_the_challenge() {
    let client: SocketAddr = "192.0.2.7:5353".parse().unwrap();

    // First contact: the client is challenged instead of answered.
    let first = query_for(4242, "example.com.");
    let built = challenge::build(&first, client, Transport::Udp, 1800, SENTINEL).unwrap();

    assert_eq!(built.response.id(), 4242);
    assert!(!built.response.recursion_available());
    assert_eq!(built.response.answers().len(), 1);

    let pending = built.pending.expect("a CNAME challenge was issued");
    let pending_cache = TtlCache::new();
    let issue_key =
        fingerprint::validation_key(pending.queries(), client, Transport::Udp).unwrap();
    pending_cache
        .set(
            issue_key,
            pending.to_vec().unwrap(),
            Some(Duration::from_secs(1800)),
        )
        .await;

    // The resolver chases the CNAME: new ID, new source port, the rewritten
    // name as its question.
    let target = pending.queries()[0].name().to_string();
    let follow_client: SocketAddr = "192.0.2.7:6464".parse().unwrap();
    let follow = query_for(9001, &target);

    // Same key on both sides of the round-trip, so the pending entry is found.
    let follow_key =
        fingerprint::validation_key(follow.queries(), follow_client, Transport::Udp).unwrap();
    let stored = pending_cache
        .get(&follow_key)
        .await
        .expect("follow-up finds the pending challenge");
    let stored = Message::from_vec(&stored).unwrap();

    // The follow-up question matches the stored challenge question.
    assert_eq!(follow.queries().first(), stored.queries().first());

    // The upstream is asked for the real domain, not the challenge label.
    let upstream_questions = rewrite::domain_from_cname(follow.queries(), stored.answers());
    assert_eq!(upstream_questions.len(), 1);
    assert_eq!(
        upstream_questions[0].name(),
        &Name::from_str("example.com.").unwrap()
    );

    // The upstream's answer is relabeled so the client sees the name it
    // resolved.
    let mut answers = vec![Record::from_rdata(
        Name::from_str("example.com.").unwrap(),
        300,
        RData::A(Ipv4Addr::new(93, 184, 216, 34)),
    )];
    rewrite::cname_from_domain(&mut answers, stored.answers());
    assert_eq!(answers[0].name(), &Name::from_str(&target).unwrap());
    assert_eq!(answers[0].data(), Some(&RData::A(Ipv4Addr::new(93, 184, 216, 34))));
}

#[tokio::test]
async fn spoofed_client_never_finds_the_pending_entry() {
    let client: SocketAddr = "192.0.2.7:5353".parse().unwrap();
    let other: SocketAddr = "203.0.113.9:5353".parse().unwrap();

    let first = query_for(1, "example.com.");
    let built = challenge::build(&first, client, Transport::Udp, 1800, SENTINEL).unwrap();
    let pending = built.pending.unwrap();

    let pending_cache = TtlCache::new();
    let issue_key =
        fingerprint::validation_key(pending.queries(), client, Transport::Udp).unwrap();
    pending_cache
        .set(
            issue_key,
            pending.to_vec().unwrap(),
            Some(Duration::from_secs(1800)),
        )
        .await;

    // A different host replaying the follow-up keys differently and stays
    // unvalidated.
    let follow = query_for(2, &pending.queries()[0].name().to_string());
    let other_key =
        fingerprint::validation_key(follow.queries(), other, Transport::Udp).unwrap();
    assert_eq!(pending_cache.get(&other_key).await, None);
}

#[tokio::test]
async fn expired_challenge_is_gone() {
    let client: SocketAddr = "192.0.2.7:5353".parse().unwrap();

    let first = query_for(1, "example.com.");
    let built = challenge::build(&first, client, Transport::Udp, 1800, SENTINEL).unwrap();
    let pending = built.pending.unwrap();

    let pending_cache = TtlCache::new();
    let key = fingerprint::validation_key(pending.queries(), client, Transport::Udp).unwrap();
    pending_cache
        .set(key.clone(), pending.to_vec().unwrap(), Some(Duration::ZERO))
        .await;

    assert_eq!(pending_cache.get(&key).await, None);
}

#[test]
fn stored_bytes_differ_only_in_id_after_restamping() {
    // Response-cache entries are serialized with a zeroed ID and get the
    // client's ID stamped back on retrieval.
    let stored = query_for(0, "example.com.").to_vec().unwrap();

    let mut revived = Message::from_vec(&stored).unwrap();
    revived.set_id(4242);
    let bytes = revived.to_vec().unwrap();

    assert_eq!(u16::from_be_bytes([bytes[0], bytes[1]]), 4242);
    assert_eq!(&bytes[2..], &stored[2..]);
}

#[test]
fn root_query_short_circuits_with_the_sentinel() {
    let client: SocketAddr = "192.0.2.7:5353".parse().unwrap();

    let query = query_for(1, ".");
    let built = challenge::build(&query, client, Transport::Udp, 1800, SENTINEL).unwrap();

    assert!(built.pending.is_none());
    assert_eq!(
        built.response.answers()[0].data(),
        Some(&RData::A(SENTINEL))
    );
}
