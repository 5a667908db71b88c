//! Name rewriting between challenge labels and real domains.
//!
//! During challenge verification the follow-up question asks for
//! `<ldns_key>.<domain>`; the upstream must be asked for `<domain>`, and the
//! client must be answered under the label it was told to resolve. The two
//! routines here translate in each direction using the CNAME records stored
//! with the pending challenge. Both preserve order and take the first
//! matching stored record per item.

use trust_dns_proto::op::Query;
use trust_dns_proto::rr::{RData, Record};

/// Rewrite follow-up questions back to the domains they stand for.
///
/// For each question, the first stored answer whose presentation text
/// contains the question name supplies the replacement: the answer's owner
/// name, i.e. the originally queried domain. Questions without a match are
/// dropped.
pub fn domain_from_cname(questions: &[Query], cname_answers: &[Record]) -> Vec<Query> {
    let mut rewritten = Vec::with_capacity(questions.len());
    for q in questions {
        let qname = q.name().to_string();
        for answer in cname_answers {
            if answer.to_string().contains(&qname) {
                let mut mapped = q.clone();
                mapped.set_name(answer.name().clone());
                rewritten.push(mapped);
                break;
            }
        }
    }
    rewritten
}

/// Rename upstream answers to the challenge labels the client asked for.
///
/// Each answer whose owner name matches a stored CNAME's owner name takes
/// that CNAME's target as its new owner name. Stored records that are not
/// CNAMEs (the sentinel A record) never rename anything.
pub fn cname_from_domain(answers: &mut [Record], cname_answers: &[Record]) {
    for answer in answers {
        for cname in cname_answers {
            if answer.name() == cname.name() {
                if let Some(RData::CNAME(target)) = cname.data() {
                    answer.set_name(target.clone());
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use trust_dns_proto::rr::{Name, RecordType};

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn cname(owner: &str, target: &str) -> Record {
        Record::from_rdata(name(owner), 1800, RData::CNAME(name(target)))
    }

    fn a_record(owner: &str, addr: [u8; 4]) -> Record {
        Record::from_rdata(name(owner), 300, RData::A(Ipv4Addr::from(addr)))
    }

    #[test]
    fn follow_up_question_maps_back_to_domain() {
        let questions = vec![Query::query(name("abc123.example.com."), RecordType::A)];
        let stored = vec![cname("example.com.", "abc123.example.com.")];

        let rewritten = domain_from_cname(&questions, &stored);

        assert_eq!(rewritten.len(), 1);
        assert_eq!(rewritten[0].name(), &name("example.com."));
        assert_eq!(rewritten[0].query_type(), RecordType::A);
    }

    #[test]
    fn unmatched_questions_are_dropped() {
        let questions = vec![Query::query(name("unrelated.org."), RecordType::A)];
        let stored = vec![cname("example.com.", "abc123.example.com.")];

        assert!(domain_from_cname(&questions, &stored).is_empty());
    }

    #[test]
    fn first_matching_answer_wins_and_order_is_kept() {
        let questions = vec![
            Query::query(name("abc.one.test."), RecordType::A),
            Query::query(name("abc.two.test."), RecordType::A),
        ];
        let stored = vec![
            cname("one.test.", "abc.one.test."),
            cname("two.test.", "abc.two.test."),
        ];

        let rewritten = domain_from_cname(&questions, &stored);

        assert_eq!(rewritten.len(), 2);
        assert_eq!(rewritten[0].name(), &name("one.test."));
        assert_eq!(rewritten[1].name(), &name("two.test."));
    }

    #[test]
    fn answers_are_renamed_to_challenge_labels() {
        let mut answers = vec![a_record("example.com.", [93, 184, 216, 34])];
        let stored = vec![cname("example.com.", "abc123.example.com.")];

        cname_from_domain(&mut answers, &stored);

        assert_eq!(answers[0].name(), &name("abc123.example.com."));
        assert_eq!(answers[0].ttl(), 300);
    }

    #[test]
    fn answers_without_a_stored_cname_keep_their_name() {
        let mut answers = vec![a_record("other.org.", [192, 0, 2, 1])];
        let stored = vec![cname("example.com.", "abc123.example.com.")];

        cname_from_domain(&mut answers, &stored);

        assert_eq!(answers[0].name(), &name("other.org."));
    }

    #[test]
    fn sentinel_records_never_rename() {
        let mut answers = vec![a_record("example.com.", [192, 0, 2, 1])];
        let stored = vec![a_record("example.com.", [10, 40, 221, 132])];

        cname_from_domain(&mut answers, &stored);

        assert_eq!(answers[0].name(), &name("example.com."));
    }

    #[test]
    fn round_trip_restores_challenge_labels() {
        // What the challenge stored.
        let stored = vec![cname("example.com.", "abc123.example.com.")];

        // The client follows the CNAME and asks for the rewritten name.
        let follow_up = vec![Query::query(name("abc123.example.com."), RecordType::A)];
        let upstream_questions = domain_from_cname(&follow_up, &stored);
        assert_eq!(upstream_questions[0].name(), &name("example.com."));

        // The upstream answers under the real domain.
        let mut upstream_answers = vec![a_record("example.com.", [93, 184, 216, 34])];
        cname_from_domain(&mut upstream_answers, &stored);

        // The client sees the label it resolved.
        assert_eq!(upstream_answers[0].name(), &name("abc123.example.com."));
    }
}
