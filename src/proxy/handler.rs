use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error};
use trust_dns_proto::op::{Header, Message, MessageType, Query, ResponseCode};
use trust_dns_proto::rr::{Record, RecordType};
use trust_dns_server::authority::MessageResponseBuilder;
use trust_dns_server::server::{
    Protocol, Request, RequestHandler, ResponseHandler, ResponseInfo,
};

use crate::cache::Caches;
use crate::challenge;
use crate::config::Shared;
use crate::error::Error;
use crate::fingerprint;
use crate::rewrite;
use crate::stats::Stats;
use crate::upstream::{Dispatcher, Transport};

/// Serves every query through the request state machine.
pub struct Handler {
    config: Shared,
    caches: Caches,
    dispatcher: Dispatcher,
    stats: Arc<Stats>,
}

/// The phases a request moves through. Transitions only go forward; a
/// request that cannot advance ends where it stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Apply static rules; drop responses and empty question lists.
    Filter,
    /// Derive the request and validation keys.
    Parse,
    /// Serve from the response cache when possible.
    RespCache,
    /// Verify a follow-up against its pending challenge.
    Validate,
    /// Pass validated clients through, challenge everyone else.
    Validity,
    /// Ask the upstreams.
    Perform,
    /// Store the upstream answer in the response cache.
    AddCache,
    /// A reply is ready for the client.
    Send,
    /// Nothing further happens for this request.
    End,
}

impl Handler {
    pub(super) fn new(
        config: Shared,
        caches: Caches,
        dispatcher: Dispatcher,
        stats: Arc<Stats>,
    ) -> Self {
        Handler {
            config,
            caches,
            dispatcher,
            stats,
        }
    }

    async fn dispatch_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        let mut task = Task::new(self, request);
        match task.run().await {
            Ok(Phase::Send) => {
                if let Some(msg) = task.response.take() {
                    match task.send(&msg, response_handle).await {
                        Ok(info) => return info,
                        Err(err) => {
                            error!(id = task.id, query = ?task.query_desc, "request failed: {err}");
                        }
                    }
                }
            }
            Ok(_) => {
                debug!(id = task.id, "request dropped");
            }
            Err(err) => {
                error!(id = task.id, query = ?task.query_desc, "request failed: {err}");
            }
        }
        dropped_response_info()
    }
}

/// Bookkeeping for a dropped or failed request; nothing is written back.
fn dropped_response_info() -> ResponseInfo {
    Header::new().into()
}

fn transport_of(request: &Request) -> Transport {
    if matches!(request.protocol(), Protocol::Udp) {
        Transport::Udp
    } else {
        Transport::Tcp
    }
}

/// Drop AAAA questions unless IPv6 service is enabled.
fn filter_questions(questions: Vec<Query>, ipv6_enabled: bool) -> Vec<Query> {
    questions
        .into_iter()
        .filter(|q| q.query_type() != RecordType::AAAA || ipv6_enabled)
        .collect()
}

fn describe(q: &Query) -> String {
    format!("({} {} {})", q.name(), q.query_class(), q.query_type())
}

/// The working query with a different question list; header bits and EDNS
/// carry over.
fn with_queries(msg: &Message, questions: Vec<Query>) -> Message {
    let mut rebuilt = Message::new();
    rebuilt
        .set_id(msg.id())
        .set_message_type(msg.message_type())
        .set_op_code(msg.op_code())
        .set_recursion_desired(msg.recursion_desired());
    rebuilt.add_queries(questions);
    if let Some(edns) = msg.edns() {
        rebuilt.set_edns(edns.clone());
    }
    rebuilt
}

/// One request moving through the state machine. All mutable state is owned
/// here; the handler only contributes shared, internally synchronized parts.
struct Task<'a> {
    handler: &'a Handler,
    request: &'a Request,
    client: SocketAddr,
    transport: Transport,
    id: u16,
    query_desc: Vec<String>,
    /// The working query: filtered questions, later rewritten for upstream.
    msg: Message,
    req_key: String,
    val_key: String,
    /// CNAME records from the pending challenge, used to relabel answers.
    challenge_answers: Vec<Record>,
    /// Untranslated upstream answers destined for the response cache.
    backup_answers: Vec<Record>,
    response: Option<Message>,
}

impl<'a> Task<'a> {
    fn new(handler: &'a Handler, request: &'a Request) -> Self {
        Task {
            handler,
            request,
            client: request.src(),
            transport: transport_of(request),
            id: request.id(),
            query_desc: Vec::new(),
            msg: Message::new(),
            req_key: String::new(),
            val_key: String::new(),
            challenge_answers: Vec::new(),
            backup_answers: Vec::new(),
            response: None,
        }
    }

    /// Drive the request forward until it either has a reply (`Send`) or is
    /// finished without one (`End`).
    async fn run(&mut self) -> Result<Phase, Error> {
        let mut phase = Phase::Filter;
        loop {
            phase = match phase {
                Phase::Filter => self.filter()?,
                Phase::Parse => self.parse()?,
                Phase::RespCache => self.check_response_cache().await?,
                Phase::Validate => self.validate().await?,
                Phase::Validity => self.check_validity().await?,
                Phase::Perform => self.perform().await?,
                Phase::AddCache => self.add_to_cache().await?,
                done @ (Phase::Send | Phase::End) => return Ok(done),
            };
        }
    }

    fn filter(&mut self) -> Result<Phase, Error> {
        // A message claiming to be a response has no business here.
        if self.request.message_type() == MessageType::Response {
            return Ok(Phase::End);
        }

        self.query_desc = std::iter::once(self.request.query())
            .map(|q| describe(q.original()))
            .collect();

        let questions: Vec<Query> = std::iter::once(self.request.query())
            .map(|q| q.original().clone())
            .collect();
        let questions = filter_questions(questions, self.handler.config.ipv6_enabled);
        if questions.is_empty() {
            return Ok(Phase::End);
        }

        let mut msg = Message::new();
        msg.set_id(self.id)
            .set_message_type(MessageType::Query)
            .set_op_code(self.request.op_code())
            .set_recursion_desired(self.request.header().recursion_desired());
        msg.add_queries(questions);
        if let Some(edns) = self.request.edns() {
            msg.set_edns(edns.clone());
        }
        self.msg = msg;
        Ok(Phase::Parse)
    }

    fn parse(&mut self) -> Result<Phase, Error> {
        self.val_key =
            fingerprint::validation_key(self.msg.queries(), self.client, self.transport)?;
        self.req_key = fingerprint::request_key(&self.msg)?;
        Ok(Phase::RespCache)
    }

    async fn check_response_cache(&mut self) -> Result<Phase, Error> {
        if self.handler.config.cache_enabled {
            if let Some(bytes) = self.handler.caches.responses.get(&self.req_key).await {
                let mut cached = Message::from_vec(&bytes)?;
                cached.set_id(self.id);
                self.handler.stats.inc_cache_hits();
                debug!(id = self.id, "serving from response cache");
                self.response = Some(cached);
                return Ok(Phase::Send);
            }
        }
        Ok(Phase::Validate)
    }

    async fn validate(&mut self) -> Result<Phase, Error> {
        let Some(bytes) = self.handler.caches.pending.get(&self.val_key).await else {
            return Ok(Phase::Validity);
        };

        let pending = Message::from_vec(&bytes)?;
        let ours = self.msg.queries().first();
        let theirs = pending.queries().first();
        if ours != theirs {
            self.handler.stats.inc_validation_errors();
            return Err(Error::ChallengeMismatch {
                got: ours.map(describe).unwrap_or_default(),
                want: theirs.map(describe).unwrap_or_default(),
            });
        }

        // The client proved it can follow the redirection. Swap the real
        // domains back in for the upstream and mark the rewritten form as
        // validated.
        self.challenge_answers = pending.answers().to_vec();
        let rewritten = rewrite::domain_from_cname(self.msg.queries(), pending.answers());
        self.msg = with_queries(&self.msg, rewritten);

        let validated_key =
            fingerprint::validation_key(self.msg.queries(), self.client, self.transport)?;
        self.handler
            .caches
            .validated
            .set(validated_key, bytes, self.handler.config.revalidation)
            .await;
        self.handler.stats.inc_validation_requests();
        debug!(id = self.id, client = %self.client, "challenge completed");
        Ok(Phase::Perform)
    }

    async fn check_validity(&mut self) -> Result<Phase, Error> {
        if self
            .handler
            .caches
            .validated
            .get(&self.val_key)
            .await
            .is_some()
        {
            debug!(id = self.id, client = %self.client, "client already validated");
            return Ok(Phase::Perform);
        }

        let config = &self.handler.config;
        let built = challenge::build(
            &self.msg,
            self.client,
            self.transport,
            config.challenge_ttl_secs(),
            config.sentinel,
        )?;

        if let Some(pending) = built.pending {
            let key =
                fingerprint::validation_key(pending.queries(), self.client, self.transport)?;
            let bytes = pending.to_vec()?;
            // Stored before the reply goes out so the follow-up cannot race
            // the cache insert.
            self.handler
                .caches
                .pending
                .set(key, bytes, config.challenge_ttl)
                .await;
            debug!(id = self.id, client = %self.client, "challenge issued");
        }

        self.response = Some(built.response);
        Ok(Phase::Send)
    }

    async fn perform(&mut self) -> Result<Phase, Error> {
        self.msg.set_recursion_desired(true);
        // The question list may have been rewritten since PARSE.
        self.req_key = fingerprint::request_key(&self.msg)?;

        let mut reply = self.handler.dispatcher.exchange(&self.msg).await?;

        let stats = &self.handler.stats;
        match reply.response_code() {
            ResponseCode::Refused => {
                stats.inc_refused();
                stats.inc_total_errors();
            }
            ResponseCode::NXDomain => {
                stats.inc_nxdomain();
                stats.inc_total_errors();
            }
            ResponseCode::NoError => stats.inc_resolved(),
            _ => stats.inc_total_errors(),
        }

        reply.set_recursion_available(false);

        // The reply's question section stays the upstream's echo of the real
        // domain; the client-facing reply echoes the client's own questions
        // at send time. The answers are relabeled to the names the client
        // asked under, and the untouched answers are kept for the cache.
        let mut answers = reply.take_answers();
        self.backup_answers = answers.clone();
        rewrite::cname_from_domain(&mut answers, &self.challenge_answers);
        for record in answers {
            reply.add_answer(record);
        }

        self.response = Some(reply);
        Ok(Phase::AddCache)
    }

    async fn add_to_cache(&mut self) -> Result<Phase, Error> {
        if !self.handler.config.cache_enabled {
            return Ok(Phase::Send);
        }
        let Some(reply) = &self.response else {
            return Ok(Phase::Send);
        };

        // Cache validity follows the TTL the upstream put on the first
        // answer; without one the configured default applies.
        let ttl_secs = reply.answers().first().map_or(0, Record::ttl);
        let ttl = if ttl_secs > 0 {
            Some(Duration::from_secs(u64::from(ttl_secs)))
        } else {
            self.handler.config.cache_expire
        };

        let mut entry = with_queries(&self.msg, self.msg.queries().to_vec());
        entry.set_id(0);
        entry.set_message_type(MessageType::Response);
        entry.set_response_code(reply.response_code());
        entry.set_recursion_available(false);
        for record in &self.backup_answers {
            entry.add_answer(record.clone());
        }
        for record in reply.name_servers() {
            entry.add_name_server(record.clone());
        }
        let bytes = entry.to_vec()?;
        self.handler
            .caches
            .responses
            .set(self.req_key.clone(), bytes, ttl)
            .await;
        Ok(Phase::Send)
    }

    async fn send<R: ResponseHandler>(
        &self,
        msg: &Message,
        mut response_handle: R,
    ) -> Result<ResponseInfo, Error> {
        let mut header = Header::response_from_request(self.request.header());
        header.set_id(msg.id());
        header.set_op_code(msg.op_code());
        header.set_message_type(MessageType::Response);
        header.set_recursion_desired(msg.recursion_desired());
        header.set_recursion_available(msg.recursion_available());
        header.set_response_code(msg.response_code());
        header.set_authoritative(false);

        let builder = MessageResponseBuilder::from_message_request(self.request);
        let response = builder.build(
            header,
            msg.answers().iter(),
            msg.name_servers().iter(),
            &[],
            msg.additionals().iter(),
        );
        Ok(response_handle.send_response(response).await?)
    }
}

#[async_trait::async_trait]
impl RequestHandler for Handler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        self.stats.inc_total_requests();

        // Safety net: a panicking request is logged and dropped, the server
        // keeps serving.
        match AssertUnwindSafe(self.dispatch_request(request, response_handle))
            .catch_unwind()
            .await
        {
            Ok(info) => info,
            Err(_) => {
                error!(id = request.id(), "request handler panicked");
                dropped_response_info()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use trust_dns_proto::rr::{DNSClass, Name};

    fn query(name: &str, rtype: RecordType) -> Query {
        Query::query(Name::from_str(name).unwrap(), rtype)
    }

    #[test]
    fn aaaa_questions_are_dropped_by_default() {
        let questions = vec![
            query("example.com.", RecordType::A),
            query("example.com.", RecordType::AAAA),
        ];

        let kept = filter_questions(questions, false);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].query_type(), RecordType::A);
    }

    #[test]
    fn aaaa_questions_survive_when_ipv6_enabled() {
        let questions = vec![
            query("example.com.", RecordType::A),
            query("example.com.", RecordType::AAAA),
        ];

        let kept = filter_questions(questions, true);

        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn aaaa_only_request_filters_to_nothing() {
        let questions = vec![query("example.com.", RecordType::AAAA)];

        assert!(filter_questions(questions, false).is_empty());
    }

    #[test]
    fn describe_renders_name_class_and_type() {
        let mut q = query("example.com.", RecordType::A);
        q.set_query_class(DNSClass::IN);

        assert_eq!(describe(&q), "(example.com. IN A)");
    }
}
