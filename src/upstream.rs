//! Upstream endpoints and query dispatch.
//!
//! The proxy owns an ordered list of upstream servers, each reached over UDP
//! or TCP. A request is tried against every endpoint in configured order; the
//! first reply carrying answers wins.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;
use trust_dns_proto::op::Message;

use crate::error::Error;
use crate::stats::Stats;

/// Largest upstream datagram we accept (EDNS-sized).
const MAX_DATAGRAM: usize = 4096;

/// How a single upstream endpoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An upstream DNS server address paired with its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub transport: Transport,
}

/// Parse a comma-separated upstream list of `host:port[:proto]` entries.
///
/// Blank segments are skipped. The proto defaults to `udp`; anything other
/// than `udp` or `tcp` is a startup error, as is an unparsable address.
pub fn parse_endpoints(list: &str) -> Result<Vec<Endpoint>, Error> {
    let mut endpoints = Vec::new();
    for raw in list.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let parts: Vec<&str> = raw.split(':').collect();
        let (addr, proto) = if parts.len() > 2 {
            (parts[..2].join(":"), parts[2])
        } else {
            (raw.to_string(), "udp")
        };

        let transport = match proto {
            "udp" => Transport::Udp,
            "tcp" => Transport::Tcp,
            _ => return Err(Error::InvalidUpstream(raw.to_string())),
        };
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| Error::InvalidUpstream(raw.to_string()))?;

        endpoints.push(Endpoint { addr, transport });
    }

    if endpoints.is_empty() {
        return Err(Error::NoUpstreams);
    }
    Ok(endpoints)
}

/// Sends queries to the configured upstreams, first usable answer wins.
pub struct Dispatcher {
    endpoints: Vec<Endpoint>,
    timeout: Duration,
    stats: Arc<Stats>,
}

impl Dispatcher {
    pub fn new(endpoints: Vec<Endpoint>, timeout: Duration, stats: Arc<Stats>) -> Self {
        Self {
            endpoints,
            timeout,
            stats,
        }
    }

    /// Exchange `query` with the upstream list.
    ///
    /// Endpoints are tried in configured order. A reply with at least one
    /// answer is returned immediately; transport failures and empty replies
    /// advance to the next endpoint. When no endpoint yields answers, the
    /// outcome of the final attempt decides: a well-formed reply (such as an
    /// NXDOMAIN) is still delivered, a transport failure is terminal.
    pub async fn exchange(&self, query: &Message) -> Result<Message, Error> {
        let payload = query.to_vec()?;
        let mut last: Result<Message, Error> = Err(Error::NoUpstreams);

        for endpoint in &self.endpoints {
            self.stats.inc_dns_queries();
            match self.exchange_one(endpoint, &payload).await {
                Ok(reply) => {
                    if !reply.answers().is_empty() {
                        return Ok(reply);
                    }
                    debug!(upstream = %endpoint.addr, "upstream returned no answers");
                    self.stats.inc_dns_failures();
                    last = Ok(reply);
                }
                Err(err) => {
                    debug!(upstream = %endpoint.addr, "upstream attempt failed: {err}");
                    self.stats.inc_dns_failures();
                    last = Err(err);
                }
            }
        }

        last
    }

    async fn exchange_one(&self, endpoint: &Endpoint, payload: &[u8]) -> Result<Message, Error> {
        let data = match endpoint.transport {
            Transport::Udp => self.exchange_udp(endpoint.addr, payload).await?,
            Transport::Tcp => self.exchange_tcp(endpoint.addr, payload).await?,
        };
        Ok(Message::from_vec(&data)?)
    }

    /// One UDP round-trip over a fresh connected socket.
    async fn exchange_udp(&self, addr: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let bind: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16, 0, 0, 0, 0, 0, 0, 0], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;

        timeout(self.timeout, socket.send(payload))
            .await
            .map_err(|_| Error::UpstreamTimeout(addr))??;

        let mut buf = [0u8; MAX_DATAGRAM];
        timeout(self.timeout, async {
            loop {
                let size = socket.recv(&mut buf).await?;
                // The socket is connected and private to this exchange; the
                // ID check discards stray or stale datagrams all the same.
                if size >= 2 && buf[..2] == payload[..2] {
                    return Ok::<_, Error>(buf[..size].to_vec());
                }
            }
        })
        .await
        .map_err(|_| Error::UpstreamTimeout(addr))?
    }

    /// One TCP round-trip with 2-byte length framing.
    async fn exchange_tcp(&self, addr: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let mut stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::UpstreamTimeout(addr))??;

        let mut framed = Vec::with_capacity(2 + payload.len());
        framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        framed.extend_from_slice(payload);
        timeout(self.timeout, stream.write_all(&framed))
            .await
            .map_err(|_| Error::UpstreamTimeout(addr))??;

        let mut len_buf = [0u8; 2];
        timeout(self.timeout, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| Error::UpstreamTimeout(addr))??;
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut body = vec![0u8; len];
        timeout(self.timeout, stream.read_exact(&mut body))
            .await
            .map_err(|_| Error::UpstreamTimeout(addr))??;
        Ok(body)
    }
}
