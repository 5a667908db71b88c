use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use trust_dns_server::ServerFuture;

use crate::cache::Caches;
use crate::config::Shared;
use crate::error::Error;
use crate::proxy::handler::Handler;
use crate::stats::Stats;
use crate::upstream::Dispatcher;

/// How long an idle client TCP session is kept open.
const TCP_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn new(
    config: Shared,
    caches: Caches,
    stats: Arc<Stats>,
) -> Result<ServerFuture<Handler>, Error> {
    let listen = config.listen;
    let dispatcher = Dispatcher::new(config.upstreams.clone(), config.timeout, stats.clone());
    let handler = Handler::new(config, caches, dispatcher, stats);
    let mut server = ServerFuture::new(handler);
    server.register_socket(UdpSocket::bind(listen).await?);
    server.register_listener(TcpListener::bind(listen).await?, TCP_SESSION_TIMEOUT);
    Ok(server)
}
