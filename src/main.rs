use anyhow::Result;
use clap::Parser;
use palisade::cache::{self, Caches};
use palisade::config::{Config, Shared, PENDING_CACHE_FILE, VALIDATED_CACHE_FILE};
use palisade::stats::Stats;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Caching DNS proxy with CNAME client validation.
#[derive(Parser, Debug)]
#[command(name = "palisade")]
#[command(about = "Caching DNS proxy with CNAME client validation", long_about = None)]
struct Args {
    /// Local listen address; a bare `:port` binds all interfaces
    #[arg(long, default_value = ":53")]
    local: String,

    /// Upstream servers as `host:port[:proto]`, use `,` as sep
    #[arg(
        long,
        default_value = "192.168.2.1:53:udp,8.8.8.8:53:udp,8.8.4.4:53:udp,8.8.8.8:53:tcp,8.8.4.4:53:tcp"
    )]
    dns: String,

    /// Debug level 0 1 2
    #[arg(long, default_value_t = 0)]
    debug: u8,

    /// Enable the response cache
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    cache: bool,

    /// Default cache expire seconds, -1 means use domain ttl time
    #[arg(long, default_value_t = 3600)]
    expire: i64,

    /// Revalidation period in seconds, -1 means never revalidate
    #[arg(long, default_value_t = 1800)]
    revalidation: i64,

    /// TTL in seconds set as the validation period
    #[arg(long, default_value_t = 1800)]
    ttl: i64,

    /// Response cache snapshot file (defaults to resp_cache.dat beside the binary)
    #[arg(long)]
    file: Option<PathBuf>,

    /// Serve AAAA queries instead of dropping them
    #[arg(short = '6', long = "ipv6", default_value_t = false)]
    ipv6: bool,

    /// Per-upstream read/write timeout in milliseconds
    #[arg(long, default_value_t = 200)]
    timeout: u64,

    /// Address answered for the root query
    #[arg(long, default_value = "10.40.221.132")]
    sentinel: Ipv4Addr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_init(args.debug);

    let config: Shared = Arc::new(Config::try_new(
        &args.local,
        &args.dns,
        args.debug,
        args.cache,
        args.expire,
        args.revalidation,
        args.ttl,
        args.file,
        args.ipv6,
        args.timeout,
        args.sentinel,
    )?);

    let stats = Arc::new(Stats::new());
    let caches = caches_init(&config).await;

    info!("DNS listening on UDP {}", config.listen);
    info!("DNS listening on TCP {}", config.listen);
    let dns_server = palisade::new_dns(config.clone(), caches.clone(), stats.clone()).await?;
    let dns_handle = tokio::spawn(dns_server.block_until_done());

    tokio::select! {
        () = wait_for_shutdown(config.clone(), caches.clone()) => {
            info!("quitting from signal");
        }
        Ok(dns_res) = dns_handle => {
            if let Err(err) = dns_res {
                save_all(&config, &caches).await;
                return Err(palisade::Error::Proto(err).into());
            }
        }
    }

    save_all(&config, &caches).await;
    println!("{}", stats.summary());
    Ok(())
}

fn tracing_init(debug: u8) {
    let default_filter = match debug {
        0 => "palisade=info",
        1 => "palisade=debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Build the three stores, reload their snapshots, and start the periodic
/// snapshot tasks. A missing or stale snapshot is not an error.
async fn caches_init(config: &Shared) -> Caches {
    let caches = Caches::new();

    let stores = [
        (&caches.responses, config.cache_file.clone()),
        (&caches.pending, PathBuf::from(PENDING_CACHE_FILE)),
        (&caches.validated, PathBuf::from(VALIDATED_CACHE_FILE)),
    ];
    for (store, path) in stores {
        if let Err(err) = store.load(&path).await {
            warn!(path = %path.display(), "cache load failed: {err}");
        }
        cache::spawn_snapshot_task(store.clone(), path);
    }

    caches
}

/// Block until a termination signal arrives. Interrupt, terminate and quit
/// save the caches and shut the process down; hang-up saves and then flushes
/// every cache but keeps serving.
async fn wait_for_shutdown(config: Shared, caches: Caches) {
    let mut sigint =
        signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to register SIGQUIT handler");
    let mut sighup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");

    loop {
        tokio::select! {
            _ = sigint.recv() => return,
            _ = sigterm.recv() => return,
            _ = sigquit.recv() => return,
            _ = sighup.recv() => {
                info!("recv SIGHUP clear cache");
                save_all(&config, &caches).await;
                caches.responses.flush().await;
                caches.pending.flush().await;
                caches.validated.flush().await;
            }
        }
    }
}

async fn save_all(config: &Shared, caches: &Caches) {
    let stores = [
        (&caches.responses, config.cache_file.clone()),
        (&caches.pending, PathBuf::from(PENDING_CACHE_FILE)),
        (&caches.validated, PathBuf::from(VALIDATED_CACHE_FILE)),
    ];
    for (store, path) in stores {
        if let Err(err) = store.save(&path).await {
            warn!(path = %path.display(), "cache save failed: {err}");
        }
    }
}
