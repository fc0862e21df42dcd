mod acme;
mod cache;
mod cert;
mod challenge;
mod metrics;
mod responder;
mod server;
mod zone;

use std::collections::HashSet;
use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use dns_types::protocol::types::DomainName;
use rustls::ServerConfig;
use tokio::net::{TcpListener, UdpSocket};
use tracing_subscriber::EnvFilter;

use cache::FileCache;
use cert::{CertificateManager, ServerCertResolver};
use challenge::ChallengeStore;
use metrics::serve_prometheus_endpoint_task;
use server::{listen_tls_task, listen_udp_task, refresh_task, Shared};
use zone::zone_from_file;

const DNS_PORT: u16 = 53;
const HTTPS_PORT: u16 = 443;
const DEFAULT_ACME_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser, Clone)]
/// An authoritative DNS server for a local-ip service: it resolves
/// dash-encoded private IPv4 addresses under a domain you control
/// (e.g. `10-0-0-5.example.com` resolves to `10.0.0.5`), and serves a
/// wildcard TLS certificate for that domain obtained through ACME
/// DNS-01 challenges answered by this same server.
///
/// Prometheus metrics are served at
/// "http://{metrics_interface}:{metrics_port}/metrics".
struct Args {
    /// Base domain to serve, e.g. "example.com"
    #[clap(long, value_parser)]
    domain: String,

    /// This server's own public IPv4 address, returned for the apex
    /// and "ns." names
    #[clap(long, value_parser)]
    self_ip: Ipv4Addr,

    /// Directory to cache the ACME account and certificate in
    #[clap(long, value_parser, default_value = "./cache")]
    cache_dir: PathBuf,

    /// Contact email for the ACME account
    #[clap(long, value_parser)]
    email: String,

    /// Path to the PEM-encoded ECDSA ACME account private key
    #[clap(long, value_parser)]
    key: PathBuf,

    /// Registration URI of an existing ACME account to use, if any
    #[clap(long, value_parser)]
    reg: Option<String>,

    /// ACME directory URL
    #[clap(long, value_parser, default_value = DEFAULT_ACME_DIRECTORY)]
    acme_directory: String,

    /// Path to an optional zone file of additional static records to
    /// serve under the domain
    #[clap(long, value_parser)]
    zone_file: Option<PathBuf>,

    /// Interface to listen on for DNS and HTTPS
    #[clap(long, value_parser, default_value_t = Ipv4Addr::UNSPECIFIED)]
    interface: Ipv4Addr,

    /// Interface to listen on to serve Prometheus metrics
    #[clap(long, value_parser, default_value_t = Ipv4Addr::LOCALHOST)]
    metrics_interface: Ipv4Addr,

    /// Port to listen on to serve Prometheus metrics
    #[clap(long, value_parser, default_value_t = 9420)]
    metrics_port: u16,
}

fn begin_logging() {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        var.split(',').map(str::to_string).collect::<HashSet<_>>()
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        logger.json().init();
    } else if log_format.contains("pretty") {
        logger.pretty().init();
    } else if log_format.contains("compact") {
        logger.compact().init();
    } else {
        logger.init();
    }
}

fn build_tls_config(cert_resolver: Arc<ServerCertResolver>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(cert_resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    begin_logging();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("default crypto provider already installed");
    }

    let account_key_pem = match tokio::fs::read(&args.key).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(path = ?args.key, %err, "could not read ACME account private key");
            process::exit(1);
        }
    };
    match rustls_pemfile::private_key(&mut account_key_pem.as_slice()) {
        Ok(Some(_)) => {}
        Ok(None) => {
            tracing::error!(path = ?args.key, "no private key found in ACME account key file");
            process::exit(1);
        }
        Err(err) => {
            tracing::error!(path = ?args.key, %err, "ACME account private key is not valid PEM");
            process::exit(1);
        }
    }

    let domain = match DomainName::from_dotted_string(&format!("{}.", args.domain)) {
        Some(domain) => domain,
        None => {
            tracing::error!(domain = %args.domain, "invalid domain");
            process::exit(1);
        }
    };

    let zone = match &args.zone_file {
        Some(path) => match zone_from_file(&domain, path).await {
            Ok(zone) => Some(zone),
            Err(err) => {
                tracing::error!(?path, %err, "could not load zone file");
                process::exit(1);
            }
        },
        None => None,
    };

    let cache = Box::new(FileCache::new(args.cache_dir.clone()));
    let challenges = Arc::new(ChallengeStore::new());

    let cert_manager = match CertificateManager::init(
        args.domain.clone(),
        cache,
        &args.acme_directory,
        &args.email,
        &account_key_pem,
        args.reg.as_deref(),
        challenges.clone(),
    )
    .await
    {
        Ok(manager) => Arc::new(manager),
        Err(err) => {
            tracing::error!(%err, "could not initialise ACME client");
            process::exit(1);
        }
    };

    let cert_resolver = Arc::new(ServerCertResolver::new());

    tracing::info!("loading initial certificate");
    cert_manager.load_or_refresh().await;
    cert_resolver.update(&cert_manager).await;

    let shared = Arc::new(Shared {
        domain,
        self_ip: args.self_ip,
        challenges,
        zone,
        cert_manager: cert_manager.clone(),
        cert_resolver: cert_resolver.clone(),
    });

    tracing::info!(interface = %args.interface, port = %DNS_PORT, "binding DNS UDP socket");
    let udp = match UdpSocket::bind((args.interface, DNS_PORT)).await {
        Ok(socket) => socket,
        Err(err) => {
            tracing::error!(%err, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    tracing::info!(interface = %args.interface, port = %HTTPS_PORT, "binding HTTPS TCP socket");
    let tls_listener = match TcpListener::bind((args.interface, HTTPS_PORT)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, "could not bind HTTPS TCP socket");
            process::exit(1);
        }
    };

    let tls_config = build_tls_config(cert_resolver.clone());

    let udp_task = tokio::spawn(listen_udp_task(shared.clone(), udp));
    let tls_task = tokio::spawn(listen_tls_task(shared.clone(), tls_listener, tls_config));
    let refresh = tokio::spawn(refresh_task(shared.clone()));

    tracing::info!(interface = %args.metrics_interface, port = %args.metrics_port, "binding metrics HTTP socket");
    let metrics_address = (args.metrics_interface, args.metrics_port).into();

    // None of these are expected to ever finish: each is a supervised
    // listener or loop that only returns on a fatal error. Whichever
    // finishes first brings the whole process down, rather than
    // leaving the others running with a dead peer.
    tokio::select! {
        result = udp_task => {
            tracing::error!(?result, "DNS UDP listener exited");
            process::exit(1);
        }
        result = tls_task => {
            tracing::error!(?result, "HTTPS TLS listener exited");
            process::exit(1);
        }
        result = refresh => {
            tracing::error!(?result, "certificate refresh loop exited");
            process::exit(1);
        }
        result = serve_prometheus_endpoint_task(metrics_address) => {
            tracing::error!(?result, "metrics HTTP server exited");
            process::exit(1);
        }
    }
}
