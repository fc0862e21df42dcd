//! Wires together the UDP/53 DNS listener, the TLS/443 certificate
//! endpoint, and the 24-hour certificate refresh loop.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dns_types::protocol::deserialise::ConsumableBuffer;
use dns_types::protocol::types::{DomainName, Message, Opcode, Rcode};
use rustls::ServerConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::cert::{CertificateManager, ServerCertResolver};
use crate::challenge::ChallengeStore;
use crate::metrics::*;
use crate::responder::Responder;
use crate::zone::Zone;

const REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct Shared {
    pub domain: DomainName,
    pub self_ip: Ipv4Addr,
    pub challenges: Arc<ChallengeStore>,
    pub zone: Option<Zone>,
    pub cert_manager: Arc<CertificateManager>,
    pub cert_resolver: Arc<ServerCertResolver>,
}

async fn handle_query(shared: &Shared, buf: &[u8], peer: SocketAddr) -> Option<Message> {
    let message = match Message::deserialise(ConsumableBuffer::new(buf)) {
        Ok(message) => message,
        Err(err) => {
            debug!(?err, ?peer, "could not parse DNS message");
            return None;
        }
    };

    if message.header.is_response {
        return None;
    }
    if message.header.opcode != Opcode::Standard {
        let mut response = message.make_response();
        response.header.rcode = Rcode::NotImplemented;
        return Some(response);
    }
    // A message that doesn't carry exactly one question can't be
    // matched against our one-question invariant at all, so it's
    // dropped silently rather than answered.
    if message.questions.len() != 1 {
        debug!(?peer, "dropping message with other than one question");
        return None;
    }
    if message.questions[0].is_unknown() {
        let mut response = message.make_response();
        response.header.rcode = Rcode::Refused;
        return Some(response);
    }

    let responder = Responder {
        domain: &shared.domain,
        self_ip: shared.self_ip,
        challenges: &shared.challenges,
        zone: shared.zone.as_ref(),
    };
    responder.respond(&message, peer)
}

/// Runs until the UDP socket itself fails (not a per-packet error,
/// which is logged and ignored): the caller treats this returning at
/// all as fatal.
pub async fn listen_udp_task(shared: Arc<Shared>, socket: UdpSocket) -> std::io::Result<()> {
    let socket = Arc::new(socket);
    let (tx, mut rx) = mpsc::channel::<(Message, SocketAddr)>(32);
    let mut buf = vec![0u8; 512];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (size, peer) = result?;
                DNS_REQUESTS_TOTAL.with_label_values(&["udp"]).inc();
                let bytes = BytesMut::from(&buf[..size]);
                let shared = shared.clone();
                let reply = tx.clone();
                tokio::spawn(async move {
                    let timer = DNS_RESPONSE_TIME_SECONDS
                        .with_label_values(&["udp"])
                        .start_timer();
                    if let Some(response) = handle_query(&shared, &bytes, peer).await {
                        let _ = reply.send((response, peer)).await;
                    }
                    timer.observe_duration();
                });
            }
            Some((message, peer)) = rx.recv() => {
                match message.serialise() {
                    Ok(octets) => {
                        DNS_RESPONSES_TOTAL
                            .with_label_values(&[&message.header.rcode.to_string()])
                            .inc();
                        if let Err(err) = socket.send_to(&octets, peer).await {
                            debug!(?peer, ?err, "UDP send error");
                        }
                    }
                    Err(err) => warn!(?peer, ?err, "could not serialise response"),
                }
            }
        }
    }
}

/// Serves `/cert.pem` and `/key.pem` over TLS on port 443, using the
/// same certificate the DNS-01 challenges were issued for. The HTTP
/// handling here is deliberately minimal: only the request line is
/// read, since exactly two fixed routes exist.
///
/// Individual accept/handshake errors are per-connection and are
/// logged and ignored; this only returns (and is therefore fatal to
/// the caller) if the listener loop itself cannot continue.
pub async fn listen_tls_task(
    shared: Arc<Shared>,
    listener: TcpListener,
    tls_config: Arc<ServerConfig>,
) -> std::io::Result<()> {
    let acceptor = TlsAcceptor::from(tls_config);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                debug!(?err, "TCP accept error");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    if let Err(err) = serve_http(shared, tls_stream, peer).await {
                        debug!(?peer, ?err, "HTTP error");
                    }
                }
                Err(err) => debug!(?peer, ?err, "TLS handshake error"),
            }
        });
    }
}

async fn serve_http(
    shared: Arc<Shared>,
    stream: tokio_rustls::server::TlsStream<TcpStream>,
    peer: SocketAddr,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();

    loop {
        let mut byte = [0u8; 1];
        if reader.read_exact(&mut byte).await.is_err() {
            return Ok(());
        }
        if byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            request_line.push(byte[0] as char);
        }
    }

    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("")
        .to_string();

    let body = match path.as_str() {
        "/cert.pem" => Some(shared.cert_manager.cert_pem().await),
        "/key.pem" => Some(shared.cert_manager.key_pem().await),
        _ => None,
    };

    let stream = reader.into_inner();
    let mut stream = stream;
    match body {
        Some(body) => {
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/x-pem-file\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(header.as_bytes()).await?;
            stream.write_all(&body).await?;
        }
        None => {
            let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
            stream.write_all(response.as_bytes()).await?;
        }
    }
    stream.flush().await?;
    debug!(?peer, %path, "served HTTP request");
    Ok(())
}

pub async fn refresh_task(shared: Arc<Shared>) {
    loop {
        tokio::time::sleep(REFRESH_INTERVAL).await;
        shared.cert_manager.load_or_refresh().await;
        shared.cert_resolver.update(&shared.cert_manager).await;
        info!("refreshed certificate");
    }
}
