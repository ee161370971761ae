//! Listeners: classic DNS over UDP/TCP and the DoH endpoint.
//!
//! Every inbound datagram, connection, and HTTP request runs on its own
//! task so a slow upstream never blocks the accept loops. A shutdown
//! signal tears all of them down.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::forwarder::Forwarder;

const DNS_CONTENT_TYPE: &str = "application/dns-message";
const MAX_UDP_REQUEST: usize = 4096;
const MAX_TCP_REQUEST: usize = 65535;

pub struct DnsServer {
    forwarder: Arc<Forwarder>,
    dns_addr: SocketAddr,
    http_addr: SocketAddr,
}

impl DnsServer {
    pub fn new(forwarder: Arc<Forwarder>, dns_addr: SocketAddr, http_addr: SocketAddr) -> Self {
        DnsServer { forwarder, dns_addr, http_addr }
    }

    /// Bind every listener and serve until the shutdown signal fires.
    /// Bind failures are fatal; everything after that is per-request.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let udp_socket = Arc::new(
            UdpSocket::bind(self.dns_addr)
                .await
                .with_context(|| format!("Failed to bind UDP {}", self.dns_addr))?,
        );
        let tcp_listener = TcpListener::bind(self.dns_addr)
            .await
            .with_context(|| format!("Failed to bind TCP {}", self.dns_addr))?;
        let http_listener = TcpListener::bind(self.http_addr)
            .await
            .with_context(|| format!("Failed to bind DoH listener {}", self.http_addr))?;
        info!(
            "Listening: DNS on udp+tcp {}, DoH on http://{}/dns-query",
            self.dns_addr, self.http_addr
        );

        let mut tasks = Vec::new();

        let forwarder = self.forwarder.clone();
        tasks.push(tokio::spawn(async move {
            run_udp(udp_socket, forwarder).await;
        }));

        let forwarder = self.forwarder.clone();
        tasks.push(tokio::spawn(async move {
            run_tcp(tcp_listener, forwarder).await;
        }));

        let forwarder = self.forwarder.clone();
        let mut http_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let router = Router::new()
                .route("/dns-query", get(doh_get).post(doh_post))
                .with_state(forwarder);
            let server = axum::serve(http_listener, router.into_make_service())
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown.changed().await;
                });
            if let Err(e) = server.await {
                error!("DoH server terminated: {}", e);
            }
        }));

        let _ = shutdown.changed().await;
        info!("Shutdown signal received, stopping listeners");
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

async fn run_udp(socket: Arc<UdpSocket>, forwarder: Arc<Forwarder>) {
    let mut buf = vec![0u8; MAX_UDP_REQUEST];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!("UDP recv error: {}", e);
                continue;
            }
        };
        let request = buf[..len].to_vec();
        let socket = socket.clone();
        let forwarder = forwarder.clone();
        tokio::spawn(async move {
            if let Some(reply) = forwarder.forward_udp(&request).await {
                if let Err(e) = socket.send_to(&reply, src).await {
                    debug!("UDP send to {} failed: {}", src, e);
                }
            }
        });
    }
}

async fn run_tcp(listener: TcpListener, forwarder: Arc<Forwarder>) {
    loop {
        let (stream, src) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                debug!("TCP accept error: {}", e);
                continue;
            }
        };
        let forwarder = forwarder.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_tcp_connection(stream, forwarder).await {
                debug!("TCP connection from {} ended: {}", src, e);
            }
        });
    }
}

/// Serve length-prefixed queries on one connection until the client
/// closes it.
async fn serve_tcp_connection(
    mut stream: TcpStream,
    forwarder: Arc<Forwarder>,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(()); // peer closed
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_TCP_REQUEST {
            return Ok(());
        }
        let mut request = vec![0u8; len];
        stream.read_exact(&mut request).await?;

        let Some(reply) = forwarder.forward_stream(&request).await else {
            return Ok(()); // not DNS, drop the connection
        };
        stream.write_all(&(reply.len() as u16).to_be_bytes()).await?;
        stream.write_all(&reply).await?;
    }
}

/// GET /dns-query?dns=<base64url(request)> per RFC 8484.
async fn doh_get(
    State(forwarder): State<Arc<Forwarder>>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Response {
    if let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
        if !accept_allows_dns(accept) {
            return (StatusCode::BAD_REQUEST, "unacceptable Accept header").into_response();
        }
    }
    let query = raw_query.unwrap_or_default();
    let payload = match extract_dns_param(&query) {
        Some(payload) => payload,
        None => {
            return (StatusCode::BAD_REQUEST, "missing or invalid dns parameter")
                .into_response()
        }
    };
    answer(forwarder, payload).await
}

/// POST /dns-query with a raw application/dns-message body.
async fn doh_post(
    State(forwarder): State<Arc<Forwarder>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .unwrap_or_default();
    if content_type != DNS_CONTENT_TYPE {
        return (StatusCode::UNSUPPORTED_MEDIA_TYPE, "expected application/dns-message")
            .into_response();
    }
    answer(forwarder, body.to_vec()).await
}

async fn answer(forwarder: Arc<Forwarder>, payload: Vec<u8>) -> Response {
    match forwarder.forward_stream(&payload).await {
        Some(reply) => {
            let mut response = reply.into_response();
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(DNS_CONTENT_TYPE),
            );
            response
        }
        None => (StatusCode::BAD_REQUEST, "not a DNS message").into_response(),
    }
}

/// An absent Accept header accepts anything; a present one must admit
/// application/dns-message (or a wildcard).
fn accept_allows_dns(accept: &str) -> bool {
    accept.split(',').any(|part| {
        let media = part.split(';').next().unwrap_or("").trim();
        media.eq_ignore_ascii_case(DNS_CONTENT_TYPE) || media == "*/*" || media == "application/*"
    })
}

fn extract_dns_param(query: &str) -> Option<Vec<u8>> {
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            if key == "dns" {
                return URL_SAFE_NO_PAD.decode(value).ok();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmartDnsConfig;
    use crate::geosite::GeositeDb;

    /// A forwarder whose only upstream is a live mock resolver on
    /// loopback (or a black hole when `responder` is false).
    async fn test_forwarder(responder: bool) -> Arc<Forwarder> {
        let addr = if responder {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr = socket.local_addr().unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 512];
                loop {
                    let Ok((len, src)) = socket.recv_from(&mut buf).await else { return };
                    let mut reply = buf[..len].to_vec();
                    reply[2] |= 0x80;
                    let _ = socket.send_to(&reply, src).await;
                }
            });
            addr.to_string()
        } else {
            "127.0.0.1:1".to_string()
        };

        let config = SmartDnsConfig::parse(&format!(
            r#"{{
                "SmartDnsConfig": {{
                    "dnsServers": [
                        {{ "name": "mock", "forwarderProtocol": "Udp",
                           "forwarderAddresses": ["{addr}"] }}
                    ],
                    "rules": [ {{ "domain": ["*"], "dnsServer": "mock" }} ],
                    "udpPool": {{ "size": 1 }}
                }}
            }}"#
        ))
        .expect("config");
        let geosite = GeositeDb::parse(&[]).expect("geosite");
        Arc::new(Forwarder::new(config, geosite).await.expect("forwarder"))
    }

    fn sample_query() -> Vec<u8> {
        vec![
            0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0x07, b'e', b'x', b'a',
            b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00, 0x01, 0x00, 0x01,
        ]
    }

    #[tokio::test]
    async fn post_with_wrong_content_type_is_415() {
        // No upstream must be contacted; the black-hole forwarder would
        // stall the test if one were.
        let forwarder = test_forwarder(false).await;
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let response =
            doh_post(State(forwarder), headers, Bytes::from(sample_query())).await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn post_with_dns_message_body_succeeds() {
        let forwarder = test_forwarder(true).await;
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(DNS_CONTENT_TYPE),
        );
        let response =
            doh_post(State(forwarder), headers, Bytes::from(sample_query())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            DNS_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn get_without_accept_header_succeeds() {
        let forwarder = test_forwarder(true).await;
        let encoded = URL_SAFE_NO_PAD.encode(sample_query());
        let response = doh_get(
            State(forwarder),
            HeaderMap::new(),
            RawQuery(Some(format!("dns={encoded}"))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            DNS_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn get_with_garbage_payload_is_400() {
        let forwarder = test_forwarder(false).await;
        let response = doh_get(
            State(forwarder),
            HeaderMap::new(),
            RawQuery(Some("dns=####".to_string())),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_with_wrong_accept_is_400() {
        let forwarder = test_forwarder(false).await;
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html"));
        let encoded = URL_SAFE_NO_PAD.encode(sample_query());
        let response = doh_get(
            State(forwarder),
            headers,
            RawQuery(Some(format!("dns={encoded}"))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn dns_param_extraction() {
        let encoded = URL_SAFE_NO_PAD.encode([0x12, 0x34, 0x01, 0x00]);
        let query = format!("other=1&dns={}", encoded);
        assert_eq!(
            extract_dns_param(&query),
            Some(vec![0x12, 0x34, 0x01, 0x00])
        );
        assert_eq!(extract_dns_param("other=1"), None);
        assert_eq!(extract_dns_param("dns=!!!"), None);
    }

    #[test]
    fn accept_header_matching() {
        assert!(accept_allows_dns("application/dns-message"));
        assert!(accept_allows_dns("application/dns-message; q=1.0"));
        assert!(accept_allows_dns("text/html, */*"));
        assert!(!accept_allows_dns("text/html"));
        assert!(!accept_allows_dns("application/dns-json"));
    }
}
