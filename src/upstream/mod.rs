//! Upstream resolution: one client per configured upstream group.
//!
//! The first attempt fans out to every endpoint of the group in parallel
//! and the first valid response wins; in-flight siblings are cancelled.
//! Further attempts walk the endpoints one at a time until the retry
//! budget runs out.

pub mod https;
pub mod socks5;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::net::lookup_host;
use tokio::task::JoinSet;
use tokio_rustls::rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{Endpoint, Protocol, ProxyServer, UpstreamGroup};
use crate::message::{Message, ParseError, RCODE_FORMERR, RCODE_NOERROR, RCODE_NXDOMAIN, RCODE_REFUSED, RCODE_SERVFAIL};

use self::https::HttpsTransport;
use self::socks5::Socks5Config;
use self::tcp::StreamTransport;
use self::udp::SocketPool;

pub const DEFAULT_RETRIES: u32 = 5;
pub const UDP_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
pub const STREAM_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("attempt timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transport: {0}")]
    Transport(String),
    #[error("malformed upstream response: {0}")]
    Protocol(#[from] ParseError),
    #[error("response validation: {0}")]
    Invalid(&'static str),
    #[error("no valid response after {0} attempts")]
    Exhausted(u32),
}

enum Transport {
    Udp {
        endpoint: Endpoint,
        pool: Arc<SocketPool>,
        proxy: Option<Socks5Config>,
    },
    Stream(StreamTransport, Endpoint),
    Https(HttpsTransport, Endpoint),
}

impl Transport {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
        match self {
            Transport::Udp { endpoint, pool, proxy } => match proxy {
                Some(proxy) => {
                    Ok(udp::exchange_via_proxy(proxy, &endpoint.host, endpoint.port, query)
                        .await?)
                }
                None => {
                    let target = resolve_target(endpoint).await?;
                    Ok(udp::exchange(pool, target, query).await?)
                }
            },
            Transport::Stream(transport, _) => Ok(transport.exchange(query).await?),
            Transport::Https(transport, _) => transport.exchange(query).await,
        }
    }

    fn endpoint(&self) -> &Endpoint {
        match self {
            Transport::Udp { endpoint, .. } => endpoint,
            Transport::Stream(_, endpoint) => endpoint,
            Transport::Https(_, endpoint) => endpoint,
        }
    }
}

async fn resolve_target(endpoint: &Endpoint) -> Result<SocketAddr, ResolveError> {
    lookup_host((endpoint.host.as_str(), endpoint.port))
        .await?
        .next()
        .ok_or_else(|| ResolveError::Transport(format!("no address for {endpoint}")))
}

pub struct UpstreamClient {
    name: String,
    protocol: Protocol,
    dnssec: bool,
    transports: Vec<Arc<Transport>>,
    attempt_timeout: Duration,
    retries: u32,
}

impl UpstreamClient {
    pub fn new(
        group: &UpstreamGroup,
        proxy: Option<&ProxyServer>,
        pool: Arc<SocketPool>,
    ) -> Result<Self, ResolveError> {
        let proxy = proxy.map(Socks5Config::from);
        let attempt_timeout = match group.forwarder_protocol {
            Protocol::Udp => UDP_ATTEMPT_TIMEOUT,
            _ => STREAM_ATTEMPT_TIMEOUT,
        };

        let mut transports = Vec::new();
        let tls = match group.forwarder_protocol {
            Protocol::Tls => Some(webpki_connector()),
            _ => None,
        };
        for endpoint in group.endpoints() {
            let transport = match group.forwarder_protocol {
                Protocol::Udp => Transport::Udp {
                    endpoint,
                    pool: pool.clone(),
                    proxy: proxy.clone(),
                },
                Protocol::Tcp => Transport::Stream(
                    StreamTransport::new(endpoint.clone(), None, proxy.clone()),
                    endpoint,
                ),
                Protocol::Tls => Transport::Stream(
                    StreamTransport::new(endpoint.clone(), tls.clone(), proxy.clone()),
                    endpoint,
                ),
                Protocol::Https => Transport::Https(
                    HttpsTransport::new(&endpoint, proxy.as_ref(), attempt_timeout)?,
                    endpoint,
                ),
            };
            transports.push(Arc::new(transport));
        }

        Ok(UpstreamClient {
            name: group.name.clone(),
            protocol: group.forwarder_protocol,
            dnssec: group.dnssec_validation,
            transports,
            attempt_timeout,
            retries: DEFAULT_RETRIES,
        })
    }

    /// Override the retry budget and per-attempt deadline.
    pub fn with_attempt_policy(mut self, retries: u32, attempt_timeout: Duration) -> Self {
        self.retries = retries;
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub async fn resolve(&self, request: &Message) -> Result<Message, ResolveError> {
        let query = self.prepare_query(request);

        // First attempt: every endpoint at once, first valid answer wins.
        // Dropping the set aborts the losers.
        let mut set = JoinSet::new();
        for transport in &self.transports {
            let transport = transport.clone();
            let query = query.clone();
            let deadline = self.attempt_timeout;
            set.spawn(async move {
                let outcome = tokio::time::timeout(deadline, transport.exchange(&query)).await;
                (transport, outcome)
            });
        }
        while let Some(joined) = set.join_next().await {
            let Ok((transport, outcome)) = joined else { continue };
            match flatten(outcome) {
                Ok(bytes) => match validate(request, &bytes) {
                    Ok(response) => return Ok(response),
                    Err(e) => debug!(
                        "Discarding response from {}://{}: {}",
                        self.protocol.as_str(),
                        transport.endpoint(),
                        e
                    ),
                },
                Err(e) => debug!(
                    "Attempt against {}://{} failed: {}",
                    self.protocol.as_str(),
                    transport.endpoint(),
                    e
                ),
            }
        }

        // Retries: rotate through the endpoints in a shuffled order so a
        // retry lands on a different server than the one that just failed.
        let mut order: Vec<usize> = (0..self.transports.len()).collect();
        order.shuffle(&mut rand::thread_rng());
        for attempt in 0..self.retries {
            let transport = &self.transports[order[attempt as usize % order.len()]];
            let outcome =
                tokio::time::timeout(self.attempt_timeout, transport.exchange(&query)).await;
            match flatten(outcome) {
                Ok(bytes) => match validate(request, &bytes) {
                    Ok(response) => return Ok(response),
                    Err(e) => debug!(
                        "Retry {} against {}://{} discarded: {}",
                        attempt + 1,
                        self.protocol.as_str(),
                        transport.endpoint(),
                        e
                    ),
                },
                Err(e) => debug!(
                    "Retry {} against {}://{} failed: {}",
                    attempt + 1,
                    self.protocol.as_str(),
                    transport.endpoint(),
                    e
                ),
            }
        }
        Err(ResolveError::Exhausted(self.retries + 1))
    }

    /// Serialize the outgoing query. Groups asking their upstream to
    /// validate get the EDNS DO bit; everything else passes through.
    fn prepare_query(&self, request: &Message) -> Vec<u8> {
        if !self.dnssec {
            return request.encode();
        }
        let mut request = request.clone();
        request.edns.get_or_insert_with(Default::default).dnssec_ok = true;
        request.encode()
    }
}

fn flatten(
    outcome: Result<Result<Vec<u8>, ResolveError>, tokio::time::error::Elapsed>,
) -> Result<Vec<u8>, ResolveError> {
    match outcome {
        Ok(inner) => inner,
        Err(_) => Err(ResolveError::Timeout),
    }
}

/// A response counts only if it matches the request and carries an RCODE
/// the forwarder is willing to surface.
fn validate(request: &Message, bytes: &[u8]) -> Result<Message, ResolveError> {
    let response = Message::decode(bytes)?;
    if !response.flags.qr {
        return Err(ResolveError::Invalid("not a response"));
    }
    if response.id != request.id {
        return Err(ResolveError::Invalid("transaction ID mismatch"));
    }
    if response.questions.len() != request.questions.len() {
        return Err(ResolveError::Invalid("question count mismatch"));
    }
    for (theirs, ours) in response.questions.iter().zip(&request.questions) {
        if theirs.qtype != ours.qtype
            || theirs.qclass != ours.qclass
            || !theirs.name.eq_ignore_case(&ours.name)
        {
            return Err(ResolveError::Invalid("question section mismatch"));
        }
    }
    match response.rcode() {
        r if r == RCODE_NOERROR as u16
            || r == RCODE_FORMERR as u16
            || r == RCODE_SERVFAIL as u16
            || r == RCODE_NXDOMAIN as u16
            || r == RCODE_REFUSED as u16 =>
        {
            Ok(response)
        }
        _ => Err(ResolveError::Invalid("unsurfaceable RCODE")),
    }
}

/// TLS client configuration anchored at the webpki root set; SNI and
/// certificate verification use the endpoint's host.
fn webpki_connector() -> TlsConnector {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    let client_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(client_config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Flags, Name, Question};
    use tokio::net::UdpSocket;

    fn request() -> Message {
        Message {
            id: 0x4242,
            flags: Flags { rd: true, ..Default::default() },
            questions: vec![Question {
                name: Name::from_dotted("example.com").unwrap(),
                qtype: 1,
                qclass: 1,
            }],
            ..Default::default()
        }
    }

    fn answered(request: &Message) -> Message {
        let mut response = request.clone();
        response.flags.qr = true;
        response.flags.ra = true;
        response
    }

    #[test]
    fn validate_accepts_matching_response() {
        let req = request();
        let resp = answered(&req);
        assert!(validate(&req, &resp.encode()).is_ok());
    }

    #[test]
    fn validate_is_case_insensitive_on_names() {
        let req = request();
        let mut resp = answered(&req);
        resp.questions[0].name = Name::from_dotted("EXAMPLE.COM").unwrap();
        assert!(validate(&req, &resp.encode()).is_ok());
    }

    #[test]
    fn validate_rejects_id_mismatch() {
        let req = request();
        let mut resp = answered(&req);
        resp.id = 0x1111;
        assert!(matches!(
            validate(&req, &resp.encode()),
            Err(ResolveError::Invalid(_))
        ));
    }

    #[test]
    fn validate_rejects_question_mismatch() {
        let req = request();
        let mut resp = answered(&req);
        resp.questions[0].qtype = 28;
        assert!(matches!(
            validate(&req, &resp.encode()),
            Err(ResolveError::Invalid(_))
        ));
    }

    #[test]
    fn validate_rejects_notimp() {
        let req = request();
        let mut resp = answered(&req);
        resp.flags.rcode = 4; // NOTIMP is not surfaceable
        assert!(matches!(
            validate(&req, &resp.encode()),
            Err(ResolveError::Invalid(_))
        ));
    }

    #[test]
    fn validate_keeps_formerr_for_the_forwarder_to_map() {
        let req = request();
        let mut resp = answered(&req);
        resp.flags.rcode = RCODE_FORMERR;
        assert!(validate(&req, &resp.encode()).is_ok());
    }

    async fn mock_udp_responder(mangle_id: bool) -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else { return };
                let mut reply = buf[..len].to_vec();
                reply[2] |= 0x80;
                if mangle_id {
                    reply[0] ^= 0xFF;
                }
                let _ = socket.send_to(&reply, src).await;
            }
        });
        addr
    }

    fn group_for(addr: std::net::SocketAddr) -> UpstreamGroup {
        UpstreamGroup {
            name: "test".into(),
            proxy: None,
            dnssec_validation: false,
            forwarder_protocol: Protocol::Udp,
            forwarder_addresses: vec![addr.to_string()],
        }
    }

    #[tokio::test]
    async fn resolves_via_local_udp_responder() {
        let addr = mock_udp_responder(false).await;
        let pool = Arc::new(SocketPool::bind(2, &[]).await);
        let client = UpstreamClient::new(&group_for(addr), None, pool).expect("client");

        let req = request();
        let resp = client.resolve(&req).await.expect("resolve");
        assert_eq!(resp.id, req.id);
        assert!(resp.flags.qr);
        assert_eq!(resp.questions[0].name.to_lowercase_string(), "example.com");
    }

    #[tokio::test]
    async fn mangled_responses_exhaust_the_retry_budget() {
        let addr = mock_udp_responder(true).await;
        let pool = Arc::new(SocketPool::bind(2, &[]).await);
        let client = UpstreamClient::new(&group_for(addr), None, pool)
            .expect("client")
            .with_attempt_policy(1, Duration::from_millis(100));

        let result = client.resolve(&request()).await;
        assert!(matches!(result, Err(ResolveError::Exhausted(2))));
    }
}
