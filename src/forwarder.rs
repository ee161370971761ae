//! The forwarding pipeline: decode a request, pick an upstream group,
//! resolve through a cached client, re-encode the answer.
//!
//! One `Forwarder` lives for the whole process and is shared by every
//! listener task. The only mutation on the hot path is the
//! insertion-only client cache.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::SmartDnsConfig;
use crate::geosite::GeositeDb;
use crate::message::{
    Flags, Message, HEADER_LEN, RCODE_FORMERR, RCODE_SERVFAIL,
};
use crate::rules::RuleEngine;
use crate::upstream::udp::SocketPool;
use crate::upstream::UpstreamClient;

pub struct Forwarder {
    config: Arc<SmartDnsConfig>,
    rules: RuleEngine,
    pool: Arc<SocketPool>,
    // Insertion-only, double-checked: the lock is only held to look up
    // or install a client, never across a resolve.
    clients: Mutex<HashMap<String, Arc<UpstreamClient>>>,
}

impl Forwarder {
    pub async fn new(config: SmartDnsConfig, geosite: GeositeDb) -> Result<Self> {
        let geosite = Arc::new(geosite);
        let rules = RuleEngine::new(&config.rules, geosite.clone())
            .context("Failed to build the rule table")?;
        let pool = Arc::new(
            SocketPool::bind(config.udp_pool.size, &config.udp_pool.excluded_ports).await,
        );
        info!(
            "Forwarder ready: {} rules over {} upstream groups, {} geosite categories ({} patterns), {} pooled sockets",
            rules.rule_count(),
            config.dns_servers.len(),
            geosite.category_count(),
            geosite.pattern_count(),
            pool.size()
        );
        Ok(Forwarder {
            config: Arc::new(config),
            rules,
            pool,
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub async fn from_files(config_path: &Path, geosite_path: &Path) -> Result<Self> {
        let config = SmartDnsConfig::load(config_path)?;
        let geosite = GeositeDb::load(geosite_path).with_context(|| {
            format!("Failed to load geosite database '{}'", geosite_path.display())
        })?;
        Self::new(config, geosite).await
    }

    /// Handle one request and encode the reply for a UDP delivery,
    /// truncating to the client's advertised payload limit. `None` means
    /// the datagram was unparseable beyond recovery and must be dropped.
    pub async fn forward_udp(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::decode(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!("Undecodable UDP request: {}", e);
                return formerr_for_raw(raw);
            }
        };
        let limit = request.udp_payload_limit();
        Some(self.respond(request).await.encode_for_udp(limit))
    }

    /// Handle one request for a stream transport (TCP or DoH), where no
    /// truncation applies. `None` means the bytes were not a DNS message.
    pub async fn forward_stream(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::decode(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!("Undecodable stream request: {}", e);
                return None;
            }
        };
        Some(self.respond(request).await.encode())
    }

    /// Route one decoded request and produce its reply.
    async fn respond(&self, request: Message) -> Message {
        let started = Instant::now();

        let Some(question) = request.questions.first() else {
            debug!("Request {:#06x} carries no question", request.id);
            return synthetic_response(&request, RCODE_FORMERR);
        };
        let domain = question.name.to_lowercase_string();

        let upstream = match self.rules.pick_upstream(&domain) {
            Ok(name) => name,
            Err(_) => {
                warn!("No rule matched '{}', answering SERVFAIL", domain);
                return synthetic_response(&request, RCODE_SERVFAIL);
            }
        };

        let client = match self.client_for(upstream) {
            Ok(client) => client,
            Err(e) => {
                warn!("Cannot build client for group '{}': {}", upstream, e);
                return synthetic_response(&request, RCODE_SERVFAIL);
            }
        };

        match client.resolve(&request).await {
            Ok(mut response) => {
                enforce_reply_invariants(&request, &mut response);
                info!(
                    "Resolved '{}' via {} ({}) in {:.1}ms, RCODE {}",
                    domain,
                    client.name(),
                    client.protocol().as_str(),
                    started.elapsed().as_secs_f64() * 1000.0,
                    response.flags.rcode
                );
                response
            }
            Err(e) => {
                debug!(
                    "Upstream group '{}' failed for '{}' after {:.1}ms: {}",
                    upstream,
                    domain,
                    started.elapsed().as_secs_f64() * 1000.0,
                    e
                );
                synthetic_response(&request, RCODE_SERVFAIL)
            }
        }
    }

    /// Fetch or lazily construct the client for an upstream group.
    fn client_for(&self, name: &str) -> Result<Arc<UpstreamClient>> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(name) {
            return Ok(client.clone());
        }
        let group = self
            .config
            .group(name)
            .with_context(|| format!("Unknown upstream group '{name}'"))?;
        let proxy = group.proxy.as_deref().and_then(|p| self.config.proxy(p));
        let client = Arc::new(
            UpstreamClient::new(group, proxy, self.pool.clone())
                .with_context(|| format!("Failed to construct client for '{name}'"))?,
        );
        clients.insert(name.to_string(), client.clone());
        Ok(client)
    }
}

/// Build a question-echoing reply with the given RCODE and no records.
fn synthetic_response(request: &Message, rcode: u8) -> Message {
    Message {
        id: request.id,
        flags: Flags {
            qr: true,
            opcode: request.flags.opcode,
            aa: false,
            tc: false,
            rd: request.flags.rd,
            ra: true,
            z: false,
            ad: false,
            cd: request.flags.cd,
            rcode,
        },
        questions: request.questions.clone(),
        ..Default::default()
    }
}

/// The reply contract: ID, question, and OPCODE equal the request's,
/// RD/CD are mirrored, RA is set, AA survives only if the upstream
/// asserted it. Upstream FORMERR is surfaced as SERVFAIL.
fn enforce_reply_invariants(request: &Message, response: &mut Message) {
    response.id = request.id;
    response.questions = request.questions.clone();
    response.flags.qr = true;
    response.flags.opcode = request.flags.opcode;
    response.flags.rd = request.flags.rd;
    response.flags.cd = request.flags.cd;
    response.flags.ra = true;
    if response.flags.rcode == RCODE_FORMERR {
        response.flags.rcode = RCODE_SERVFAIL;
        if let Some(edns) = &mut response.edns {
            edns.ext_rcode = 0;
        }
    }
}

/// Best-effort FORMERR for bytes that never decoded: recover the ID (and
/// the OPCODE/RD bits when a full header is present) or give up.
fn formerr_for_raw(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.len() < 2 {
        return None;
    }
    let id = u16::from_be_bytes([raw[0], raw[1]]);
    let mut flags = Flags {
        qr: true,
        ra: true,
        rcode: RCODE_FORMERR,
        ..Default::default()
    };
    if raw.len() >= HEADER_LEN {
        flags.opcode = (raw[2] >> 3) & 0x0F;
        flags.rd = raw[2] & 0x01 != 0;
    }
    let reply = Message { id, flags, ..Default::default() };
    Some(reply.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Name, Question, Record};

    fn request() -> Message {
        Message {
            id: 0x1234,
            flags: Flags { rd: true, cd: true, ..Default::default() },
            questions: vec![Question {
                name: Name::from_dotted("www.Example.com").unwrap(),
                qtype: 1,
                qclass: 1,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn synthetic_response_mirrors_the_request() {
        let req = request();
        let resp = synthetic_response(&req, RCODE_SERVFAIL);
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.questions, req.questions);
        assert!(resp.flags.qr);
        assert!(resp.flags.rd);
        assert!(resp.flags.cd);
        assert!(resp.flags.ra);
        assert_eq!(resp.flags.rcode, RCODE_SERVFAIL);
        assert!(resp.answers.is_empty());
    }

    #[test]
    fn reply_invariants_are_enforced() {
        let req = request();
        let mut resp = req.clone();
        resp.id = 0x9999;
        resp.flags.qr = true;
        resp.flags.rd = false;
        resp.flags.cd = false;
        resp.flags.aa = true;
        resp.answers.push(Record {
            name: req.questions[0].name.clone(),
            rtype: 1,
            class: 1,
            ttl: 60,
            rdata: vec![1, 2, 3, 4],
        });

        enforce_reply_invariants(&req, &mut resp);
        assert_eq!(resp.id, req.id);
        assert!(resp.flags.rd);
        assert!(resp.flags.cd);
        assert!(resp.flags.ra);
        assert!(resp.flags.aa, "upstream-asserted AA survives");
        assert_eq!(resp.answers.len(), 1);
    }

    #[test]
    fn upstream_formerr_surfaces_as_servfail() {
        let req = request();
        let mut resp = req.clone();
        resp.flags.qr = true;
        resp.flags.rcode = RCODE_FORMERR;
        enforce_reply_invariants(&req, &mut resp);
        assert_eq!(resp.flags.rcode, RCODE_SERVFAIL);
    }

    #[test]
    fn recovered_id_yields_a_formerr_reply() {
        let garbage = [0xAB, 0xCD, 0x01, 0x00, 0xFF];
        let reply = formerr_for_raw(&garbage).expect("reply");
        let msg = Message::decode(&reply).expect("decode");
        assert_eq!(msg.id, 0xABCD);
        assert!(msg.flags.qr);
        assert_eq!(msg.flags.rcode, RCODE_FORMERR);
    }

    #[test]
    fn unrecoverable_bytes_are_dropped() {
        assert!(formerr_for_raw(&[0x01]).is_none());
    }

    /// Whole pipeline against a local mock resolver: decode, route on a
    /// suffix rule, resolve over UDP, re-encode.
    #[tokio::test]
    async fn forwards_end_to_end_over_udp() {
        let upstream = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((len, src)) = upstream.recv_from(&mut buf).await else { return };
                let mut reply = buf[..len].to_vec();
                reply[2] |= 0x80; // QR
                reply[3] |= 0x80; // RA
                let _ = upstream.send_to(&reply, src).await;
            }
        });

        let config = SmartDnsConfig::parse(&format!(
            r#"{{
                "SmartDnsConfig": {{
                    "dnsServers": [
                        {{ "name": "mock", "forwarderProtocol": "Udp",
                           "forwarderAddresses": ["{upstream_addr}"] }}
                    ],
                    "rules": [
                        {{ "domain": ["suffix:cn"], "dnsServer": "mock" }},
                        {{ "domain": ["*"], "dnsServer": "mock" }}
                    ],
                    "udpPool": {{ "size": 2 }}
                }}
            }}"#
        ))
        .expect("config");
        let geosite = GeositeDb::parse(&[]).expect("empty geosite");
        let forwarder = Forwarder::new(config, geosite).await.expect("forwarder");

        let query = request().encode();
        let reply = forwarder.forward_udp(&query).await.expect("reply");
        let msg = Message::decode(&reply).expect("decode");
        assert_eq!(msg.id, 0x1234);
        assert!(msg.flags.qr);
        assert!(msg.flags.ra);
        assert_eq!(
            msg.questions[0].name.to_lowercase_string(),
            "www.example.com"
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_servfail() {
        let config = SmartDnsConfig::parse(
            r#"{
                "SmartDnsConfig": {
                    "dnsServers": [
                        { "name": "dead", "forwarderProtocol": "Udp",
                          "forwarderAddresses": ["127.0.0.1:1"] }
                    ],
                    "rules": [ { "domain": ["*"], "dnsServer": "dead" } ],
                    "udpPool": { "size": 1 }
                }
            }"#,
        )
        .expect("config");
        let geosite = GeositeDb::parse(&[]).expect("empty geosite");
        let forwarder = Forwarder::new(config, geosite).await.expect("forwarder");

        // Pre-install a client with a tiny retry budget to keep the test
        // quick; the cache hands it straight back.
        {
            let quick = UpstreamClient::new(
                forwarder.config.group("dead").unwrap(),
                None,
                forwarder.pool.clone(),
            )
            .unwrap()
            .with_attempt_policy(0, std::time::Duration::from_millis(50));
            let mut clients = forwarder.clients.lock().unwrap();
            clients.insert("dead".to_string(), Arc::new(quick));
        }

        let reply = forwarder.forward_udp(&request().encode()).await.expect("reply");
        let msg = Message::decode(&reply).expect("decode");
        assert_eq!(msg.flags.rcode, RCODE_SERVFAIL);
        assert_eq!(msg.id, 0x1234);
    }
}
