//! Configuration: the `SmartDnsConfig` JSON document.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    #[serde(rename = "SmartDnsConfig")]
    pub smart_dns: SmartDnsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartDnsConfig {
    #[serde(default)]
    pub proxy_servers: Vec<ProxyServer>,
    pub dns_servers: Vec<UpstreamGroup>,
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub udp_pool: UdpPoolConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyServer {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub proxy_address: String,
    pub proxy_port: u16,
    #[serde(default)]
    pub proxy_username: Option<String>,
    #[serde(default)]
    pub proxy_password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Protocol {
    Udp,
    Tcp,
    Tls,
    Https,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Udp | Protocol::Tcp => 53,
            Protocol::Tls => 853,
            Protocol::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
            Protocol::Https => "https",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamGroup {
    pub name: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub dnssec_validation: bool,
    pub forwarder_protocol: Protocol,
    pub forwarder_addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl UpstreamGroup {
    /// Endpoints as host/port pairs, defaulting the port by transport.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.forwarder_addresses
            .iter()
            .map(|addr| split_host_port(addr, self.forwarder_protocol.default_port()))
            .collect()
    }
}

/// Split "host[:port]", leaving IPv6 literals and bracket forms intact.
fn split_host_port(addr: &str, default_port: u16) -> Endpoint {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        // "[v6]" or "[v6]:port"
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return Endpoint { host: host.to_string(), port };
        }
    }
    if let Some((host, port)) = addr.rsplit_once(':') {
        // A second colon means a bare IPv6 literal, not host:port.
        if !host.contains(':') {
            if let Ok(port) = port.parse() {
                return Endpoint { host: host.to_string(), port };
            }
        }
    }
    Endpoint { host: addr.to_string(), port: default_port }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    pub domain: Vec<String>,
    pub dns_server: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdpPoolConfig {
    #[serde(default = "default_pool_size")]
    pub size: usize,
    #[serde(default)]
    pub excluded_ports: Vec<u16>,
}

impl Default for UdpPoolConfig {
    fn default() -> Self {
        UdpPoolConfig { size: default_pool_size(), excluded_ports: Vec::new() }
    }
}

fn default_pool_size() -> usize {
    2500
}

impl SmartDnsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: ConfigFile =
            serde_json::from_str(content).context("Failed to parse configuration JSON")?;
        file.smart_dns.validate()?;
        Ok(file.smart_dns)
    }

    pub fn group(&self, name: &str) -> Option<&UpstreamGroup> {
        self.dns_servers.iter().find(|g| g.name == name)
    }

    pub fn proxy(&self, name: &str) -> Option<&ProxyServer> {
        self.proxy_servers.iter().find(|p| p.name == name)
    }

    fn validate(&self) -> Result<()> {
        if self.dns_servers.is_empty() {
            bail!("Configuration declares no dnsServers");
        }
        let mut seen = HashSet::new();
        for group in &self.dns_servers {
            if !seen.insert(group.name.as_str()) {
                bail!("Duplicate dnsServer name '{}'", group.name);
            }
            if group.forwarder_addresses.is_empty() {
                bail!("dnsServer '{}' has no forwarderAddresses", group.name);
            }
            if let Some(proxy) = &group.proxy {
                let record = self
                    .proxy(proxy)
                    .with_context(|| {
                        format!("dnsServer '{}' references unknown proxy '{}'", group.name, proxy)
                    })?;
                if !record.kind.eq_ignore_ascii_case("socks5") {
                    bail!(
                        "Proxy '{}' has unsupported type '{}' (only socks5)",
                        record.name,
                        record.kind
                    );
                }
            }
        }
        for rule in &self.rules {
            if self.group(&rule.dns_server).is_none() {
                bail!("Rule references unknown dnsServer '{}'", rule.dns_server);
            }
            if rule.domain.is_empty() {
                bail!("Rule for '{}' has an empty domain list", rule.dns_server);
            }
        }
        Ok(())
    }
}

/// Resolve a configuration-adjacent file relative to the executable, the
/// way the deployment layout ships `appsettings.json` and `geosite.dat`
/// next to the binary. Absolute paths and files present in the working
/// directory win.
pub fn resolve_data_path(name: &str) -> PathBuf {
    let given = PathBuf::from(name);
    if given.is_absolute() || given.exists() {
        return given;
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let beside = dir.join(name);
            if beside.exists() {
                return beside;
            }
        }
    }
    given
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "SmartDnsConfig": {
            "proxyServers": [
                { "name": "local-socks", "type": "socks5",
                  "proxyAddress": "127.0.0.1", "proxyPort": 1080,
                  "proxyUsername": "u", "proxyPassword": "p" }
            ],
            "dnsServers": [
                { "name": "alidns-doh", "dnssecValidation": false,
                  "forwarderProtocol": "Https",
                  "forwarderAddresses": ["223.5.5.5", "223.6.6.6"] },
                { "name": "cloudflare-doh", "proxy": "local-socks",
                  "dnssecValidation": true,
                  "forwarderProtocol": "Https",
                  "forwarderAddresses": ["1.1.1.1"] },
                { "name": "plain-udp",
                  "forwarderProtocol": "Udp",
                  "forwarderAddresses": ["114.114.114.114:5353"] }
            ],
            "rules": [
                { "domain": ["suffix:cn", "geosite:cn"], "dnsServer": "alidns-doh" },
                { "domain": ["geosite:google"], "dnsServer": "cloudflare-doh" },
                { "domain": ["*"], "dnsServer": "alidns-doh" }
            ]
        }
    }"#;

    #[test]
    fn parses_sample_config() {
        let cfg = SmartDnsConfig::parse(SAMPLE).expect("parse");
        assert_eq!(cfg.dns_servers.len(), 3);
        assert_eq!(cfg.rules.len(), 3);
        let cf = cfg.group("cloudflare-doh").expect("group");
        assert_eq!(cf.forwarder_protocol, Protocol::Https);
        assert!(cf.dnssec_validation);
        assert_eq!(cf.proxy.as_deref(), Some("local-socks"));
        let proxy = cfg.proxy("local-socks").expect("proxy");
        assert_eq!(proxy.proxy_port, 1080);
        assert_eq!(proxy.proxy_username.as_deref(), Some("u"));
    }

    #[test]
    fn endpoint_port_defaults_by_protocol() {
        let cfg = SmartDnsConfig::parse(SAMPLE).expect("parse");
        let doh = cfg.group("alidns-doh").unwrap().endpoints();
        assert_eq!(doh[0], Endpoint { host: "223.5.5.5".into(), port: 443 });
        let udp = cfg.group("plain-udp").unwrap().endpoints();
        assert_eq!(udp[0], Endpoint { host: "114.114.114.114".into(), port: 5353 });
    }

    #[test]
    fn host_port_splitting() {
        assert_eq!(
            split_host_port("8.8.8.8:53", 443),
            Endpoint { host: "8.8.8.8".into(), port: 53 }
        );
        assert_eq!(
            split_host_port("dns.google", 443),
            Endpoint { host: "dns.google".into(), port: 443 }
        );
        assert_eq!(
            split_host_port("2606:4700:4700::1111", 853),
            Endpoint { host: "2606:4700:4700::1111".into(), port: 853 }
        );
        assert_eq!(
            split_host_port("[2606:4700:4700::1111]:5353", 853),
            Endpoint { host: "2606:4700:4700::1111".into(), port: 5353 }
        );
    }

    #[test]
    fn unknown_rule_target_rejected() {
        let bad = SAMPLE.replace("\"dnsServer\": \"alidns-doh\"", "\"dnsServer\": \"nope\"");
        assert!(SmartDnsConfig::parse(&bad).is_err());
    }

    #[test]
    fn unknown_proxy_rejected() {
        let bad = SAMPLE.replace("\"proxy\": \"local-socks\"", "\"proxy\": \"ghost\"");
        assert!(SmartDnsConfig::parse(&bad).is_err());
    }
}
