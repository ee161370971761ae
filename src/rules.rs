//! Ordered domain-routing rules: first matching rule picks the upstream
//! group.

use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::config::RuleConfig;
use crate::geosite::{domain_has_suffix, GeositeDb};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule for '{upstream}' has an invalid regex '{pattern}': {source}")]
    BadRegex {
        upstream: String,
        pattern: String,
        source: regex::Error,
    },
    #[error("rule for '{upstream}' has an empty pattern")]
    EmptyPattern { upstream: String },
}

/// No rule matched the queried domain.
#[derive(Debug, Error)]
#[error("no rule matched the queried domain")]
pub struct NoMatch;

#[derive(Debug)]
enum RulePattern {
    /// Geosite category code, lowercased.
    Geosite(String),
    Prefix(String),
    Suffix(String),
    Regex(Regex),
    /// `*`, the catch-all.
    Any,
}

struct Rule {
    patterns: Vec<RulePattern>,
    upstream: String,
}

pub struct RuleEngine {
    rules: Vec<Rule>,
    geosite: Arc<GeositeDb>,
}

impl RuleEngine {
    pub fn new(configs: &[RuleConfig], geosite: Arc<GeositeDb>) -> Result<Self, RuleError> {
        let mut rules = Vec::with_capacity(configs.len());
        for cfg in configs {
            let mut patterns = Vec::with_capacity(cfg.domain.len());
            for raw in &cfg.domain {
                patterns.push(parse_pattern(raw, &cfg.dns_server)?);
            }
            rules.push(Rule { patterns, upstream: cfg.dns_server.clone() });
        }
        Ok(RuleEngine { rules, geosite })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Pick the upstream group for a domain (lowercased, no trailing dot).
    ///
    /// Rules are tried in declaration order. Within a rule, literal
    /// patterns short-circuit left to right; `geosite:` codes are
    /// collected and evaluated together once the literals have all
    /// missed.
    pub fn pick_upstream(&self, domain: &str) -> Result<&str, NoMatch> {
        for rule in &self.rules {
            let mut codes: Vec<String> = Vec::new();
            let mut hit = false;
            for pattern in &rule.patterns {
                match pattern {
                    RulePattern::Geosite(code) => codes.push(code.clone()),
                    RulePattern::Prefix(p) => {
                        if domain.starts_with(p.as_str()) {
                            hit = true;
                            break;
                        }
                    }
                    RulePattern::Suffix(s) => {
                        if domain_has_suffix(domain, s) {
                            hit = true;
                            break;
                        }
                    }
                    RulePattern::Regex(re) => {
                        if re.is_match(domain) {
                            hit = true;
                            break;
                        }
                    }
                    RulePattern::Any => {
                        hit = true;
                        break;
                    }
                }
            }
            if !hit && !codes.is_empty() {
                hit = self.geosite.contains(domain, &codes);
            }
            if hit {
                return Ok(&rule.upstream);
            }
        }
        Err(NoMatch)
    }
}

fn parse_pattern(raw: &str, upstream: &str) -> Result<RulePattern, RuleError> {
    if raw == "*" {
        return Ok(RulePattern::Any);
    }
    if raw.is_empty() {
        return Err(RuleError::EmptyPattern { upstream: upstream.to_string() });
    }
    if let Some(code) = raw.strip_prefix("geosite:") {
        return Ok(RulePattern::Geosite(code.to_ascii_lowercase()));
    }
    if let Some(p) = raw.strip_prefix("prefix:") {
        return Ok(RulePattern::Prefix(p.to_ascii_lowercase()));
    }
    if let Some(s) = raw.strip_prefix("suffix:") {
        return Ok(RulePattern::Suffix(s.to_ascii_lowercase()));
    }
    if let Some(re) = raw.strip_prefix("regex:") {
        let re = Regex::new(re).map_err(|source| RuleError::BadRegex {
            upstream: upstream.to_string(),
            pattern: raw.to_string(),
            source,
        })?;
        return Ok(RulePattern::Regex(re));
    }
    // Bare patterns behave as suffixes, the common shorthand.
    Ok(RulePattern::Suffix(raw.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(patterns: &[&str], upstream: &str) -> RuleConfig {
        RuleConfig {
            domain: patterns.iter().map(|s| s.to_string()).collect(),
            dns_server: upstream.to_string(),
        }
    }

    fn geosite() -> Arc<GeositeDb> {
        // cn: root-domain "baidu.com"; google: root-domain "google.com".
        let mut blob = Vec::new();
        for (code, domain) in [("cn", "baidu.com"), ("google", "google.com")] {
            let mut d = Vec::new();
            d.extend_from_slice(&[0x08, 0x00]); // type = RootDomain
            d.push(0x12);
            d.push(domain.len() as u8);
            d.extend_from_slice(domain.as_bytes());
            let mut entry = Vec::new();
            entry.push(0x0A);
            entry.push(code.len() as u8);
            entry.extend_from_slice(code.as_bytes());
            entry.push(0x12);
            entry.push(d.len() as u8);
            entry.extend_from_slice(&d);
            blob.push(0x0A);
            blob.push(entry.len() as u8);
            blob.extend_from_slice(&entry);
        }
        Arc::new(GeositeDb::parse(&blob).expect("blob"))
    }

    fn engine(rules: &[RuleConfig]) -> RuleEngine {
        RuleEngine::new(rules, geosite()).expect("engine")
    }

    #[test]
    fn first_matching_rule_wins() {
        let engine = engine(&[
            rule(&["suffix:cn"], "alidns-doh"),
            rule(&["geosite:google"], "cloudflare-doh"),
            rule(&["suffix:io"], "cloudflare-doh"),
            rule(&["*"], "alidns-doh"),
        ]);
        assert_eq!(engine.pick_upstream("example.cn").unwrap(), "alidns-doh");
        assert_eq!(engine.pick_upstream("www.google.com").unwrap(), "cloudflare-doh");
        assert_eq!(engine.pick_upstream("some-random.io").unwrap(), "cloudflare-doh");
        assert_eq!(engine.pick_upstream("intranet.local").unwrap(), "alidns-doh");
    }

    #[test]
    fn suffix_requires_label_boundary() {
        let engine = engine(&[rule(&["suffix:cn"], "a"), rule(&["*"], "b")]);
        assert_eq!(engine.pick_upstream("cn").unwrap(), "a");
        assert_eq!(engine.pick_upstream("example.cn").unwrap(), "a");
        assert_eq!(engine.pick_upstream("unicorn").unwrap(), "b");
    }

    #[test]
    fn literal_short_circuits_before_geosite() {
        // The geosite store would also match, but the suffix literal is
        // scanned first and wins without a store lookup.
        let engine = engine(&[rule(&["geosite:cn", "suffix:baidu.com"], "direct")]);
        assert_eq!(engine.pick_upstream("www.baidu.com").unwrap(), "direct");
    }

    #[test]
    fn geosite_codes_collected_per_rule() {
        let engine = engine(&[
            rule(&["geosite:gfw", "geosite:google"], "proxied"),
            rule(&["*"], "direct"),
        ]);
        // 'gfw' is absent from the store; 'google' still matches.
        assert_eq!(engine.pick_upstream("mail.google.com").unwrap(), "proxied");
        assert_eq!(engine.pick_upstream("example.org").unwrap(), "direct");
    }

    #[test]
    fn geosite_only_rule_that_misses_falls_through() {
        let engine = engine(&[
            rule(&["geosite:google"], "proxied"),
            rule(&["suffix:org"], "direct"),
        ]);
        assert_eq!(engine.pick_upstream("example.org").unwrap(), "direct");
    }

    #[test]
    fn no_match_without_catch_all() {
        let engine = engine(&[rule(&["suffix:cn"], "a")]);
        assert!(engine.pick_upstream("example.org").is_err());
    }

    #[test]
    fn prefix_and_regex_patterns() {
        let engine = engine(&[
            rule(&["prefix:ads."], "sink"),
            rule(&["regex:^git(hub|lab)\\.com$"], "proxied"),
            rule(&["*"], "direct"),
        ]);
        assert_eq!(engine.pick_upstream("ads.example.com").unwrap(), "sink");
        assert_eq!(engine.pick_upstream("github.com").unwrap(), "proxied");
        assert_eq!(engine.pick_upstream("gitlab.com").unwrap(), "proxied");
        assert_eq!(engine.pick_upstream("example.com").unwrap(), "direct");
    }

    #[test]
    fn invalid_regex_is_a_startup_error() {
        let result = RuleEngine::new(&[rule(&["regex:["], "a")], geosite());
        assert!(matches!(result, Err(RuleError::BadRegex { .. })));
    }
}
