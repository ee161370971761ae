//! Geosite database: the v2ray `geosite.dat` domain-classification table.
//!
//! The file is a protobuf-wire, length-delimited list of categories, each
//! carrying an ordered list of domain patterns. It is parsed once at
//! startup into a map keyed by lowercased category code and never touched
//! again.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GeositeError {
    #[error("geosite blob truncated at offset {0}")]
    Truncated(usize),
    #[error("varint overflow at offset {0}")]
    BadVarint(usize),
    #[error("unsupported wire type {0}")]
    BadWireType(u8),
    #[error("category code is not valid UTF-8")]
    BadString,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Suffix match on a label boundary.
    RootDomain,
    Regex,
    /// Raw substring match.
    Plain,
    /// Exact match.
    Full,
}

#[derive(Debug)]
pub struct DomainPattern {
    pub kind: PatternKind,
    /// Lowercased at load; matching expects a lowercased domain.
    pub value: String,
    compiled: OnceCell<Option<Regex>>,
}

impl DomainPattern {
    fn new(kind: PatternKind, value: String) -> Self {
        let value = if kind == PatternKind::Regex {
            value
        } else {
            value.to_ascii_lowercase()
        };
        DomainPattern { kind, value, compiled: OnceCell::new() }
    }

    fn matches(&self, domain: &str) -> bool {
        match self.kind {
            PatternKind::Full => domain == self.value,
            PatternKind::RootDomain => domain_has_suffix(domain, &self.value),
            PatternKind::Plain => domain.contains(&self.value),
            PatternKind::Regex => {
                let re = self.compiled.get_or_init(|| match Regex::new(&self.value) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!("Unusable geosite regex '{}': {}", self.value, e);
                        None
                    }
                });
                re.as_ref().map(|re| re.is_match(domain)).unwrap_or(false)
            }
        }
    }
}

/// True when `domain` equals `suffix` or ends with `.suffix`.
pub fn domain_has_suffix(domain: &str, suffix: &str) -> bool {
    let suffix = suffix.trim_start_matches('.');
    match domain.len().checked_sub(suffix.len()) {
        None => false,
        Some(0) => domain == suffix,
        Some(cut) => {
            domain.as_bytes()[cut - 1] == b'.' && domain[cut..].eq_ignore_ascii_case(suffix)
        }
    }
}

pub struct GeositeDb {
    categories: HashMap<String, Vec<DomainPattern>>,
    // Missing categories are reported once, not per query.
    warned: Mutex<HashSet<String>>,
}

impl GeositeDb {
    pub fn load(path: &Path) -> Result<Self, GeositeError> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes)
    }

    /// Parse the length-delimited blob.
    ///
    /// Outer message: repeated field 1 = category entry. Entry: field 1 =
    /// country code, field 2 = repeated domain. Domain: field 1 = type
    /// varint, field 2 = value, field 3 = attributes (unused here).
    /// Anything else is skipped by wire type.
    pub fn parse(bytes: &[u8]) -> Result<Self, GeositeError> {
        let mut categories = HashMap::new();
        let mut r = PbReader { buf: bytes, pos: 0 };
        while !r.done() {
            let (field, wire) = r.key()?;
            if field == 1 && wire == 2 {
                let entry = r.bytes()?;
                if let Some((code, patterns)) = parse_entry(entry)? {
                    categories.insert(code, patterns);
                }
            } else {
                r.skip(wire)?;
            }
        }
        Ok(GeositeDb { categories, warned: Mutex::new(HashSet::new()) })
    }

    pub fn category_count(&self) -> usize {
        self.categories.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.categories.values().map(Vec::len).sum()
    }

    /// First-hit membership test across `codes`, in order.
    ///
    /// `domain` is expected lowercased without a trailing dot. A category
    /// absent from the loaded file contributes no matches and is logged
    /// once at WARN.
    pub fn contains(&self, domain: &str, codes: &[String]) -> bool {
        for code in codes {
            let code = code.to_ascii_lowercase();
            let Some(patterns) = self.categories.get(&code) else {
                let mut warned = self.warned.lock().unwrap();
                if warned.insert(code.clone()) {
                    warn!("Geosite category '{}' not present in the loaded database", code);
                }
                continue;
            };
            if patterns.iter().any(|p| p.matches(domain)) {
                return true;
            }
        }
        false
    }
}

fn parse_entry(bytes: &[u8]) -> Result<Option<(String, Vec<DomainPattern>)>, GeositeError> {
    let mut code = None;
    let mut patterns = Vec::new();
    let mut r = PbReader { buf: bytes, pos: 0 };
    while !r.done() {
        let (field, wire) = r.key()?;
        match (field, wire) {
            (1, 2) => {
                let raw = r.bytes()?;
                let s = std::str::from_utf8(raw).map_err(|_| GeositeError::BadString)?;
                code = Some(s.to_ascii_lowercase());
            }
            (2, 2) => {
                if let Some(p) = parse_domain(r.bytes()?)? {
                    patterns.push(p);
                }
            }
            (_, w) => r.skip(w)?,
        }
    }
    Ok(code.map(|c| (c, patterns)))
}

fn parse_domain(bytes: &[u8]) -> Result<Option<DomainPattern>, GeositeError> {
    let mut kind = 0u64;
    let mut value = None;
    let mut r = PbReader { buf: bytes, pos: 0 };
    while !r.done() {
        let (field, wire) = r.key()?;
        match (field, wire) {
            (1, 0) => kind = r.varint()?,
            (2, 2) => {
                let raw = r.bytes()?;
                let s = std::str::from_utf8(raw).map_err(|_| GeositeError::BadString)?;
                value = Some(s.to_string());
            }
            (_, w) => r.skip(w)?,
        }
    }
    let Some(value) = value else { return Ok(None) };
    let kind = match kind {
        0 => PatternKind::RootDomain,
        1 => PatternKind::Regex,
        2 => PatternKind::Plain,
        3 => PatternKind::Full,
        other => {
            debug!("Skipping geosite domain '{}' with unknown type {}", value, other);
            return Ok(None);
        }
    };
    Ok(Some(DomainPattern::new(kind, value)))
}

struct PbReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PbReader<'a> {
    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn varint(&mut self) -> Result<u64, GeositeError> {
        let start = self.pos;
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let b = *self
                .buf
                .get(self.pos)
                .ok_or(GeositeError::Truncated(self.pos))?;
            self.pos += 1;
            if shift >= 64 {
                return Err(GeositeError::BadVarint(start));
            }
            value |= ((b & 0x7F) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn key(&mut self) -> Result<(u32, u8), GeositeError> {
        let key = self.varint()?;
        Ok(((key >> 3) as u32, (key & 0x07) as u8))
    }

    fn bytes(&mut self) -> Result<&'a [u8], GeositeError> {
        let len = self.varint()? as usize;
        if self.pos + len > self.buf.len() {
            return Err(GeositeError::Truncated(self.buf.len()));
        }
        let s = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(s)
    }

    fn skip(&mut self, wire: u8) -> Result<(), GeositeError> {
        match wire {
            0 => {
                self.varint()?;
            }
            1 => {
                if self.pos + 8 > self.buf.len() {
                    return Err(GeositeError::Truncated(self.buf.len()));
                }
                self.pos += 8;
            }
            2 => {
                self.bytes()?;
            }
            5 => {
                if self.pos + 4 > self.buf.len() {
                    return Err(GeositeError::Truncated(self.buf.len()));
                }
                self.pos += 4;
            }
            other => return Err(GeositeError::BadWireType(other)),
        }
        Ok(())
    }
}
