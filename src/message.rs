//! DNS wire format: RFC 1035 messages with EDNS(0) pass-through.
//!
//! Decoding keeps unknown record types as opaque RDATA so a forwarded
//! response can be re-emitted unchanged. Names embedded in the RDATA of
//! the classic types (NS, CNAME, PTR, MX, SOA, SRV) are expanded during
//! decode, so encoding never has to chase compression pointers into a
//! buffer that no longer exists.

use std::fmt;

use thiserror::Error;

pub const HEADER_LEN: usize = 12;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 10;

pub const TYPE_OPT: u16 = 41;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_FORMERR: u8 = 1;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_REFUSED: u8 = 5;

/// Smallest payload a DNS/UDP peer must accept without EDNS.
pub const MIN_UDP_PAYLOAD: u16 = 512;
/// Upper bound we place on advertised EDNS payload sizes.
pub const MAX_UDP_PAYLOAD: u16 = 4096;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("message truncated at offset {0}")]
    Truncated(usize),
    #[error("reserved label type {0:#04x}")]
    BadLabel(u8),
    #[error("name exceeds 255 octets")]
    NameTooLong,
    #[error("label exceeds 63 octets")]
    LabelTooLong,
    #[error("bad compression pointer at offset {0}")]
    BadPointer(usize),
    #[error("malformed OPT record")]
    BadOpt,
}

/// A domain name as an ordered sequence of raw labels.
///
/// Labels keep the octets they arrived with; comparisons are
/// ASCII-case-insensitive per RFC 1035.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Name {
    labels: Vec<Vec<u8>>,
}

impl Name {
    pub fn root() -> Self {
        Name { labels: Vec::new() }
    }

    /// Build a name from dotted presentation form ("www.example.com").
    pub fn from_dotted(s: &str) -> Result<Self, ParseError> {
        let s = s.trim_end_matches('.');
        if s.is_empty() {
            return Ok(Name::root());
        }
        let mut labels = Vec::new();
        let mut total = 1usize;
        for label in s.split('.') {
            if label.len() > 63 {
                return Err(ParseError::LabelTooLong);
            }
            total += 1 + label.len();
            if total > MAX_NAME_LEN {
                return Err(ParseError::NameTooLong);
            }
            labels.push(label.as_bytes().to_vec());
        }
        Ok(Name { labels })
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn eq_ignore_case(&self, other: &Name) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(&other.labels)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// Lowercased dotted form without the trailing dot, as used by the
    /// rule engine and the geosite store.
    pub fn to_lowercase_string(&self) -> String {
        let mut out = String::new();
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                out.push('.');
            }
            for &b in label {
                out.push(b.to_ascii_lowercase() as char);
            }
        }
        out
    }

    fn write(&self, out: &mut Vec<u8>) {
        for label in &self.labels {
            out.push(label.len() as u8);
            out.extend_from_slice(label);
        }
        out.push(0);
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(&String::from_utf8_lossy(label))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub qr: bool,
    pub opcode: u8,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub z: bool,
    pub ad: bool,
    pub cd: bool,
    /// Low four bits only; see [`Message::rcode`] for the extended value.
    pub rcode: u8,
}

impl Flags {
    fn from_wire(hi: u8, lo: u8) -> Flags {
        Flags {
            qr: hi & 0x80 != 0,
            opcode: (hi >> 3) & 0x0F,
            aa: hi & 0x04 != 0,
            tc: hi & 0x02 != 0,
            rd: hi & 0x01 != 0,
            ra: lo & 0x80 != 0,
            z: lo & 0x40 != 0,
            ad: lo & 0x20 != 0,
            cd: lo & 0x10 != 0,
            rcode: lo & 0x0F,
        }
    }

    fn to_wire(self) -> [u8; 2] {
        let mut hi = 0u8;
        if self.qr {
            hi |= 0x80;
        }
        hi |= (self.opcode & 0x0F) << 3;
        if self.aa {
            hi |= 0x04;
        }
        if self.tc {
            hi |= 0x02;
        }
        if self.rd {
            hi |= 0x01;
        }
        let mut lo = self.rcode & 0x0F;
        if self.ra {
            lo |= 0x80;
        }
        if self.z {
            lo |= 0x40;
        }
        if self.ad {
            lo |= 0x20;
        }
        if self.cd {
            lo |= 0x10;
        }
        [hi, lo]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: Name,
    pub qtype: u16,
    pub qclass: u16,
}

/// A resource record with RDATA held as raw octets.
///
/// For the name-bearing classic types the RDATA is stored with its names
/// already expanded to uncompressed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: Name,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdnsOption {
    pub code: u16,
    pub data: Vec<u8>,
}

/// EDNS(0) metadata carried by the OPT pseudo-record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edns {
    pub payload_size: u16,
    /// High eight bits of the extended RCODE.
    pub ext_rcode: u8,
    pub version: u8,
    pub dnssec_ok: bool,
    /// The 15 flag bits below DO, preserved verbatim.
    pub z: u16,
    pub options: Vec<EdnsOption>,
}

impl Default for Edns {
    fn default() -> Self {
        Edns {
            payload_size: 1232,
            ext_rcode: 0,
            version: 0,
            dnssec_ok: false,
            z: 0,
            options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub flags: Flags,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
    pub edns: Option<Edns>,
}

impl Message {
    /// Extended RCODE: OPT TTL top byte shifted over the header's low nibble.
    pub fn rcode(&self) -> u16 {
        let ext = self.edns.as_ref().map(|e| e.ext_rcode).unwrap_or(0);
        ((ext as u16) << 4) | self.flags.rcode as u16
    }

    pub fn decode(buf: &[u8]) -> Result<Message, ParseError> {
        let mut r = Reader { buf, pos: 0 };
        if buf.len() < HEADER_LEN {
            return Err(ParseError::Truncated(buf.len()));
        }
        let id = r.u16()?;
        let hi = r.u8()?;
        let lo = r.u8()?;
        let flags = Flags::from_wire(hi, lo);
        let qdcount = r.u16()?;
        let ancount = r.u16()?;
        let nscount = r.u16()?;
        let arcount = r.u16()?;

        let mut questions = Vec::with_capacity(qdcount as usize);
        for _ in 0..qdcount {
            let name = r.read_name()?;
            let qtype = r.u16()?;
            let qclass = r.u16()?;
            questions.push(Question { name, qtype, qclass });
        }

        let answers = r.read_records(ancount)?;
        let authorities = r.read_records(nscount)?;

        let mut additionals = Vec::with_capacity(arcount as usize);
        let mut edns = None;
        for _ in 0..arcount {
            let name = r.read_name()?;
            let rtype = r.u16()?;
            let class = r.u16()?;
            let ttl = r.u32()?;
            let rdlen = r.u16()? as usize;
            let rdata_start = r.pos;
            if rtype == TYPE_OPT {
                if edns.is_some() || !name.is_root() {
                    return Err(ParseError::BadOpt);
                }
                let rdata = r.take(rdlen)?;
                edns = Some(parse_opt(class, ttl, rdata)?);
            } else {
                let rdata = r.read_rdata(rtype, rdata_start, rdlen)?;
                additionals.push(Record { name, rtype, class, ttl, rdata });
            }
        }

        Ok(Message { id, flags, questions, answers, authorities, additionals, edns })
    }

    /// Serialize without name compression.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_size_hint());
        self.write_header(&mut out, self.flags, self.all_counts());
        for q in &self.questions {
            q.name.write(&mut out);
            out.extend_from_slice(&q.qtype.to_be_bytes());
            out.extend_from_slice(&q.qclass.to_be_bytes());
        }
        for rr in self.answers.iter().chain(&self.authorities).chain(&self.additionals) {
            write_record(&mut out, rr);
        }
        if let Some(edns) = &self.edns {
            write_opt(&mut out, edns);
        }
        out
    }

    /// Serialize for a UDP delivery limited to `max` octets.
    ///
    /// Oversize messages are cut after the question section with TC set,
    /// which tells the client to come back over TCP.
    pub fn encode_for_udp(&self, max: usize) -> Vec<u8> {
        let full = self.encode();
        if full.len() <= max {
            return full;
        }
        let mut flags = self.flags;
        flags.tc = true;
        let mut out = Vec::with_capacity(HEADER_LEN + 64);
        self.write_header(
            &mut out,
            flags,
            [self.questions.len() as u16, 0, 0, 0],
        );
        for q in &self.questions {
            q.name.write(&mut out);
            out.extend_from_slice(&q.qtype.to_be_bytes());
            out.extend_from_slice(&q.qclass.to_be_bytes());
        }
        out
    }

    /// Payload limit a peer advertised for UDP replies to this message.
    pub fn udp_payload_limit(&self) -> usize {
        match &self.edns {
            Some(e) => e.payload_size.clamp(MIN_UDP_PAYLOAD, MAX_UDP_PAYLOAD) as usize,
            None => MIN_UDP_PAYLOAD as usize,
        }
    }

    fn all_counts(&self) -> [u16; 4] {
        let extra = self.edns.is_some() as u16;
        [
            self.questions.len() as u16,
            self.answers.len() as u16,
            self.authorities.len() as u16,
            self.additionals.len() as u16 + extra,
        ]
    }

    fn write_header(&self, out: &mut Vec<u8>, flags: Flags, counts: [u16; 4]) {
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&flags.to_wire());
        for c in counts {
            out.extend_from_slice(&c.to_be_bytes());
        }
    }

    fn wire_size_hint(&self) -> usize {
        let rrs = self.answers.len() + self.authorities.len() + self.additionals.len();
        HEADER_LEN + self.questions.len() * 32 + rrs * 48 + 16
    }
}

fn write_record(out: &mut Vec<u8>, rr: &Record) {
    rr.name.write(out);
    out.extend_from_slice(&rr.rtype.to_be_bytes());
    out.extend_from_slice(&rr.class.to_be_bytes());
    out.extend_from_slice(&rr.ttl.to_be_bytes());
    out.extend_from_slice(&(rr.rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(&rr.rdata);
}

fn write_opt(out: &mut Vec<u8>, edns: &Edns) {
    out.push(0); // root name
    out.extend_from_slice(&TYPE_OPT.to_be_bytes());
    out.extend_from_slice(&edns.payload_size.to_be_bytes());
    let mut flags = edns.z & 0x7FFF;
    if edns.dnssec_ok {
        flags |= 0x8000;
    }
    let ttl =
        ((edns.ext_rcode as u32) << 24) | ((edns.version as u32) << 16) | flags as u32;
    out.extend_from_slice(&ttl.to_be_bytes());
    let rdlen: usize = edns.options.iter().map(|o| 4 + o.data.len()).sum();
    out.extend_from_slice(&(rdlen as u16).to_be_bytes());
    for opt in &edns.options {
        out.extend_from_slice(&opt.code.to_be_bytes());
        out.extend_from_slice(&(opt.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&opt.data);
    }
}

fn parse_opt(class: u16, ttl: u32, rdata: &[u8]) -> Result<Edns, ParseError> {
    let mut options = Vec::new();
    let mut pos = 0usize;
    while pos < rdata.len() {
        if pos + 4 > rdata.len() {
            return Err(ParseError::BadOpt);
        }
        let code = u16::from_be_bytes([rdata[pos], rdata[pos + 1]]);
        let len = u16::from_be_bytes([rdata[pos + 2], rdata[pos + 3]]) as usize;
        pos += 4;
        if pos + len > rdata.len() {
            return Err(ParseError::BadOpt);
        }
        options.push(EdnsOption { code, data: rdata[pos..pos + len].to_vec() });
        pos += len;
    }
    Ok(Edns {
        payload_size: class,
        ext_rcode: (ttl >> 24) as u8,
        version: (ttl >> 16) as u8,
        dnssec_ok: ttl & 0x8000 != 0,
        z: (ttl & 0x7FFF) as u16,
        options,
    })
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, ParseError> {
        let b = *self.buf.get(self.pos).ok_or(ParseError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        Ok(u32::from_be_bytes([self.u8()?, self.u8()?, self.u8()?, self.u8()?]))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.pos + n > self.buf.len() {
            return Err(ParseError::Truncated(self.buf.len()));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Read a possibly compressed name starting at the cursor.
    ///
    /// Pointer targets must precede the pointer itself and chains are
    /// bounded at [`MAX_POINTER_HOPS`] hops.
    fn read_name(&mut self) -> Result<Name, ParseError> {
        let (name, end) = read_name_at(self.buf, self.pos)?;
        self.pos = end;
        Ok(name)
    }

    fn read_records(&mut self, count: u16) -> Result<Vec<Record>, ParseError> {
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = self.read_name()?;
            let rtype = self.u16()?;
            let class = self.u16()?;
            let ttl = self.u32()?;
            let rdlen = self.u16()? as usize;
            let rdata_start = self.pos;
            let rdata = self.read_rdata(rtype, rdata_start, rdlen)?;
            records.push(Record { name, rtype, class, ttl, rdata });
        }
        Ok(records)
    }

    /// Read RDATA, expanding embedded names for the types that carry them.
    fn read_rdata(&mut self, rtype: u16, start: usize, rdlen: usize) -> Result<Vec<u8>, ParseError> {
        const TYPE_NS: u16 = 2;
        const TYPE_CNAME: u16 = 5;
        const TYPE_SOA: u16 = 6;
        const TYPE_PTR: u16 = 12;
        const TYPE_MX: u16 = 15;
        const TYPE_SRV: u16 = 33;

        let raw = self.take(rdlen)?;
        let end = start + rdlen;
        let mut out = Vec::with_capacity(rdlen);
        match rtype {
            TYPE_NS | TYPE_CNAME | TYPE_PTR => {
                let (name, used) = read_name_at(self.buf, start)?;
                if used > end {
                    return Err(ParseError::Truncated(end));
                }
                name.write(&mut out);
            }
            TYPE_MX => {
                if rdlen < 2 {
                    return Err(ParseError::Truncated(end));
                }
                out.extend_from_slice(&raw[..2]);
                let (name, used) = read_name_at(self.buf, start + 2)?;
                if used > end {
                    return Err(ParseError::Truncated(end));
                }
                name.write(&mut out);
            }
            TYPE_SOA => {
                let (mname, after_m) = read_name_at(self.buf, start)?;
                let (rname, after_r) = read_name_at(self.buf, after_m)?;
                if after_r + 20 > end {
                    return Err(ParseError::Truncated(end));
                }
                mname.write(&mut out);
                rname.write(&mut out);
                out.extend_from_slice(&self.buf[after_r..after_r + 20]);
            }
            TYPE_SRV => {
                if rdlen < 6 {
                    return Err(ParseError::Truncated(end));
                }
                out.extend_from_slice(&raw[..6]);
                let (name, used) = read_name_at(self.buf, start + 6)?;
                if used > end {
                    return Err(ParseError::Truncated(end));
                }
                name.write(&mut out);
            }
            _ => out.extend_from_slice(raw),
        }
        Ok(out)
    }
}

fn read_name_at(buf: &[u8], start: usize) -> Result<(Name, usize), ParseError> {
    let mut labels = Vec::new();
    let mut total = 1usize;
    let mut pos = start;
    let mut end = None;
    let mut hops = 0usize;
    loop {
        let len = *buf.get(pos).ok_or(ParseError::Truncated(pos))?;
        match len {
            0 => {
                if end.is_none() {
                    end = Some(pos + 1);
                }
                break;
            }
            l if l & 0xC0 == 0xC0 => {
                let b2 = *buf.get(pos + 1).ok_or(ParseError::Truncated(pos + 1))? as usize;
                let target = (((l & 0x3F) as usize) << 8) | b2;
                if end.is_none() {
                    end = Some(pos + 2);
                }
                // No forward references, no unbounded chains.
                if target >= pos {
                    return Err(ParseError::BadPointer(pos));
                }
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(ParseError::BadPointer(pos));
                }
                pos = target;
            }
            l if l & 0xC0 != 0 => return Err(ParseError::BadLabel(l)),
            l => {
                let l = l as usize;
                if pos + 1 + l > buf.len() {
                    return Err(ParseError::Truncated(buf.len()));
                }
                total += 1 + l;
                if total > MAX_NAME_LEN {
                    return Err(ParseError::NameTooLong);
                }
                labels.push(buf[pos + 1..pos + 1 + l].to_vec());
                pos += 1 + l;
            }
        }
    }
    Ok((Name { labels }, end.unwrap_or(pos + 1)))
}
