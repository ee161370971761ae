//! Minimal SOCKS5 client (RFC 1928): CONNECT and UDP ASSOCIATE with
//! NO-AUTH or USERNAME/PASSWORD negotiation.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::ProxyServer;

const VER: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

#[derive(Debug, Clone)]
pub struct Socks5Config {
    pub address: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl From<&ProxyServer> for Socks5Config {
    fn from(p: &ProxyServer) -> Self {
        Socks5Config {
            address: p.proxy_address.clone(),
            port: p.proxy_port,
            username: p.proxy_username.clone(),
            password: p.proxy_password.clone(),
        }
    }
}

impl Socks5Config {
    fn has_credentials(&self) -> bool {
        self.username.is_some()
    }
}

/// Open a TCP stream to `host:port` through the proxy.
pub async fn connect_via_socks5(
    proxy: &Socks5Config,
    host: &str,
    port: u16,
) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect((proxy.address.as_str(), proxy.port)).await?;
    handshake(&mut stream, proxy).await?;
    request(&mut stream, CMD_CONNECT, host, port).await?;
    Ok(stream)
}

/// A UDP relay granted by the proxy. Dropping `control` ends the
/// association, so it must stay alive for as long as datagrams flow.
pub struct UdpAssociation {
    #[allow(dead_code)]
    control: TcpStream,
    pub relay: SocketAddr,
}

/// Negotiate UDP ASSOCIATE and return the relay endpoint.
pub async fn udp_associate(proxy: &Socks5Config) -> io::Result<UdpAssociation> {
    let mut stream = TcpStream::connect((proxy.address.as_str(), proxy.port)).await?;
    handshake(&mut stream, proxy).await?;
    let bound = request(&mut stream, CMD_UDP_ASSOCIATE, "0.0.0.0", 0).await?;
    let mut relay = bound;
    // Some proxies answer with an unspecified address; the relay then
    // lives on the proxy host itself.
    if relay.ip().is_unspecified() {
        relay.set_ip(stream.peer_addr()?.ip());
    }
    Ok(UdpAssociation { control: stream, relay })
}

async fn handshake(stream: &mut TcpStream, proxy: &Socks5Config) -> io::Result<()> {
    let methods: &[u8] = if proxy.has_credentials() {
        &[METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[METHOD_NO_AUTH]
    };
    let mut greeting = vec![VER, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VER {
        return Err(proto_err("bad SOCKS version in method reply"));
    }
    match reply[1] {
        METHOD_NO_AUTH => Ok(()),
        METHOD_USER_PASS if proxy.has_credentials() => authenticate(stream, proxy).await,
        METHOD_UNACCEPTABLE => Err(proto_err("proxy accepted none of our auth methods")),
        _ => Err(proto_err("proxy selected an unsupported auth method")),
    }
}

async fn authenticate(stream: &mut TcpStream, proxy: &Socks5Config) -> io::Result<()> {
    let user = proxy.username.as_deref().unwrap_or("");
    let pass = proxy.password.as_deref().unwrap_or("");
    if user.len() > 255 || pass.len() > 255 {
        return Err(proto_err("SOCKS credentials exceed 255 octets"));
    }
    let mut req = vec![0x01, user.len() as u8];
    req.extend_from_slice(user.as_bytes());
    req.push(pass.len() as u8);
    req.extend_from_slice(pass.as_bytes());
    stream.write_all(&req).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "SOCKS username/password rejected",
        ));
    }
    Ok(())
}

async fn request(
    stream: &mut TcpStream,
    cmd: u8,
    host: &str,
    port: u16,
) -> io::Result<SocketAddr> {
    let mut req = vec![VER, cmd, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            req.push(ATYP_V4);
            req.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            req.push(ATYP_V6);
            req.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(proto_err("target hostname exceeds 255 octets"));
            }
            req.push(ATYP_DOMAIN);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
        }
    }
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VER {
        return Err(proto_err("bad SOCKS version in reply"));
    }
    if head[1] != 0x00 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("SOCKS request failed with code {:#04x}", head[1]),
        ));
    }
    let ip = match head[3] {
        ATYP_V4 => {
            let mut b = [0u8; 4];
            stream.read_exact(&mut b).await?;
            IpAddr::from(b)
        }
        ATYP_V6 => {
            let mut b = [0u8; 16];
            stream.read_exact(&mut b).await?;
            IpAddr::from(b)
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            // Bound addresses are IPs in practice; a domain reply still
            // needs the port consumed below, the address is unusable.
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
        other => return Err(proto_err(&format!("bad ATYP {other:#04x} in reply"))),
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(SocketAddr::new(ip, u16::from_be_bytes(port)))
}

/// Wrap a DNS datagram in the SOCKS5 UDP request header (RSV RSV FRAG
/// ATYP DST.ADDR DST.PORT DATA).
pub fn encode_udp_datagram(host: &str, port: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            out.push(ATYP_V4);
            out.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            out.push(ATYP_V6);
            out.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            out.push(ATYP_DOMAIN);
            out.push(host.len().min(255) as u8);
            out.extend_from_slice(&host.as_bytes()[..host.len().min(255)]);
        }
    }
    out.extend_from_slice(&port.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Strip the SOCKS5 UDP header from a relayed datagram. Fragmented
/// datagrams (FRAG != 0) are not supported and are dropped.
pub fn decode_udp_datagram(buf: &[u8]) -> Option<&[u8]> {
    if buf.len() < 4 || buf[2] != 0x00 {
        return None;
    }
    let addr_len = match buf[3] {
        ATYP_V4 => 4,
        ATYP_V6 => 16,
        ATYP_DOMAIN => 1 + *buf.get(4)? as usize,
        _ => return None,
    };
    let start = 4 + addr_len + 2;
    buf.get(start..)
}

fn proto_err(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_datagram_round_trip() {
        let wrapped = encode_udp_datagram("8.8.8.8", 53, b"payload");
        assert_eq!(&wrapped[..4], &[0x00, 0x00, 0x00, ATYP_V4]);
        assert_eq!(decode_udp_datagram(&wrapped), Some(&b"payload"[..]));
    }

    #[test]
    fn udp_datagram_domain_target() {
        let wrapped = encode_udp_datagram("dns.google", 53, b"x");
        assert_eq!(wrapped[3], ATYP_DOMAIN);
        assert_eq!(wrapped[4], 10);
        assert_eq!(decode_udp_datagram(&wrapped), Some(&b"x"[..]));
    }

    #[test]
    fn fragmented_udp_datagram_dropped() {
        let mut wrapped = encode_udp_datagram("8.8.8.8", 53, b"x");
        wrapped[2] = 0x01;
        assert_eq!(decode_udp_datagram(&wrapped), None);
    }

    #[test]
    fn short_udp_datagram_dropped() {
        assert_eq!(decode_udp_datagram(&[0, 0, 0]), None);
    }
}
