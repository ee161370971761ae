//! TCP and TLS transports: RFC 1035 §4.2.2 length-prefixed framing with
//! idle-connection reuse per endpoint.

use std::io;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::Endpoint;

use super::socks5::{connect_via_socks5, Socks5Config};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_IDLE_CONNS: usize = 8;
const IDLE_EXPIRE: Duration = Duration::from_secs(10);
const MAX_RESPONSE_LEN: usize = 65535;

enum DnsStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

struct IdleConnection {
    stream: DnsStream,
    expires_at: Instant,
}

/// One TCP or TLS upstream endpoint with a small idle-connection pool.
pub struct StreamTransport {
    endpoint: Endpoint,
    tls: Option<TlsConnector>,
    proxy: Option<Socks5Config>,
    idle: AsyncMutex<Vec<IdleConnection>>,
}

impl StreamTransport {
    pub fn new(
        endpoint: Endpoint,
        tls: Option<TlsConnector>,
        proxy: Option<Socks5Config>,
    ) -> Self {
        StreamTransport { endpoint, tls, proxy, idle: AsyncMutex::new(Vec::new()) }
    }

    /// One framed query/response exchange, reusing an idle connection
    /// when one is still fresh.
    pub async fn exchange(&self, query: &[u8]) -> io::Result<Vec<u8>> {
        let mut stream = match self.take_idle().await {
            Some(stream) => {
                debug!("Reusing idle connection to {}", self.endpoint);
                stream
            }
            None => self.connect().await?,
        };

        let result = exchange_framed(&mut stream, query).await;
        match result {
            Ok(response) => {
                self.put_idle(stream).await;
                Ok(response)
            }
            // A dead pooled connection is not retried here; the caller's
            // retry policy covers it and the next exchange reconnects.
            Err(e) => Err(e),
        }
    }

    async fn connect(&self) -> io::Result<DnsStream> {
        debug!("Connecting to {} ({})", self.endpoint, if self.tls.is_some() { "tls" } else { "tcp" });
        let tcp = match &self.proxy {
            Some(proxy) => {
                connect_via_socks5(proxy, &self.endpoint.host, self.endpoint.port).await?
            }
            None => {
                tokio::time::timeout(
                    CONNECT_TIMEOUT,
                    TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)),
                )
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??
            }
        };

        match &self.tls {
            None => Ok(DnsStream::Tcp(tcp)),
            Some(connector) => {
                let server_name = ServerName::try_from(self.endpoint.host.as_str())
                    .map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidInput, "invalid TLS server name")
                    })?;
                let tls = connector.connect(server_name, tcp).await?;
                Ok(DnsStream::Tls(Box::new(tls)))
            }
        }
    }

    async fn take_idle(&self) -> Option<DnsStream> {
        let now = Instant::now();
        let mut idle = self.idle.lock().await;
        while let Some(conn) = idle.pop() {
            if conn.expires_at > now {
                return Some(conn.stream);
            }
        }
        None
    }

    async fn put_idle(&self, stream: DnsStream) {
        let mut idle = self.idle.lock().await;
        if idle.len() < MAX_IDLE_CONNS {
            idle.push(IdleConnection { stream, expires_at: Instant::now() + IDLE_EXPIRE });
        }
    }
}

async fn exchange_framed(stream: &mut DnsStream, query: &[u8]) -> io::Result<Vec<u8>> {
    match stream {
        DnsStream::Tcp(s) => framed_round_trip(s, query).await,
        DnsStream::Tls(s) => framed_round_trip(s.as_mut(), query).await,
    }
}

async fn framed_round_trip<S>(stream: &mut S, query: &[u8]) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(query);
    stream.write_all(&framed).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_RESPONSE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad response frame length {len}"),
        ));
    }
    let mut response = vec![0u8; len];
    stream.read_exact(&mut response).await?;
    Ok(response)
}
