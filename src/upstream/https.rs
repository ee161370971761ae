//! DNS-over-HTTPS transport (RFC 8484): POST the raw message to
//! `https://<host>/dns-query`.

use std::time::Duration;

use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};

use crate::config::Endpoint;

use super::socks5::Socks5Config;
use super::ResolveError;

pub const DNS_CONTENT_TYPE: &str = "application/dns-message";

pub struct HttpsTransport {
    url: String,
    client: reqwest::Client,
}

impl HttpsTransport {
    pub fn new(
        endpoint: &Endpoint,
        proxy: Option<&Socks5Config>,
        timeout: Duration,
    ) -> Result<Self, ResolveError> {
        let url = if endpoint.port == 443 {
            format!("https://{}/dns-query", endpoint.host)
        } else {
            format!("https://{}:{}/dns-query", endpoint.host, endpoint.port)
        };

        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("splitdns/", env!("CARGO_PKG_VERSION")));
        if let Some(proxy) = proxy {
            // socks5h: the proxy resolves the upstream's hostname too.
            let proxy_url = match (&proxy.username, &proxy.password) {
                (Some(user), Some(pass)) => {
                    format!("socks5h://{}:{}@{}:{}", user, pass, proxy.address, proxy.port)
                }
                _ => format!("socks5h://{}:{}", proxy.address, proxy.port),
            };
            builder = builder.proxy(reqwest::Proxy::all(&proxy_url)?);
        }
        Ok(HttpsTransport { url, client: builder.build()? })
    }

    pub async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, HeaderValue::from_static(DNS_CONTENT_TYPE))
            .header(ACCEPT, HeaderValue::from_static(DNS_CONTENT_TYPE))
            .body(query.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ResolveError::Transport(format!(
                "{} answered HTTP {}",
                self.url,
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if content_type != DNS_CONTENT_TYPE {
            return Err(ResolveError::Transport(format!(
                "{} answered with content-type '{}'",
                self.url, content_type
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}
