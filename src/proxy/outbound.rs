//! Outbound transport
//!
//! Two ways out of the proxy: a pooled HTTP client for the plain relay (and
//! the replay and scan paths built on it), and a raw permissive-TLS dial for
//! the tunnel path, which moves exact wire bytes.

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::tls::permissive_connector;
use super::wire::{self, RawResponse};
use crate::capture::{FieldMap, RawHeaders};
use crate::error::ProxyError;

/// A relayed origin response, ready to capture or hand back to a caller
#[derive(Debug, Clone)]
pub struct RelayedResponse {
    pub code: u16,
    /// Status line text, e.g. `200 OK`
    pub message: String,
    pub headers: RawHeaders,
    pub body: Vec<u8>,
}

impl From<&RawResponse> for RelayedResponse {
    fn from(raw: &RawResponse) -> Self {
        let mut headers = RawHeaders::new();
        for (name, value) in &raw.head.headers {
            headers.append(name, value.as_bytes().to_vec());
        }
        Self {
            code: raw.head.code,
            message: raw.status_text(),
            headers,
            body: raw.body.clone(),
        }
    }
}

pub struct Outbound {
    http: reqwest::Client,
    connector: TlsConnector,
}

impl Outbound {
    pub fn new(user_agent: &str) -> Result<Self, reqwest::Error> {
        // A proxy must hand redirects back to the client, not chase them.
        // Origin certificates are not validated anywhere in the relay, and
        // the pooled path is no exception.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            http,
            connector: permissive_connector(),
        })
    }

    /// Pooled client for probe traffic (scanners)
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Send a request through the pooled transport and read the full response
    pub async fn send_plain(
        &self,
        method: &str,
        url: &str,
        headers: &FieldMap,
        body: Vec<u8>,
    ) -> Result<RelayedResponse, ProxyError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ProxyError::InvalidRequest(format!("bad method: {method}")))?;

        let mut builder = self.http.request(method, url);
        for (name, values) in headers {
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let transport_err = |e: reqwest::Error| ProxyError::Transport {
            target: url.to_string(),
            reason: e.to_string(),
        };

        let response = builder.send().await.map_err(transport_err)?;

        let code = response.status().as_u16();
        let message = match response.status().canonical_reason() {
            Some(reason) => format!("{code} {reason}"),
            None => code.to_string(),
        };

        let mut out_headers = RawHeaders::new();
        for (name, value) in response.headers() {
            out_headers.append(name.as_str(), value.as_bytes().to_vec());
        }

        let body = response.bytes().await.map_err(transport_err)?;

        Ok(RelayedResponse {
            code,
            message,
            headers: out_headers,
            body: body.to_vec(),
        })
    }

    /// Dial the origin over permissive TLS, write `raw` verbatim, read one response
    pub async fn send_raw_tls(
        &self,
        host: &str,
        port: u16,
        raw: &[u8],
    ) -> Result<RawResponse, ProxyError> {
        let target = format!("{host}:{port}");

        let tcp = TcpStream::connect(&target)
            .await
            .map_err(|e| ProxyError::Transport {
                target: target.clone(),
                reason: e.to_string(),
            })?;

        let server_name = rustls_pki_types::ServerName::try_from(host.to_string())
            .map_err(|_| ProxyError::InvalidRequest(format!("bad server name: {host}")))?;

        let mut stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::TlsHandshake {
                peer: target.clone(),
                source: e,
            })?;

        stream.write_all(raw).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        wire::read_response(&mut reader)
            .await
            .map_err(|e| ProxyError::Transport {
                target,
                reason: e.to_string(),
            })
    }
}
