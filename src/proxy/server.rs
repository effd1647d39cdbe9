//! Proxy server implementation
//!
//! One task per inbound connection. Dispatch is on the first request's
//! method: CONNECT becomes a TLS-terminating tunnel, everything else is
//! relayed through the pooled outbound transport. Every completed exchange
//! is captured; capture failures never break a relay the client has already
//! been answered for.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use super::outbound::{Outbound, RelayedResponse};
use super::tls::CertificateProvisioner;
use super::wire::{self, RawRequest};
use crate::capture::store::capture_pair;
use crate::capture::{CaptureStore, CapturedRequest, CapturedResponse, FieldMap, Scheme};
use crate::config::ProxyConfig;
use crate::error::ProxyError;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Intercepting proxy server
pub struct ProxyServer {
    listen_addr: String,
    port: u16,
    store: Arc<dyn CaptureStore>,
    provisioner: Arc<dyn CertificateProvisioner>,
    outbound: Arc<Outbound>,
}

impl ProxyServer {
    pub fn new(
        config: &ProxyConfig,
        store: Arc<dyn CaptureStore>,
        provisioner: Arc<dyn CertificateProvisioner>,
        outbound: Arc<Outbound>,
    ) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            port: config.port,
            store,
            provisioner,
            outbound,
        }
    }

    /// Bind the listener and spawn the accept loop
    ///
    /// A bind failure propagates (the one fatal startup condition); accept
    /// and per-connection errors are logged and the loop keeps going.
    pub async fn start(&self) -> Result<SocketAddr, ProxyError> {
        let addr = format!("{}:{}", self.listen_addr, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        tracing::info!("proxy listening on {}", local_addr);

        let store = self.store.clone();
        let provisioner = self.provisioner.clone();
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let store = store.clone();
                        let provisioner = provisioner.clone();
                        let outbound = outbound.clone();

                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, peer_addr, store, provisioner, outbound)
                                    .await
                            {
                                tracing::warn!(%peer_addr, "proxy connection error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                    }
                }
            }
        });

        Ok(local_addr)
    }
}

/// Handle a single inbound connection, dispatching on method
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    store: Arc<dyn CaptureStore>,
    provisioner: Arc<dyn CertificateProvisioner>,
    outbound: Arc<Outbound>,
) -> Result<(), ProxyError> {
    let mut reader = BufReader::new(stream);

    let request = match wire::read_request(&mut reader).await? {
        Some(request) => request,
        None => return Ok(()),
    };

    tracing::info!(
        %peer_addr,
        "proxy: {} {}",
        request.head.method,
        request.head.target
    );

    // The buffered reader stays wrapped around the socket so bytes the
    // client sent ahead of our answer are not lost.
    if request.head.method == "CONNECT" {
        handle_connect(reader, request, store, provisioner, outbound).await
    } else {
        handle_plain(&mut reader, request, store, outbound).await
    }
}

/// Relay a plain HTTP request through the pooled outbound transport
async fn handle_plain(
    stream: &mut BufReader<TcpStream>,
    request: RawRequest,
    store: Arc<dyn CaptureStore>,
    outbound: Arc<Outbound>,
) -> Result<(), ProxyError> {
    let target = request.head.target.clone();

    // Proxied plain requests arrive in absolute form.
    let url = match url::Url::parse(&target) {
        Ok(url) if url.host_str().is_some() => url,
        _ => {
            write_error(stream, 400, "Bad Request", "absolute request URI required").await?;
            return Err(ProxyError::InvalidRequest(target));
        }
    };

    let authority = match url.port() {
        Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
        None => url.host_str().unwrap_or_default().to_string(),
    };

    // The hop-by-hop proxy header is stripped before forwarding and capture.
    // The relay re-frames the message around the decoded payload, so the
    // client's transfer-encoding goes too.
    let headers = field_map(
        &request.head.headers,
        &["proxy-connection", "transfer-encoding"],
    );
    let body = request.decoded_body()?;

    let mut params = FieldMap::new();
    for (name, value) in url.query_pairs() {
        params
            .entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }

    let relayed = match outbound
        .send_plain(&request.head.method, &target, &headers, body.clone())
        .await
    {
        Ok(relayed) => relayed,
        Err(e) => {
            tracing::error!("round trip failed: {e}");
            write_error(stream, 503, "Service Unavailable", &e.to_string()).await?;
            return Ok(());
        }
    };

    // Capture before answering the client; failures are logged, never fatal
    // to a relay that already has a usable origin response in hand.
    let captured_request = CapturedRequest {
        id: 0,
        method: request.head.method.clone(),
        scheme: Scheme::Http,
        host: authority,
        path: url.path().to_string(),
        headers,
        params,
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    let captured_response = CapturedResponse {
        id: 0,
        request_id: 0,
        code: relayed.code,
        message: relayed.message.clone(),
        headers: relayed.headers.clone(),
        body: String::from_utf8_lossy(&relayed.body).into_owned(),
    };
    if let Err(e) = capture_pair(store.as_ref(), captured_request, captured_response).await {
        tracing::error!("capture failed for {target}: {e}");
    }

    write_relayed(stream, &relayed).await?;
    Ok(())
}

/// TLS-terminating CONNECT tunnel (MITM)
///
/// One request/response pair per tunnel; exact wire bytes are moved between
/// the decrypted client leg and the fresh origin leg, and those same bytes
/// are what gets captured.
async fn handle_connect(
    mut stream: BufReader<TcpStream>,
    connect: RawRequest,
    store: Arc<dyn CaptureStore>,
    provisioner: Arc<dyn CertificateProvisioner>,
    outbound: Arc<Outbound>,
) -> Result<(), ProxyError> {
    let target = connect.head.target.clone();
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse::<u16>()
                .map_err(|_| ProxyError::InvalidRequest(target.clone()))?,
        ),
        None => (target.clone(), Scheme::Https.default_port()),
    };

    stream.write_all(CONNECT_ESTABLISHED).await?;
    stream.flush().await?;

    // Impersonate the origin toward the client.
    let server_config = provisioner.provision(&host).await?;
    let acceptor = TlsAcceptor::from(server_config);
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|source| ProxyError::TlsHandshake {
            peer: "client".to_string(),
            source,
        })?;

    let (read_half, mut write_half) = tokio::io::split(tls_stream);
    let mut reader = BufReader::new(read_half);

    let inner = match wire::read_request(&mut reader).await? {
        Some(inner) => inner,
        None => return Ok(()),
    };
    let raw_request = inner.to_bytes();

    tracing::info!("tunnel: {} https://{}{}", inner.head.method, target, inner.head.target);

    let raw_response = outbound.send_raw_tls(&host, port, &raw_request).await?;
    let response_bytes = raw_response.to_bytes();

    write_half.write_all(&response_bytes).await?;
    write_half.flush().await?;

    // The tunnel has already completed; capture failures are only logged.
    let captured_request = CapturedRequest {
        id: 0,
        method: connect.head.method.clone(),
        scheme: Scheme::Https,
        host: target.clone(),
        path: String::new(),
        headers: field_map(&connect.head.headers, &[]),
        params: FieldMap::new(),
        body: String::from_utf8_lossy(&raw_request).into_owned(),
    };
    let captured_response = CapturedResponse {
        id: 0,
        request_id: 0,
        code: raw_response.head.code,
        message: raw_response.status_text(),
        headers: RelayedResponse::from(&raw_response).headers,
        body: String::from_utf8_lossy(&response_bytes).into_owned(),
    };
    if let Err(e) = capture_pair(store.as_ref(), captured_request, captured_response).await {
        tracing::error!("capture failed for {target}: {e}");
    }

    Ok(())
}

/// Collect wire-order header fields into a multimap, skipping `skip` names
fn field_map(headers: &[(String, String)], skip: &[&str]) -> FieldMap {
    let mut map = FieldMap::new();
    for (name, value) in headers {
        if skip.iter().any(|s| name.eq_ignore_ascii_case(s)) {
            continue;
        }
        map.entry(name.clone()).or_default().push(value.clone());
    }
    map
}

/// Write a relayed response back to the client
///
/// The outbound transport already decoded the transfer encoding, so the
/// framing headers are replaced with the decoded body's length.
async fn write_relayed<W: tokio::io::AsyncWrite + Unpin>(
    stream: &mut W,
    relayed: &RelayedResponse,
) -> std::io::Result<()> {
    let mut head = format!("HTTP/1.1 {}\r\n", relayed.message);
    for (name, values) in relayed.headers.iter() {
        if name.eq_ignore_ascii_case("transfer-encoding") || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        for value in values {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(&String::from_utf8_lossy(value));
            head.push_str("\r\n");
        }
    }
    head.push_str(&format!("content-length: {}\r\n\r\n", relayed.body.len()));

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&relayed.body).await?;
    stream.flush().await
}

async fn write_error<W: tokio::io::AsyncWrite + Unpin>(
    stream: &mut W,
    code: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()> {
    let text = format!(
        "HTTP/1.1 {code} {reason}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(text.as_bytes()).await?;
    stream.flush().await
}
