//! Replay engine
//!
//! Re-sends a captured request as the origin saw it. Plain captures are
//! rebuilt from their structured fields and sent through the pooled
//! transport; tunneled captures hold the exact wire bytes, so those bytes
//! are written to a fresh permissive-TLS connection verbatim.

use std::sync::Arc;

use crate::capture::store::capture_pair;
use crate::capture::{CaptureStore, CapturedRequest, CapturedResponse, Scheme};
use crate::error::{ProxyError, ReplayError};
use crate::proxy::{Outbound, RelayedResponse};

pub struct ReplayEngine {
    store: Arc<dyn CaptureStore>,
    outbound: Arc<Outbound>,
}

impl ReplayEngine {
    pub fn new(store: Arc<dyn CaptureStore>, outbound: Arc<Outbound>) -> Self {
        Self { store, outbound }
    }

    /// Re-send capture `id`; with `recapture`, store the new exchange as a fresh pair
    pub async fn replay(&self, id: i64, recapture: bool) -> Result<RelayedResponse, ReplayError> {
        let request = self.store.request_by_id(id).await?;

        tracing::info!(id, scheme = %request.scheme, host = %request.host, "replaying capture");

        let relayed = match request.scheme {
            Scheme::Http => self.replay_plain(&request).await?,
            Scheme::Https => self.replay_raw(&request).await?,
        };

        if recapture {
            let replayed_request = CapturedRequest {
                id: 0,
                ..request.clone()
            };
            let replayed_response = CapturedResponse {
                id: 0,
                request_id: 0,
                code: relayed.code,
                message: relayed.message.clone(),
                headers: relayed.headers.clone(),
                body: String::from_utf8_lossy(&relayed.body).into_owned(),
            };
            if let Err(e) =
                capture_pair(self.store.as_ref(), replayed_request, replayed_response).await
            {
                tracing::error!(id, "recapture failed: {e}");
            }
        }

        Ok(relayed)
    }

    /// Rebuild a plain capture into a URL and send it through the pool
    async fn replay_plain(&self, request: &CapturedRequest) -> Result<RelayedResponse, ReplayError> {
        let base = format!("http://{}{}", request.host, request.path);
        let mut url = url::Url::parse(&base)
            .map_err(|_| ReplayError::Relay(ProxyError::InvalidRequest(base)))?;

        if !request.params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, values) in &request.params {
                for value in values {
                    pairs.append_pair(name, value);
                }
            }
        }

        let relayed = self
            .outbound
            .send_plain(
                &request.method,
                url.as_str(),
                &request.headers,
                request.body.clone().into_bytes(),
            )
            .await?;

        Ok(relayed)
    }

    /// Write a tunneled capture's stored wire bytes to a fresh origin connection
    async fn replay_raw(&self, request: &CapturedRequest) -> Result<RelayedResponse, ReplayError> {
        let (host, port) = match request.host.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>().map_err(|_| {
                    ReplayError::Relay(ProxyError::InvalidRequest(request.host.clone()))
                })?,
            ),
            None => (request.host.as_str(), Scheme::Https.default_port()),
        };

        let raw = self
            .outbound
            .send_raw_tls(host, port, request.body.as_bytes())
            .await?;

        Ok(RelayedResponse::from(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FieldMap, MemoryStore};
    use crate::error::StoreError;
    use crate::proxy::wire;
    use rustls_pki_types::PrivatePkcs8KeyDer;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_rustls::TlsAcceptor;

    fn install_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    fn engine(store: Arc<MemoryStore>) -> ReplayEngine {
        ReplayEngine::new(store, Arc::new(Outbound::new("caracal-test").unwrap()))
    }

    fn plain_request(host: &str) -> CapturedRequest {
        let mut params = FieldMap::new();
        params.insert("a".to_string(), vec!["1".to_string()]);
        let mut headers = FieldMap::new();
        headers.insert("X-Replay".to_string(), vec!["yes".to_string()]);

        CapturedRequest {
            id: 0,
            method: "GET".to_string(),
            scheme: Scheme::Http,
            host: host.to_string(),
            path: "/again".to_string(),
            headers,
            params,
            body: String::new(),
        }
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        install_provider();
        let store = Arc::new(MemoryStore::new());
        let result = engine(store).replay(42, false).await;
        assert!(matches!(
            result,
            Err(ReplayError::Store(StoreError::NotFound(42)))
        ));
    }

    #[tokio::test]
    async fn plain_replay_rebuilds_url_and_recaptures() {
        install_provider();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = listener.local_addr().unwrap();
        let (tx, seen) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let request = wire::read_request(&mut reader).await.unwrap().unwrap();
            let mut stream = reader.into_inner();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            stream.flush().await.unwrap();
            let _ = tx.send(request);
        });

        let store = Arc::new(MemoryStore::new());
        let mut seed = plain_request(&origin.to_string());
        store.insert_request(&mut seed).await.unwrap();

        let relayed = engine(store.clone()).replay(seed.id, true).await.unwrap();
        assert_eq!(relayed.code, 200);
        assert_eq!(relayed.body, b"ok");

        let upstream = seen.await.unwrap();
        assert_eq!(upstream.head.target, "/again?a=1");
        assert_eq!(wire::header(&upstream.head.headers, "x-replay"), Some("yes"));

        // Recapture adds a fresh pair next to the seeded request.
        let pairs = store.all_pairs().await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert_ne!(pairs[0].request.id, seed.id);
        assert_eq!(pairs[0].response.body, "ok");
    }

    #[tokio::test]
    async fn tunneled_replay_writes_stored_bytes_verbatim() {
        install_provider();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = listener.local_addr().unwrap();
        let (tx, seen) = oneshot::channel();

        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key.into())
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let tls = acceptor.accept(stream).await.unwrap();
            let mut reader = BufReader::new(tls);
            let request = wire::read_request(&mut reader).await.unwrap().unwrap();
            let mut tls = reader.into_inner();
            tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecret")
                .await
                .unwrap();
            tls.flush().await.unwrap();
            let _ = tx.send(request.to_bytes());
        });

        let stored_wire = b"GET /secret HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let store = Arc::new(MemoryStore::new());
        let mut seed = CapturedRequest {
            id: 0,
            method: "CONNECT".to_string(),
            scheme: Scheme::Https,
            host: format!("localhost:{}", origin.port()),
            path: String::new(),
            headers: FieldMap::new(),
            params: FieldMap::new(),
            body: String::from_utf8_lossy(stored_wire).into_owned(),
        };
        store.insert_request(&mut seed).await.unwrap();

        let relayed = engine(store).replay(seed.id, false).await.unwrap();
        assert_eq!(relayed.code, 200);
        assert_eq!(relayed.body, b"secret");

        assert_eq!(seen.await.unwrap(), stored_wire.to_vec());
    }
}
