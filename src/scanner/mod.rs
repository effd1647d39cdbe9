//! Active probes driven by captured requests
//!
//! A capture is a template, never mutated: the path brute-force walks a
//! wordlist of candidate paths against the capture's host, and the hidden
//! parameter probe injects random-valued extra query parameters and looks
//! for their reflection. A failing candidate is recorded and skipped; one
//! dead path never aborts a scan.

pub mod params;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::capture::CapturedRequest;
use crate::config::ScannerConfig;
use crate::error::ScanError;
use crate::proxy::Outbound;

pub struct Scanner {
    outbound: Arc<Outbound>,
    timeout: Duration,
}

impl Scanner {
    pub fn new(outbound: Arc<Outbound>, config: &ScannerConfig) -> Self {
        Self {
            outbound,
            timeout: Duration::from_secs(config.request_timeout),
        }
    }

    fn base_url(template: &CapturedRequest) -> Result<url::Url, ScanError> {
        let base = format!("{}://{}/", template.scheme.as_str(), template.host);
        url::Url::parse(&base).map_err(|_| ScanError::InvalidTarget(base))
    }

    /// Probe every wordlist entry as a path on the template's host
    ///
    /// A candidate counts as found when the origin answers with anything
    /// other than 404. Transport errors mark the candidate not-found.
    pub async fn brute_force_paths(
        &self,
        template: &CapturedRequest,
        wordlist: &Path,
    ) -> Result<IndexMap<String, bool>, ScanError> {
        let base = Self::base_url(template)?;

        let words = tokio::fs::read_to_string(wordlist)
            .await
            .map_err(|source| ScanError::Wordlist {
                path: wordlist.display().to_string(),
                source,
            })?;

        let mut results = IndexMap::new();
        for word in words.lines().map(str::trim).filter(|w| !w.is_empty()) {
            let mut url = base.clone();
            url.set_path(word);

            let found = match self
                .outbound
                .http()
                .head(url.clone())
                .timeout(self.timeout)
                .send()
                .await
            {
                Ok(response) => response.status().as_u16() != 404,
                Err(e) => {
                    debug!(%url, "path probe failed: {e}");
                    false
                }
            };

            if found {
                info!(%url, "path found");
            }
            results.insert(word.to_string(), found);
        }

        Ok(results)
    }

    /// Probe the built-in parameter wordlist against the template
    pub async fn discover_params(
        &self,
        template: &CapturedRequest,
    ) -> Result<Vec<String>, ScanError> {
        self.discover_params_with(template, params::PARAM_WORDLIST)
            .await
    }

    /// Inject `name=<random>` for each candidate and report verbatim reflections
    pub async fn discover_params_with(
        &self,
        template: &CapturedRequest,
        names: &[&str],
    ) -> Result<Vec<String>, ScanError> {
        let base = Self::base_url(template)?;

        let mut discovered = Vec::new();
        for name in names {
            let probe = params::random_value();

            let mut url = base.clone();
            url.set_path(&template.path);
            {
                let mut pairs = url.query_pairs_mut();
                for (existing, values) in &template.params {
                    for value in values {
                        pairs.append_pair(existing, value);
                    }
                }
                pairs.append_pair(name, &probe);
            }

            let relayed = match self
                .outbound
                .send_plain(
                    &template.method,
                    url.as_str(),
                    &template.headers,
                    template.body.clone().into_bytes(),
                )
                .await
            {
                Ok(relayed) => relayed,
                Err(e) => {
                    warn!(name, "parameter probe failed: {e}");
                    continue;
                }
            };

            if String::from_utf8_lossy(&relayed.body).contains(&probe) {
                info!(name, "hidden parameter reflected");
                discovered.push(name.to_string());
            }
        }

        Ok(discovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FieldMap, Scheme};
    use std::io::Write as _;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use crate::proxy::wire;

    fn install_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    fn template(host: &str) -> CapturedRequest {
        CapturedRequest {
            id: 0,
            method: "GET".to_string(),
            scheme: Scheme::Http,
            host: host.to_string(),
            path: "/search".to_string(),
            headers: FieldMap::new(),
            params: FieldMap::new(),
            body: String::new(),
        }
    }

    fn scanner() -> Scanner {
        install_provider();
        Scanner::new(
            Arc::new(Outbound::new("caracal-test").unwrap()),
            &ScannerConfig {
                request_timeout: 5,
                ..Default::default()
            },
        )
    }

    /// Origin answering each connection once with `respond(target) -> (code, body)`
    async fn spawn_origin<F>(respond: F) -> std::net::SocketAddr
    where
        F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let mut reader = BufReader::new(stream);
                let Ok(Some(request)) = wire::read_request(&mut reader).await else {
                    continue;
                };
                let (code, body) = respond(&request.head.target);
                let mut stream = reader.into_inner();
                let response = format!(
                    "HTTP/1.1 {code} X\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.flush().await;
            }
        });

        addr
    }

    #[tokio::test]
    async fn brute_force_marks_only_non_404_paths() {
        let origin = spawn_origin(|target| {
            if target.starts_with("/admin") {
                (200, String::new())
            } else {
                (404, String::new())
            }
        })
        .await;

        let mut wordlist = tempfile::NamedTempFile::new().unwrap();
        writeln!(wordlist, "admin\nbackup\n\n  x  ").unwrap();

        let results = scanner()
            .brute_force_paths(&template(&origin.to_string()), wordlist.path())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results["admin"]);
        assert!(!results["backup"]);
        assert!(!results["x"]);
    }

    #[tokio::test]
    async fn missing_wordlist_is_an_error() {
        let result = scanner()
            .brute_force_paths(
                &template("127.0.0.1:1"),
                Path::new("/nonexistent/words.txt"),
            )
            .await;
        assert!(matches!(result, Err(ScanError::Wordlist { .. })));
    }

    #[tokio::test]
    async fn reflected_probe_values_reveal_hidden_params() {
        // Reflects the full request target, query string included.
        let origin = spawn_origin(|target| (200, format!("you asked for {target}"))).await;

        let discovered = scanner()
            .discover_params_with(&template(&origin.to_string()), &["debug", "admin"])
            .await
            .unwrap();

        assert_eq!(discovered, vec!["debug".to_string(), "admin".to_string()]);
    }

    #[tokio::test]
    async fn non_reflecting_origin_reveals_nothing() {
        let origin = spawn_origin(|_| (200, "static page".to_string())).await;

        let discovered = scanner()
            .discover_params_with(&template(&origin.to_string()), &["debug", "admin"])
            .await
            .unwrap();

        assert!(discovered.is_empty());
    }

    #[tokio::test]
    async fn unreachable_candidates_do_not_abort_the_scan() {
        // Nothing listens here; every probe fails and is swallowed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let discovered = scanner()
            .discover_params_with(&template(&dead.to_string()), &["debug"])
            .await
            .unwrap();
        assert!(discovered.is_empty());
    }
}
