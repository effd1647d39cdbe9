//! Custom error types for Caracal
//!
//! Errors abort at most the connection or request that raised them; only a
//! listener bind failure at startup is fatal to the process.

use thiserror::Error;

/// Proxy engine errors
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to bind proxy listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("invalid proxy request: {0}")]
    InvalidRequest(String),

    #[error("connection to target failed: {target}: {reason}")]
    Transport { target: String, reason: String },

    #[error("TLS handshake failed with {peer}: {source}")]
    TlsHandshake {
        peer: String,
        source: std::io::Error,
    },

    #[error("certificate error: {0}")]
    Certificate(#[from] CertError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate provisioning errors
#[derive(Error, Debug)]
pub enum CertError {
    #[error("certificate script {script} failed for {host}: {reason}")]
    ScriptFailed {
        script: String,
        host: String,
        reason: String,
    },

    #[error("failed to read key material from {path}: {source}")]
    KeyMaterial {
        path: String,
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    EmptyCertFile(String),

    #[error("failed to build server TLS config: {0}")]
    TlsConfig(#[from] rustls::Error),
}

/// Capture store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no captured record with id {0}")]
    NotFound(i64),

    #[error("database pool error: {0}")]
    Pool(String),

    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Scanner errors
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("failed to read wordlist {path}: {source}")]
    Wordlist {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid scan target: {0}")]
    InvalidTarget(String),
}

/// Replay errors
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Relay(#[from] ProxyError),
}
