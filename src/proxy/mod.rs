//! Intercepting proxy: plain relay and TLS-terminating CONNECT tunnel

pub mod outbound;
pub mod server;
pub mod tls;
pub mod wire;

pub use outbound::{Outbound, RelayedResponse};
pub use server::ProxyServer;
pub use tls::{CertificateProvisioner, ScriptProvisioner};
