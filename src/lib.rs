//! Mutually authenticated HTTPS client for the rules service
//!
//! Loads a client identity and trust anchors from PKCS#12, JKS or PEM stores,
//! then builds a pooled HTTP/1.1 client that presents the identity and
//! verifies servers against the anchors.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
mod jks;
pub mod json;
pub mod keystore;
mod pkcs12;
pub mod pool;
pub mod secret;
pub mod tls;
pub mod truststore;
pub mod verifier;

pub use client::{build_client, build_client_with_options, ClientOptions, SecureClient, SecureResponse};
pub use config::{bootstrap, Settings};
pub use error::{CredentialFailure, Error, PasswordKind, Result, StoreKind};
pub use keystore::ClientIdentity;
pub use pool::{PoolPolicy, PoolStats};
pub use secret::Password;
pub use tls::{load_tls_context, CredentialMaterial, TlsContext};
pub use truststore::TrustAnchors;
pub use verifier::{HostnameMatcher, HostnameVerification};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = std::mem::size_of::<SecureClient>();
        let _ = std::mem::size_of::<TlsContext>();
        let _ = std::mem::size_of::<CredentialMaterial>();
        let _ = std::mem::size_of::<PoolPolicy>();
    }

    #[test]
    fn test_client_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SecureClient>();
        assert_send_sync::<TlsContext>();
    }
}
