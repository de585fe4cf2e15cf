//! TLS context construction from key and trust material

use crate::error::{CredentialFailure, Error, Result, StoreKind};
use crate::keystore::ClientIdentity;
use crate::secret::Password;
use crate::truststore::TrustAnchors;
use crate::verifier::{HostnameVerification, PolicyServerVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use rustls::ClientConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// ALPN identifier for the only protocol the client speaks
const HTTP_1_1: &[u8] = b"http/1.1";

/// File locations and secrets for the key store and trust store
#[derive(Clone, Debug, Deserialize)]
pub struct CredentialMaterial {
    /// Key store holding the client certificate and private key
    pub key_store_path: PathBuf,
    /// Password protecting the key store container
    pub key_store_password: Password,
    /// Password protecting the private key entry
    pub key_password: Password,
    /// Trust store holding the certificate authorities to accept
    pub trust_store_path: PathBuf,
    /// Password protecting the trust store
    pub trust_store_password: Password,
    /// Key entry to use when the key store holds several
    #[serde(default)]
    pub key_alias: Option<String>,
}

impl CredentialMaterial {
    /// Describe key and trust material by path and password
    pub fn new(
        key_store_path: impl Into<PathBuf>,
        key_store_password: impl Into<Password>,
        key_password: impl Into<Password>,
        trust_store_path: impl Into<PathBuf>,
        trust_store_password: impl Into<Password>,
    ) -> Self {
        CredentialMaterial {
            key_store_path: key_store_path.into(),
            key_store_password: key_store_password.into(),
            key_password: key_password.into(),
            trust_store_path: trust_store_path.into(),
            trust_store_password: trust_store_password.into(),
            key_alias: None,
        }
    }

    /// Select a key entry by alias
    pub fn with_key_alias(mut self, alias: impl Into<String>) -> Self {
        self.key_alias = Some(alias.into());
        self
    }
}

/// Validated client identity plus trust anchors, ready to configure TLS.
///
/// Only [`load_tls_context`] creates one, and only after both stores loaded
/// and the private key was shown to belong to the client certificate.
#[derive(Clone, Debug)]
pub struct TlsContext {
    identity: ClientIdentity,
    trust: TrustAnchors,
    provider: Arc<CryptoProvider>,
}

/// Load the key store and trust store and build a validated TLS context
pub fn load_tls_context(material: &CredentialMaterial) -> Result<TlsContext> {
    TlsContext::load(material)
}

impl TlsContext {
    /// Load and validate the material
    pub fn load(material: &CredentialMaterial) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let identity = ClientIdentity::load(
            &material.key_store_path,
            &material.key_store_password,
            &material.key_password,
            material.key_alias.as_deref(),
            &provider,
        )?;

        CertifiedKey::from_der(
            identity.cert_chain().to_vec(),
            identity.private_key().clone_key(),
            &provider,
        )
        .map_err(|e| {
            Error::credential_load(
                StoreKind::KeyStore,
                &material.key_store_path,
                CredentialFailure::Rejected(e.to_string()),
            )
        })?;

        let trust = TrustAnchors::load(&material.trust_store_path, &material.trust_store_password)?;

        let context = TlsContext {
            identity,
            trust,
            provider,
        };

        // Surface configuration problems now rather than at the first request
        context.client_config(&HostnameVerification::Strict)?;

        info!(
            "TLS context ready: presenting {} with {} trust anchor(s)",
            context.identity.subject(),
            context.trust.len()
        );

        Ok(context)
    }

    /// The certificate presented to servers
    pub fn client_certificate(&self) -> &CertificateDer<'static> {
        self.identity.leaf_cert()
    }

    /// The full chain presented to servers, leaf first
    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        self.identity.cert_chain()
    }

    /// The loaded client identity
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// The loaded trust anchors
    pub fn trust_anchors(&self) -> &TrustAnchors {
        &self.trust
    }

    /// Number of certificate authorities the client trusts
    pub fn trust_anchor_count(&self) -> usize {
        self.trust.len()
    }

    /// Build a rustls client configuration applying the given hostname policy
    pub(crate) fn client_config(&self, hostname: &HostnameVerification) -> Result<ClientConfig> {
        let webpki = WebPkiServerVerifier::builder_with_provider(
            self.trust.root_store(),
            self.provider.clone(),
        )
        .build()
        .map_err(|e| Error::tls_error(format!("Failed to create server verifier: {}", e)))?;

        let verifier = PolicyServerVerifier::new(webpki, hostname.clone());

        let mut config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::tls_error(format!("Unsupported protocol versions: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(
                self.identity.cert_chain().to_vec(),
                self.identity.private_key().clone_key(),
            )
            .map_err(|e| Error::tls_error(format!("Failed to create client config: {}", e)))?;

        config.alpn_protocols = vec![HTTP_1_1.to_vec()];

        debug!("Built client TLS configuration with {:?} hostname verification", hostname);

        Ok(config)
    }
}
