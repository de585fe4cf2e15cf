//! Trust store loading

use crate::error::{CredentialFailure, Error, Result, StoreKind};
use crate::keystore::{open_store, read_store_file, StoreFormat};
use crate::secret::Password;
use der::Decode;
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use x509_cert::Certificate;

/// Certificate authorities used to validate the server's certificate chain
#[derive(Clone, Debug)]
pub struct TrustAnchors {
    /// Anchor certificates (DER encoded)
    certificates: Vec<CertificateDer<'static>>,
    /// Subjects of the anchors, for diagnostics
    subjects: Vec<String>,
    /// Root store built from the anchors
    roots: Arc<RootCertStore>,
}

impl TrustAnchors {
    /// Load trust anchors from a PKCS#12, JKS or PEM trust store.
    ///
    /// PKCS#12 contributes every certificate bag, JKS every trusted
    /// certificate entry. The password is ignored for PEM bundles.
    pub fn load(path: &Path, password: &Password) -> Result<Self> {
        let fail = |reason| Error::credential_load(StoreKind::TrustStore, path, reason);

        let bytes = read_store_file(path, StoreKind::TrustStore)?;
        let (format, contents) = open_store(&bytes, password.expose()).map_err(fail)?;

        if format != StoreFormat::Pem && !contents.keys.is_empty() {
            debug!(
                "Trust store {} also holds {} private key entries; they are ignored",
                path.display(),
                contents.keys.len()
            );
        }

        let certificates = contents
            .certs
            .into_iter()
            .map(|entry| CertificateDer::from(entry.der))
            .collect();
        let anchors = Self::from_certificates(certificates).map_err(fail)?;

        info!(
            "Loaded {} trust anchor(s) from {:?} trust store {}",
            anchors.len(),
            format,
            path.display()
        );

        Ok(anchors)
    }

    /// Build trust anchors from DER certificates
    pub(crate) fn from_certificates(
        certificates: Vec<CertificateDer<'static>>,
    ) -> std::result::Result<Self, CredentialFailure> {
        if certificates.is_empty() {
            return Err(CredentialFailure::MissingEntry(
                "trust store contains no certificates".into(),
            ));
        }

        let mut roots = RootCertStore::empty();
        let mut subjects = Vec::with_capacity(certificates.len());
        for (i, cert) in certificates.iter().enumerate() {
            let parsed = Certificate::from_der(cert.as_ref())
                .map_err(|e| CredentialFailure::Malformed(format!("certificate {}: {}", i, e)))?;
            roots
                .add(cert.clone())
                .map_err(|e| CredentialFailure::Rejected(format!("certificate {}: {}", i, e)))?;
            subjects.push(parsed.tbs_certificate.subject.to_string());
        }

        debug!("Added {} certificates to root store", roots.len());

        Ok(TrustAnchors {
            certificates,
            subjects,
            roots: Arc::new(roots),
        })
    }

    /// Get the anchor certificates
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    /// Get the anchor subjects
    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    /// Number of anchors
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    /// Always false for a loaded trust store
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    pub(crate) fn root_store(&self) -> Arc<RootCertStore> {
        self.roots.clone()
    }
}
