//! Server certificate verification with a configurable hostname policy

use der::Decode;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error as TlsError, SignatureScheme};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::Certificate;

/// Decides whether a certificate's subject alternative names cover a host
pub trait HostnameMatcher: Send + Sync {
    /// `names` holds the DNS and IP address SAN entries of the server certificate
    fn matches(&self, host: &str, names: &[String]) -> bool;
}

impl<F> HostnameMatcher for F
where
    F: Fn(&str, &[String]) -> bool + Send + Sync,
{
    fn matches(&self, host: &str, names: &[String]) -> bool {
        self(host, names)
    }
}

/// How the server's hostname is checked against its certificate.
///
/// Every policy still validates the certificate chain against the trust
/// store; only the name check varies.
#[derive(Clone, Default)]
pub enum HostnameVerification {
    /// Reject certificates that do not name the host (RFC 6125 matching)
    #[default]
    Strict,
    /// Accept any certificate chaining to a trust anchor, whatever it names
    Permissive,
    /// Delegate the name check to a caller-supplied matcher
    Custom(Arc<dyn HostnameMatcher>),
}

impl HostnameVerification {
    /// Wrap a matcher as a custom policy
    pub fn custom(matcher: impl HostnameMatcher + 'static) -> Self {
        HostnameVerification::Custom(Arc::new(matcher))
    }
}

impl fmt::Debug for HostnameVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostnameVerification::Strict => f.write_str("Strict"),
            HostnameVerification::Permissive => f.write_str("Permissive"),
            HostnameVerification::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Chain validation by webpki, name validation by policy
#[derive(Debug)]
pub(crate) struct PolicyServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    policy: HostnameVerification,
}

impl PolicyServerVerifier {
    pub(crate) fn new(inner: Arc<WebPkiServerVerifier>, policy: HostnameVerification) -> Self {
        PolicyServerVerifier { inner, policy }
    }
}

fn is_name_mismatch(err: &TlsError) -> bool {
    matches!(
        err,
        TlsError::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

impl ServerCertVerifier for PolicyServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let outcome =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);

        match (&self.policy, outcome) {
            (HostnameVerification::Strict, outcome) => outcome,
            (_, Err(err)) if !is_name_mismatch(&err) => Err(err),
            (HostnameVerification::Permissive, outcome) => {
                if outcome.is_err() {
                    warn!(
                        "Accepting certificate not issued for {} (permissive hostname verification)",
                        server_name.to_str()
                    );
                }
                Ok(ServerCertVerified::assertion())
            }
            (HostnameVerification::Custom(matcher), _) => {
                let host = server_name.to_str();
                let names = subject_alt_names(end_entity);
                if matcher.matches(&host, &names) {
                    debug!("Custom hostname matcher accepted {} for {:?}", host, names);
                    Ok(ServerCertVerified::assertion())
                } else {
                    Err(TlsError::InvalidCertificate(CertificateError::NotValidForName))
                }
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// DNS and IP address entries of a certificate's subjectAltName extension
pub(crate) fn subject_alt_names(cert: &CertificateDer<'_>) -> Vec<String> {
    let Ok(cert) = Certificate::from_der(cert.as_ref()) else {
        return Vec::new();
    };
    let Ok(Some((_, san))) = cert.tbs_certificate.get::<SubjectAltName>() else {
        return Vec::new();
    };

    san.0
        .iter()
        .filter_map(|name| match name {
            GeneralName::DnsName(dns) => Some(dns.as_str().to_string()),
            GeneralName::IpAddress(octets) => match octets.as_bytes().len() {
                4 => <[u8; 4]>::try_from(octets.as_bytes())
                    .ok()
                    .map(|b| IpAddr::from(b).to_string()),
                16 => <[u8; 16]>::try_from(octets.as_bytes())
                    .ok()
                    .map(|b| IpAddr::from(b).to_string()),
                _ => None,
            },
            _ => None,
        })
        .collect()
}
