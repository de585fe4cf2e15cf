//! Key store loading: the client certificate chain and its private key

use crate::error::{CredentialFailure, Error, Result, StoreKind};
use crate::secret::Password;
use crate::{jks, pkcs12};
use chrono::{DateTime, Utc};
use cms::cert::x509::spki::AlgorithmIdentifierOwned;
use der::{Decode, Encode};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};
use x509_cert::Certificate;
use zeroize::Zeroizing;

/// Longest issuer chain assembled from a single store
const MAX_CHAIN_DEPTH: usize = 10;

/// On-disk layout of a credential store, detected from its leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFormat {
    /// PKCS#12 / PFX container
    Pkcs12,
    /// Java KeyStore
    Jks,
    /// PEM-encoded certificates and unencrypted keys
    Pem,
}

impl StoreFormat {
    /// Detect the format of a store file's contents
    pub fn detect(bytes: &[u8]) -> Option<StoreFormat> {
        if bytes.starts_with(&jks::MAGIC) {
            return Some(StoreFormat::Jks);
        }
        if bytes.first() == Some(&0x30) {
            return Some(StoreFormat::Pkcs12);
        }
        let start = bytes
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(bytes.len());
        if bytes[start..].starts_with(b"-----BEGIN") {
            return Some(StoreFormat::Pem);
        }
        None
    }
}

/// Everything a store yielded after its store-level protection was removed
#[derive(Debug, Default)]
pub(crate) struct StoreContents {
    pub keys: Vec<KeyEntry>,
    pub certs: Vec<CertEntry>,
}

/// A certificate entry
#[derive(Debug, Clone)]
pub(crate) struct CertEntry {
    pub alias: Option<String>,
    pub local_key_id: Option<Vec<u8>>,
    pub der: Vec<u8>,
}

/// A private key entry whose own protection has not yet been removed
pub(crate) struct KeyEntry {
    pub alias: Option<String>,
    pub local_key_id: Option<Vec<u8>>,
    /// Chain stored alongside the key (JKS only)
    pub chain: Vec<Vec<u8>>,
    pub protection: KeyProtection,
}

pub(crate) enum KeyProtection {
    Plain(Zeroizing<Vec<u8>>),
    Pem(PrivateKeyDer<'static>),
    Shrouded {
        algorithm: AlgorithmIdentifierOwned,
        ciphertext: Vec<u8>,
    },
    JksProtector(Vec<u8>),
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("alias", &self.alias)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl KeyEntry {
    /// Apply the key password and return the key in a form rustls accepts
    pub fn decrypt(&self, key_password: &str) -> std::result::Result<PrivateKeyDer<'static>, CredentialFailure> {
        let pkcs8 = match &self.protection {
            KeyProtection::Pem(key) => return Ok(key.clone_key()),
            KeyProtection::Plain(der) => der.clone(),
            KeyProtection::Shrouded {
                algorithm,
                ciphertext,
            } => pkcs12::decrypt_key(algorithm, ciphertext, key_password)?,
            KeyProtection::JksProtector(protected) => jks::recover_key(protected, key_password)?,
        };
        Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8.to_vec())))
    }

    fn matches_alias(&self, alias: &str) -> bool {
        self.alias
            .as_deref()
            .is_some_and(|own| own.eq_ignore_ascii_case(alias))
    }
}

/// Read a store file, mapping I/O failures to a credential error
pub(crate) fn read_store_file(path: &Path, store: StoreKind) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::credential_load(store, path, CredentialFailure::Unreadable(e)))
}

/// Remove store-level protection from a store of any supported format
pub(crate) fn open_store(
    bytes: &[u8],
    store_password: &str,
) -> std::result::Result<(StoreFormat, StoreContents), CredentialFailure> {
    let format = match StoreFormat::detect(bytes) {
        Some(format) => format,
        None if jks::is_jceks(bytes) => {
            return Err(CredentialFailure::UnsupportedAlgorithm(
                "JCEKS stores are not supported; convert to PKCS#12".into(),
            ))
        }
        None => {
            return Err(CredentialFailure::Malformed(
                "unrecognized store format".into(),
            ))
        }
    };

    let contents = match format {
        StoreFormat::Pkcs12 => pkcs12::decode(bytes, store_password)?,
        StoreFormat::Jks => jks::decode(bytes, store_password)?,
        StoreFormat::Pem => decode_pem(bytes)?,
    };
    Ok((format, contents))
}

fn decode_pem(bytes: &[u8]) -> std::result::Result<StoreContents, CredentialFailure> {
    let mut contents = StoreContents::default();
    let mut reader = bytes;

    for item in rustls_pemfile::read_all(&mut reader) {
        let item = item.map_err(|e| CredentialFailure::Malformed(format!("invalid PEM: {}", e)))?;
        let key = match item {
            rustls_pemfile::Item::X509Certificate(cert) => {
                contents.certs.push(CertEntry {
                    alias: None,
                    local_key_id: None,
                    der: cert.to_vec(),
                });
                continue;
            }
            rustls_pemfile::Item::Pkcs8Key(key) => PrivateKeyDer::Pkcs8(key),
            rustls_pemfile::Item::Pkcs1Key(key) => PrivateKeyDer::Pkcs1(key),
            rustls_pemfile::Item::Sec1Key(key) => PrivateKeyDer::Sec1(key),
            _ => continue,
        };
        contents.keys.push(KeyEntry {
            alias: None,
            local_key_id: None,
            chain: Vec::new(),
            protection: KeyProtection::Pem(key),
        });
    }

    Ok(contents)
}

/// The certificate chain and private key this process presents to peers
pub struct ClientIdentity {
    /// Entry alias or friendly name, when the store records one
    alias: Option<String>,
    /// Leaf first, then issuers found in the same store
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    subject: String,
    serial_number: String,
    not_after: DateTime<Utc>,
}

impl Clone for ClientIdentity {
    fn clone(&self) -> Self {
        ClientIdentity {
            alias: self.alias.clone(),
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
            subject: self.subject.clone(),
            serial_number: self.serial_number.clone(),
            not_after: self.not_after,
        }
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("alias", &self.alias)
            .field("subject", &self.subject)
            .field("serial_number", &self.serial_number)
            .field("not_after", &self.not_after)
            .field("chain_len", &self.cert_chain.len())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl ClientIdentity {
    /// Load the client identity from a key store.
    ///
    /// The store password opens the container; the key password opens the
    /// private key entry. With `alias` unset the store must hold exactly one
    /// private key entry.
    pub fn load(
        path: &Path,
        store_password: &Password,
        key_password: &Password,
        alias: Option<&str>,
        provider: &CryptoProvider,
    ) -> Result<Self> {
        let fail = |reason| Error::credential_load(StoreKind::KeyStore, path, reason);

        let bytes = read_store_file(path, StoreKind::KeyStore)?;
        let (format, contents) = open_store(&bytes, store_password.expose()).map_err(fail)?;
        if format == StoreFormat::Pem && !store_password.is_empty() {
            debug!("PEM key store {} ignores the store password", path.display());
        }

        let entry = select_key_entry(&contents.keys, alias).map_err(fail)?;
        let private_key = entry.decrypt(key_password.expose()).map_err(fail)?;

        let leaf = find_leaf(entry, &contents.certs, &private_key, provider).map_err(fail)?;
        let chain = if entry.chain.is_empty() {
            build_chain(leaf, &contents.certs)
        } else {
            entry.chain.clone()
        };

        let identity = Self::from_parts(entry.alias.clone(), chain, private_key).map_err(fail)?;

        if identity.is_expired() {
            warn!(
                "Client certificate {} expired at {}",
                identity.subject, identity.not_after
            );
        }

        info!(
            "Loaded client identity {} (chain of {}) from {:?} key store {}",
            identity.subject,
            identity.cert_chain.len(),
            format,
            path.display()
        );

        Ok(identity)
    }

    fn from_parts(
        alias: Option<String>,
        chain: Vec<Vec<u8>>,
        private_key: PrivateKeyDer<'static>,
    ) -> std::result::Result<Self, CredentialFailure> {
        let leaf_der = chain
            .first()
            .ok_or_else(|| CredentialFailure::MissingEntry("certificate chain is empty".into()))?;
        let leaf = Certificate::from_der(leaf_der)
            .map_err(|e| CredentialFailure::Malformed(format!("client certificate: {}", e)))?;
        let tbs = &leaf.tbs_certificate;

        let expiry_secs = tbs.validity.not_after.to_unix_duration().as_secs();
        let not_after = i64::try_from(expiry_secs)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Ok(ClientIdentity {
            alias,
            subject: tbs.subject.to_string(),
            serial_number: hex::encode(tbs.serial_number.as_bytes()),
            not_after,
            cert_chain: chain.into_iter().map(CertificateDer::from).collect(),
            private_key,
        })
    }

    /// Get the alias of the key entry, if the store names it
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Get the certificate chain, leaf first
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// Get the leaf certificate
    pub fn leaf_cert(&self) -> &CertificateDer<'static> {
        &self.cert_chain[0]
    }

    pub(crate) fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    /// Get the leaf certificate subject in RFC 4514 form
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Get the leaf certificate serial number as lowercase hex
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// Get the leaf certificate expiration time
    pub fn not_after(&self) -> &DateTime<Utc> {
        &self.not_after
    }

    /// Check if the leaf certificate has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.not_after
    }
}

fn select_key_entry<'a>(
    keys: &'a [KeyEntry],
    alias: Option<&str>,
) -> std::result::Result<&'a KeyEntry, CredentialFailure> {
    match alias {
        Some(alias) => keys
            .iter()
            .find(|entry| entry.matches_alias(alias))
            .ok_or_else(|| {
                CredentialFailure::MissingEntry(format!("no private key entry named '{}'", alias))
            }),
        None => match keys {
            [] => Err(CredentialFailure::MissingEntry("no private key entry".into())),
            [only] => Ok(only),
            many => Err(CredentialFailure::MissingEntry(format!(
                "store holds {} private key entries; set a key alias to choose one",
                many.len()
            ))),
        },
    }
}

/// Pick the certificate belonging to the key: by localKeyId, then by public key.
fn find_leaf(
    entry: &KeyEntry,
    certs: &[CertEntry],
    private_key: &PrivateKeyDer<'static>,
    provider: &CryptoProvider,
) -> std::result::Result<Vec<u8>, CredentialFailure> {
    if let Some(leaf) = entry.chain.first() {
        return Ok(leaf.clone());
    }

    if let Some(id) = &entry.local_key_id {
        if let Some(cert) = certs.iter().find(|c| c.local_key_id.as_ref() == Some(id)) {
            return Ok(cert.der.clone());
        }
    }

    let signing_key = provider
        .key_provider
        .load_private_key(private_key.clone_key())
        .map_err(|e| CredentialFailure::Rejected(format!("private key: {}", e)))?;

    if let Some(key_spki) = signing_key.public_key() {
        let found = certs.iter().find(|cert| {
            spki_der(&cert.der).is_some_and(|cert_spki| cert_spki == key_spki.as_ref())
        });
        if let Some(cert) = found {
            return Ok(cert.der.clone());
        }
    } else if let [only] = certs {
        return Ok(only.der.clone());
    }

    Err(CredentialFailure::MissingEntry(
        "no certificate matches the private key".into(),
    ))
}

/// Follow issuer links from the leaf through the store's other certificates.
fn build_chain(leaf: Vec<u8>, certs: &[CertEntry]) -> Vec<Vec<u8>> {
    let parsed: Vec<(&[u8], Certificate)> = certs
        .iter()
        .filter_map(|c| Certificate::from_der(&c.der).ok().map(|p| (c.der.as_slice(), p)))
        .collect();

    let mut chain = vec![leaf];
    while chain.len() < MAX_CHAIN_DEPTH {
        let Ok(current) = Certificate::from_der(&chain[chain.len() - 1]) else {
            break;
        };
        let issuer = &current.tbs_certificate.issuer;
        if *issuer == current.tbs_certificate.subject {
            break;
        }
        let next = parsed.iter().find(|(der, cert)| {
            cert.tbs_certificate.subject == *issuer && !chain.iter().any(|c| c.as_slice() == *der)
        });
        match next {
            Some((der, _)) => chain.push(der.to_vec()),
            None => break,
        }
    }
    chain
}

fn spki_der(cert_der: &[u8]) -> Option<Vec<u8>> {
    Certificate::from_der(cert_der)
        .ok()?
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_entry(alias: Option<&str>) -> KeyEntry {
        KeyEntry {
            alias: alias.map(String::from),
            local_key_id: None,
            chain: Vec::new(),
            protection: KeyProtection::Plain(Zeroizing::new(vec![0x30, 0x00])),
        }
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(StoreFormat::detect(&[0x30, 0x82, 0x01]), Some(StoreFormat::Pkcs12));
        assert_eq!(
            StoreFormat::detect(&[0xFE, 0xED, 0xFE, 0xED, 0, 0, 0, 2]),
            Some(StoreFormat::Jks)
        );
        assert_eq!(
            StoreFormat::detect(b"\n-----BEGIN CERTIFICATE-----\n"),
            Some(StoreFormat::Pem)
        );
        assert_eq!(StoreFormat::detect(b"hello"), None);
    }

    #[test]
    fn test_jceks_is_reported_unsupported() {
        let result = open_store(&[0xCE, 0xCE, 0xCE, 0xCE, 0, 0, 0, 2], "pw");
        assert!(matches!(result, Err(CredentialFailure::UnsupportedAlgorithm(_))));
    }

    #[test]
    fn test_select_key_entry() {
        let keys = vec![plain_entry(Some("client")), plain_entry(Some("backup"))];

        assert!(matches!(
            select_key_entry(&keys, None),
            Err(CredentialFailure::MissingEntry(_))
        ));
        let chosen = select_key_entry(&keys, Some("BACKUP")).unwrap();
        assert_eq!(chosen.alias.as_deref(), Some("backup"));
        assert!(select_key_entry(&keys, Some("missing")).is_err());
        assert!(select_key_entry(&[], None).is_err());

        let single = vec![plain_entry(None)];
        assert!(select_key_entry(&single, None).is_ok());
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let err = read_store_file(Path::new("/nonexistent/client.p12"), StoreKind::KeyStore)
            .unwrap_err();
        assert!(matches!(
            err.credential_failure(),
            Some(CredentialFailure::Unreadable(_))
        ));
    }

    #[test]
    fn test_identity_from_parts() {
        let params = rcgen::CertificateParams::new(vec!["client.rules.test".to_string()]);
        let cert = rcgen::Certificate::from_params(params).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

        let identity =
            ClientIdentity::from_parts(Some("client".into()), vec![cert.serialize_der().unwrap()], key)
                .unwrap();

        assert_eq!(identity.alias(), Some("client"));
        assert!(!identity.serial_number().is_empty());
        assert!(identity
            .serial_number()
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert!(!identity.is_expired());
    }
}
