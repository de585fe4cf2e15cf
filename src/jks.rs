//! Java KeyStore (JKS) decoding.
//!
//! JKS files are a flat big-endian record stream followed by a SHA-1 digest
//! keyed by the store password. Private key entries are wrapped by the
//! proprietary Sun key protector, a SHA-1 keystream keyed by the key password.

use crate::error::{CredentialFailure, PasswordKind};
use crate::keystore::{CertEntry, KeyEntry, KeyProtection, StoreContents};
use der::asn1::ObjectIdentifier;
use der::Decode;
use pkcs12::pbe_params::EncryptedPrivateKeyInfo;
use sha1::{Digest, Sha1};
use tracing::debug;
use zeroize::Zeroizing;

type DecodeResult<T> = std::result::Result<T, CredentialFailure>;

/// File signature of a JKS store
pub(crate) const MAGIC: [u8; 4] = [0xFE, 0xED, 0xFE, 0xED];
const JCEKS_MAGIC: [u8; 4] = [0xCE, 0xCE, 0xCE, 0xCE];
const WHITENER: &[u8] = b"Mighty Aphrodite";
const DIGEST_LEN: usize = 20;

const PRIVATE_KEY_TAG: u32 = 1;
const TRUSTED_CERT_TAG: u32 = 2;

const KEY_PROTECTOR: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.42.2.17.1.1");

/// Whether the bytes carry a JCEKS signature, which is not supported
pub(crate) fn is_jceks(bytes: &[u8]) -> bool {
    bytes.starts_with(&JCEKS_MAGIC)
}

/// Decode a JKS store and check its integrity digest against the store password.
pub(crate) fn decode(bytes: &[u8], store_password: &str) -> DecodeResult<StoreContents> {
    if bytes.len() < MAGIC.len() + 8 + DIGEST_LEN {
        return Err(CredentialFailure::Malformed("JKS file is truncated".into()));
    }
    let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);

    let mut reader = Reader::new(body);
    if reader.take(4)? != MAGIC {
        return Err(CredentialFailure::Malformed("not a JKS file".into()));
    }
    let version = reader.u32()?;
    if version != 1 && version != 2 {
        return Err(CredentialFailure::Malformed(format!(
            "unsupported JKS version {}",
            version
        )));
    }

    let count = reader.u32()?;
    let mut store = StoreContents::default();

    for _ in 0..count {
        match reader.u32()? {
            PRIVATE_KEY_TAG => {
                let alias = reader.utf()?;
                reader.u64()?;
                let key_len = reader.length()?;
                let protected = reader.take(key_len)?;

                let chain_len = reader.u32()?;
                let mut chain = Vec::new();
                for _ in 0..chain_len {
                    if let Some(der) = reader.certificate(version)? {
                        chain.push(der);
                    }
                }

                store.keys.push(KeyEntry {
                    alias: Some(alias),
                    local_key_id: None,
                    chain,
                    protection: KeyProtection::JksProtector(protected_key(protected)?),
                });
            }
            TRUSTED_CERT_TAG => {
                let alias = reader.utf()?;
                reader.u64()?;
                if let Some(der) = reader.certificate(version)? {
                    store.certs.push(CertEntry {
                        alias: Some(alias),
                        local_key_id: None,
                        der,
                    });
                }
            }
            tag => {
                return Err(CredentialFailure::Malformed(format!(
                    "unknown JKS entry tag {}",
                    tag
                )))
            }
        }
    }

    if !reader.is_empty() {
        return Err(CredentialFailure::Malformed(
            "trailing data before JKS digest".into(),
        ));
    }

    let mut hasher = Sha1::new();
    hasher.update(password_bytes(store_password));
    hasher.update(WHITENER);
    hasher.update(body);
    if hasher.finalize().as_slice() != digest {
        return Err(CredentialFailure::IncorrectPassword(PasswordKind::Store));
    }

    debug!(
        "Decoded JKS store with {} trusted certificate(s) and {} key(s)",
        store.certs.len(),
        store.keys.len()
    );

    Ok(store)
}

/// Undo the Sun key protector and return the PKCS#8 key encoding.
///
/// Layout: 20-byte salt, ciphertext, then SHA-1(password || plaintext).
pub(crate) fn recover_key(protected: &[u8], key_password: &str) -> DecodeResult<Zeroizing<Vec<u8>>> {
    if protected.len() < 2 * DIGEST_LEN {
        return Err(CredentialFailure::Malformed(
            "protected JKS key is truncated".into(),
        ));
    }
    let (salt, rest) = protected.split_at(DIGEST_LEN);
    let (ciphertext, check) = rest.split_at(rest.len() - DIGEST_LEN);

    let password = Zeroizing::new(password_bytes(key_password));
    let plaintext = Zeroizing::new(keystream_xor(&password, salt, ciphertext));

    let mut hasher = Sha1::new();
    hasher.update(password.as_slice());
    hasher.update(plaintext.as_slice());
    if hasher.finalize().as_slice() != check {
        return Err(CredentialFailure::IncorrectPassword(PasswordKind::Key));
    }

    Ok(plaintext)
}

fn keystream_xor(password: &[u8], salt: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut digest = salt.to_vec();
    for chunk in data.chunks(DIGEST_LEN) {
        let mut hasher = Sha1::new();
        hasher.update(password);
        hasher.update(&digest);
        digest = hasher.finalize().to_vec();
        out.extend(chunk.iter().zip(&digest).map(|(byte, key)| byte ^ key));
    }
    out
}

fn protected_key(der: &[u8]) -> DecodeResult<Vec<u8>> {
    let info = EncryptedPrivateKeyInfo::from_der(der)
        .map_err(|e| CredentialFailure::Malformed(e.to_string()))?;
    if info.encryption_algorithm.oid != KEY_PROTECTOR {
        return Err(CredentialFailure::UnsupportedAlgorithm(format!(
            "JKS key protection {}",
            info.encryption_algorithm.oid
        )));
    }
    Ok(info.encrypted_data.into_bytes())
}

/// Java passwords are hashed as big-endian UTF-16 code units.
fn password_bytes(password: &str) -> Vec<u8> {
    password
        .encode_utf16()
        .flat_map(|unit| unit.to_be_bytes())
        .collect()
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    fn take(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| CredentialFailure::Malformed("unexpected end of JKS data".into()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> DecodeResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> DecodeResult<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> DecodeResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> DecodeResult<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn length(&mut self) -> DecodeResult<usize> {
        usize::try_from(self.u32()?)
            .map_err(|_| CredentialFailure::Malformed("JKS length overflow".into()))
    }

    fn utf(&mut self) -> DecodeResult<String> {
        let len = usize::from(self.u16()?);
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CredentialFailure::Malformed("JKS alias is not valid UTF-8".into()))
    }

    /// Reads a certificate record, returning `None` for non-X.509 types.
    fn certificate(&mut self, version: u32) -> DecodeResult<Option<Vec<u8>>> {
        let cert_type = if version == 2 {
            self.utf()?
        } else {
            "X.509".to_string()
        };
        let len = self.length()?;
        let der = self.take(len)?.to_vec();
        if cert_type != "X.509" {
            debug!("Skipping JKS certificate of type {}", cert_type);
            return Ok(None);
        }
        Ok(Some(der))
    }
}
