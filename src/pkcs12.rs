//! PKCS#12 container decoding.
//!
//! A PKCS#12 file protects its contents at two levels. The store password
//! keys the integrity MAC and the encrypted safes holding certificates. Each
//! shrouded private key bag is encrypted separately, and Java-style stores let
//! that layer use its own key password. Decoding therefore happens in two
//! steps: [`decode`] opens the container with the store password and returns
//! key entries still encrypted, and [`decrypt_key`] later applies the key
//! password.

use crate::error::{CredentialFailure, PasswordKind};
use crate::keystore::{CertEntry, KeyEntry, KeyProtection, StoreContents};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, InnerIvInit, KeyIvInit};
use cms::cert::x509::spki::AlgorithmIdentifierOwned;
use cms::content_info::{CmsVersion, ContentInfo};
use cms::encrypted_data::EncryptedData;
use der::asn1::{BmpString, ContextSpecific, ObjectIdentifier, OctetString};
use der::{Decode, Encode};
use hmac::{Hmac, Mac};
use pkcs12::authenticated_safe::AuthenticatedSafe;
use pkcs12::cert_type::CertBag;
use pkcs12::kdf::{derive_key_utf8, Pkcs12KeyType};
use pkcs12::mac_data::MacData;
use pkcs12::pbe_params::{EncryptedPrivateKeyInfo, Pkcs12PbeParams};
use pkcs12::pfx::Pfx;
use pkcs12::safe_bag::{PrivateKeyInfo, SafeBag, SafeContents};
use pkcs5::pbes2;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use zeroize::Zeroizing;

type DecodeResult<T> = std::result::Result<T, CredentialFailure>;

pub(crate) mod oid {
    use der::asn1::ObjectIdentifier;

    pub const DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
    pub const ENCRYPTED_DATA: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.6");
    pub const PBES2: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.5.13");
    pub const PBE_SHA1_RC2_128: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.1.5");
    pub const PBE_SHA1_RC2_40: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.1.6");
    pub const PBE_SHA1_3DES_3KEY: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.1.3");
    pub const PBE_SHA1_3DES_2KEY: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.1.4");
    pub const SHA1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.14.3.2.26");
    pub const SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
    pub const KEY_BAG: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.10.1.1");
    pub const SHROUDED_KEY_BAG: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.10.1.2");
    pub const CERT_BAG: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.12.10.1.3");
    pub const X509_CERTIFICATE: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.22.1");
    pub const FRIENDLY_NAME: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.20");
    pub const LOCAL_KEY_ID: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.21");
}

/// Recover the PKCS#8 encoding of a shrouded key bag with the key password.
pub(crate) fn decrypt_key(
    algorithm: &AlgorithmIdentifierOwned,
    ciphertext: &[u8],
    key_password: &str,
) -> DecodeResult<Zeroizing<Vec<u8>>> {
    let plaintext = Zeroizing::new(
        decrypt(algorithm, ciphertext, key_password)
            .map_err(|e| rebrand_password(e, PasswordKind::Key))?,
    );

    // A wrong password can still yield validly padded garbage.
    if PrivateKeyInfo::from_der(&plaintext).is_err() {
        return Err(CredentialFailure::IncorrectPassword(PasswordKind::Key));
    }
    Ok(plaintext)
}

/// Open a container with the store password.
pub(crate) fn decode(der_bytes: &[u8], store_password: &str) -> DecodeResult<StoreContents> {
    let pfx = Pfx::from_der(der_bytes).map_err(malformed)?;

    if pfx.auth_safe.content_type != oid::DATA {
        return Err(CredentialFailure::UnsupportedAlgorithm(format!(
            "public-key integrity mode ({})",
            pfx.auth_safe.content_type
        )));
    }

    let auth_safe =
        OctetString::from_der(&pfx.auth_safe.content.to_der().map_err(malformed)?).map_err(malformed)?;

    match &pfx.mac_data {
        Some(mac_data) => verify_mac(mac_data, store_password, auth_safe.as_bytes())?,
        None => warn!("PKCS#12 container has no integrity MAC; contents are not authenticated"),
    }

    let safes = AuthenticatedSafe::from_der(auth_safe.as_bytes()).map_err(malformed)?;

    let mut store = StoreContents::default();
    for safe in &safes {
        let contents = open_safe(safe, store_password)?;
        collect_bags(contents, &mut store)?;
    }

    debug!(
        "Decoded PKCS#12 container with {} certificate(s) and {} key(s)",
        store.certs.len(),
        store.keys.len()
    );

    Ok(store)
}

fn verify_mac(mac_data: &MacData, password: &str, data: &[u8]) -> DecodeResult<()> {
    let salt = mac_data.mac_salt.as_bytes();
    let expected = mac_data.mac.digest.as_bytes();

    let verified = match mac_data.mac.algorithm.oid {
        oid::SHA1 => {
            let key = derive_key_utf8::<Sha1>(
                password,
                salt,
                Pkcs12KeyType::Mac,
                mac_data.iterations,
                <Sha1 as Digest>::output_size(),
            )
            .map_err(malformed)?;
            let mut mac = Hmac::<Sha1>::new_from_slice(&key)
                .map_err(|_| CredentialFailure::Malformed("invalid MAC key length".into()))?;
            mac.update(data);
            mac.verify_slice(expected).is_ok()
        }
        oid::SHA256 => {
            let key = derive_key_utf8::<Sha256>(
                password,
                salt,
                Pkcs12KeyType::Mac,
                mac_data.iterations,
                <Sha256 as Digest>::output_size(),
            )
            .map_err(malformed)?;
            let mut mac = Hmac::<Sha256>::new_from_slice(&key)
                .map_err(|_| CredentialFailure::Malformed("invalid MAC key length".into()))?;
            mac.update(data);
            mac.verify_slice(expected).is_ok()
        }
        other => {
            return Err(CredentialFailure::UnsupportedAlgorithm(format!(
                "MAC digest {}",
                other
            )))
        }
    };

    if verified {
        Ok(())
    } else {
        Err(CredentialFailure::IncorrectPassword(PasswordKind::Store))
    }
}

fn open_safe(safe: &ContentInfo, store_password: &str) -> DecodeResult<SafeContents> {
    let content = safe.content.to_der().map_err(malformed)?;

    match safe.content_type {
        oid::DATA => {
            let plaintext = OctetString::from_der(&content).map_err(malformed)?;
            SafeContents::from_der(plaintext.as_bytes()).map_err(malformed)
        }
        oid::ENCRYPTED_DATA => {
            let encrypted = EncryptedData::from_der(&content).map_err(malformed)?;
            if encrypted.version != CmsVersion::V0 {
                return Err(CredentialFailure::Malformed(
                    "unexpected EncryptedData version".into(),
                ));
            }
            let info = &encrypted.enc_content_info;
            let Some(ciphertext) = &info.encrypted_content else {
                return Ok(Vec::new());
            };
            let plaintext = decrypt(&info.content_enc_alg, ciphertext.as_bytes(), store_password)
                .map_err(|e| rebrand_password(e, PasswordKind::Store))?;

            // Garbage from a wrong password occasionally survives padding checks.
            SafeContents::from_der(&plaintext)
                .map_err(|_| CredentialFailure::IncorrectPassword(PasswordKind::Store))
        }
        other => Err(CredentialFailure::UnsupportedAlgorithm(format!(
            "safe content type {}",
            other
        ))),
    }
}

fn collect_bags(bags: SafeContents, store: &mut StoreContents) -> DecodeResult<()> {
    for bag in bags {
        let local_key_id = bag_attribute(&oid::LOCAL_KEY_ID, &bag)
            .and_then(|raw| OctetString::from_der(&raw).ok())
            .map(|id| id.into_bytes());
        let friendly_name = bag_attribute(&oid::FRIENDLY_NAME, &bag)
            .and_then(|raw| BmpString::from_der(&raw).ok())
            .map(|name| name.to_string());

        match bag.bag_id {
            oid::CERT_BAG => {
                let cert_bag: ContextSpecific<CertBag> =
                    ContextSpecific::from_der(&bag.bag_value).map_err(malformed)?;
                if cert_bag.value.cert_id != oid::X509_CERTIFICATE {
                    debug!("Skipping non-X.509 certificate bag {}", cert_bag.value.cert_id);
                    continue;
                }
                store.certs.push(CertEntry {
                    alias: friendly_name,
                    local_key_id,
                    der: cert_bag.value.cert_value.into_bytes(),
                });
            }
            oid::SHROUDED_KEY_BAG => {
                let shrouded: ContextSpecific<EncryptedPrivateKeyInfo> =
                    ContextSpecific::from_der(&bag.bag_value).map_err(malformed)?;
                store.keys.push(KeyEntry {
                    alias: friendly_name,
                    local_key_id,
                    chain: Vec::new(),
                    protection: KeyProtection::Shrouded {
                        algorithm: shrouded.value.encryption_algorithm,
                        ciphertext: shrouded.value.encrypted_data.into_bytes(),
                    },
                });
            }
            oid::KEY_BAG => {
                let plain: ContextSpecific<der::Any> =
                    ContextSpecific::from_der(&bag.bag_value).map_err(malformed)?;
                store.keys.push(KeyEntry {
                    alias: friendly_name,
                    local_key_id,
                    chain: Vec::new(),
                    protection: KeyProtection::Plain(Zeroizing::new(
                        plain.value.to_der().map_err(malformed)?,
                    )),
                });
            }
            other => debug!("Ignoring PKCS#12 bag type {}", other),
        }
    }
    Ok(())
}

fn bag_attribute(oid: &ObjectIdentifier, bag: &SafeBag) -> Option<Vec<u8>> {
    bag.bag_attributes.as_ref().and_then(|attrs| {
        attrs
            .iter()
            .find(|attr| attr.oid == *oid)
            .and_then(|attr| attr.values.iter().next())
            .and_then(|value| value.to_der().ok())
    })
}

fn decrypt(alg: &AlgorithmIdentifierOwned, data: &[u8], password: &str) -> DecodeResult<Vec<u8>> {
    match alg.oid {
        oid::PBES2 => decrypt_pbes2(alg, data, password),
        oid::PBE_SHA1_3DES_3KEY
        | oid::PBE_SHA1_3DES_2KEY
        | oid::PBE_SHA1_RC2_128
        | oid::PBE_SHA1_RC2_40 => decrypt_legacy(alg, data, password),
        other => Err(CredentialFailure::UnsupportedAlgorithm(format!(
            "encryption scheme {}",
            other
        ))),
    }
}

fn decrypt_pbes2(alg: &AlgorithmIdentifierOwned, data: &[u8], password: &str) -> DecodeResult<Vec<u8>> {
    let params = alg
        .parameters
        .as_ref()
        .ok_or_else(|| CredentialFailure::Malformed("PBES2 parameters missing".into()))?
        .to_der()
        .map_err(malformed)?;
    let params = pbes2::Parameters::from_der(&params).map_err(|e| match e.kind() {
        der::ErrorKind::OidUnknown { oid } => {
            CredentialFailure::UnsupportedAlgorithm(format!("PBES2 component {}", oid))
        }
        _ => malformed(e),
    })?;

    // pkcs5 reports bad padding after decryption as EncryptFailed
    params.decrypt(password.as_bytes(), data).map_err(|e| match e {
        pkcs5::Error::DecryptFailed | pkcs5::Error::EncryptFailed => {
            CredentialFailure::IncorrectPassword(PasswordKind::Store)
        }
        pkcs5::Error::UnsupportedAlgorithm { oid } => {
            CredentialFailure::UnsupportedAlgorithm(format!("PBES2 component {}", oid))
        }
        other => CredentialFailure::Malformed(other.to_string()),
    })
}

/// PKCS#12 v1 password-based encryption (RFC 7292 appendix B/C), the layout
/// written by OpenSSL 1.x and older Java releases.
fn decrypt_legacy(alg: &AlgorithmIdentifierOwned, data: &[u8], password: &str) -> DecodeResult<Vec<u8>> {
    let params = alg
        .parameters
        .as_ref()
        .ok_or_else(|| CredentialFailure::Malformed("PBE parameters missing".into()))?
        .to_der()
        .map_err(malformed)?;
    let params = Pkcs12PbeParams::from_der(&params).map_err(malformed)?;
    let salt = params.salt.as_bytes();

    let derive = |kind, len| {
        derive_key_utf8::<Sha1>(password, salt, kind, params.iterations, len)
            .map(Zeroizing::new)
            .map_err(malformed)
    };
    let key_len = match alg.oid {
        oid::PBE_SHA1_3DES_3KEY => 24,
        oid::PBE_SHA1_3DES_2KEY | oid::PBE_SHA1_RC2_128 => 16,
        _ => 5,
    };
    let key = derive(Pkcs12KeyType::EncryptionKey, key_len)?;
    let iv = derive(Pkcs12KeyType::Iv, 8)?;

    let plaintext = match alg.oid {
        oid::PBE_SHA1_3DES_3KEY => cbc::Decryptor::<des::TdesEde3>::new_from_slices(&key, &iv)
            .map_err(|_| CredentialFailure::Malformed("invalid 3DES key".into()))?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        oid::PBE_SHA1_3DES_2KEY => cbc::Decryptor::<des::TdesEde2>::new_from_slices(&key, &iv)
            .map_err(|_| CredentialFailure::Malformed("invalid 3DES key".into()))?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        _ => {
            let cipher = rc2::Rc2::new_with_eff_key_len(&key, key_len * 8);
            cbc::Decryptor::<rc2::Rc2>::inner_iv_slice_init(cipher, &iv)
                .map_err(|_| CredentialFailure::Malformed("invalid RC2 IV".into()))?
                .decrypt_padded_vec_mut::<Pkcs7>(data)
        }
    };

    plaintext.map_err(|_| CredentialFailure::IncorrectPassword(PasswordKind::Store))
}

fn rebrand_password(failure: CredentialFailure, kind: PasswordKind) -> CredentialFailure {
    match failure {
        CredentialFailure::IncorrectPassword(_) => CredentialFailure::IncorrectPassword(kind),
        other => other,
    }
}

fn malformed(err: der::Error) -> CredentialFailure {
    CredentialFailure::Malformed(err.to_string())
}
