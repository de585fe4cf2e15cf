//! Shared fixtures: an in-memory CA, store writers and an mTLS test server
#![allow(dead_code)]

use bytes::Bytes;
use cms::cert::x509::attr::{Attribute, AttributeValue, Attributes};
use cms::cert::x509::spki::AlgorithmIdentifierOwned;
use cms::content_info::{CmsVersion, ContentInfo};
use cms::encrypted_data::EncryptedData;
use cms::enveloped_data::EncryptedContentInfo;
use der::asn1::{BmpString, ObjectIdentifier, OctetString, OctetStringRef, SetOfVec};
use der::{Any, Decode, Encode};
use hmac::{Hmac, Mac};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use pkcs12::cert_type::CertBag;
use pkcs12::digest_info::DigestInfo;
use pkcs12::kdf::{derive_key_utf8, Pkcs12KeyType};
use pkcs12::mac_data::MacData;
use pkcs12::pbe_params::EncryptedPrivateKeyInfo;
use pkcs12::pfx::{Pfx, Version};
use pkcs12::safe_bag::SafeBag;
use pkcs5::pbes2;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa};
use rules_mtls_client::CredentialMaterial;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

const DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
const ENCRYPTED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.6");
const PBES2: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.5.13");
const SHA256_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
const X509_CERTIFICATE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.22.1");
const FRIENDLY_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.20");
const LOCAL_KEY_ID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.21");

const PBKDF2_ITERATIONS: u32 = 2048;
const MAC_ITERATIONS: i32 = 2048;

pub const STORE_PASSWORD: &str = "pw1";
pub const KEY_PASSWORD: &str = "pw2";
pub const TRUST_PASSWORD: &str = "pw3";

static INIT: Once = Once::new();

/// Install a test subscriber honouring RUST_LOG
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A certificate and its PKCS#8 key
pub struct Issued {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl Issued {
    pub fn cert(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }

    pub fn key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

/// A self-signed certificate authority
pub struct TestCa {
    ca: rcgen::Certificate,
    pub cert_der: Vec<u8>,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new());
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = rcgen::Certificate::from_params(params).unwrap();
        let cert_der = ca.serialize_der().unwrap();
        TestCa { ca, cert_der }
    }

    /// Issue a certificate for the given DNS names or IP literals
    pub fn issue(&self, common_name: &str, names: &[&str]) -> Issued {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let mut params = CertificateParams::new(names);
        params.distinguished_name.push(DnType::CommonName, common_name);
        let cert = rcgen::Certificate::from_params(params).unwrap();
        Issued {
            cert_der: cert.serialize_der_with_signer(&self.ca).unwrap(),
            key_der: cert.serialize_private_key_der(),
        }
    }

    pub fn cert(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }
}

/// One private key entry of a PKCS#12 store
pub struct KeyEntry<'a> {
    pub alias: &'a str,
    pub chain: Vec<Vec<u8>>,
    pub key_der: &'a [u8],
}

fn attribute(oid: ObjectIdentifier, value_der: Vec<u8>) -> Attribute {
    Attribute {
        oid,
        values: SetOfVec::<AttributeValue>::from_iter([Any::from_der(&value_der).unwrap()]).unwrap(),
    }
}

fn bag_attributes(alias: Option<&str>, local_key_id: Option<&[u8]>) -> Attributes {
    let mut attrs = Attributes::new();
    if let Some(alias) = alias {
        let name = BmpString::from_utf8(alias).unwrap().to_der().unwrap();
        attrs.insert(attribute(FRIENDLY_NAME, name)).unwrap();
    }
    if let Some(id) = local_key_id {
        let id = OctetStringRef::new(id).unwrap().to_der().unwrap();
        attrs.insert(attribute(LOCAL_KEY_ID, id)).unwrap();
    }
    attrs
}

fn pbes2_encrypt(data: &[u8], password: &str, salt_seed: u8) -> (AlgorithmIdentifierOwned, Vec<u8>) {
    let salt = [salt_seed; 32];
    let iv = [salt_seed.wrapping_add(1); 16];
    let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(PBKDF2_ITERATIONS, &salt, &iv).unwrap();
    let encrypted = params.encrypt(password.as_bytes(), data).unwrap();
    let algorithm = AlgorithmIdentifierOwned {
        oid: PBES2,
        parameters: Some(Any::from_der(&params.to_der().unwrap()).unwrap()),
    };
    (algorithm, encrypted)
}

/// Write a PKCS#12 store in the layout Java and OpenSSL produce: certificates
/// in a safe encrypted with the store password, each key shrouded with the
/// key password, and an HMAC-SHA256 integrity MAC keyed by the store password.
pub fn pkcs12_store(entries: &[KeyEntry<'_>], store_password: &str, key_password: &str) -> Vec<u8> {
    let mut cert_bags = Vec::new();
    let mut key_bags = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        let local_key_id = (i as u32 + 1).to_be_bytes();

        for (n, cert) in entry.chain.iter().enumerate() {
            let (alias, id) = if n == 0 {
                (Some(entry.alias), Some(&local_key_id[..]))
            } else {
                (None, None)
            };
            let bag = CertBag {
                cert_id: X509_CERTIFICATE,
                cert_value: OctetString::new(cert.clone()).unwrap(),
            };
            cert_bags.push(SafeBag {
                bag_id: pkcs12::PKCS_12_CERT_BAG_OID,
                bag_value: bag.to_der().unwrap(),
                bag_attributes: Some(bag_attributes(alias, id)),
            });
        }

        let (algorithm, encrypted) = pbes2_encrypt(entry.key_der, key_password, 40 + i as u8);
        let shrouded = EncryptedPrivateKeyInfo {
            encryption_algorithm: algorithm,
            encrypted_data: OctetString::new(encrypted).unwrap(),
        };
        key_bags.push(SafeBag {
            bag_id: pkcs12::PKCS_12_PKCS8_KEY_BAG_OID,
            bag_value: shrouded.to_der().unwrap(),
            bag_attributes: Some(bag_attributes(Some(entry.alias), Some(&local_key_id))),
        });
    }

    let (algorithm, encrypted) = pbes2_encrypt(&cert_bags.to_der().unwrap(), store_password, 7);
    let encrypted_data = EncryptedData {
        version: CmsVersion::V0,
        enc_content_info: EncryptedContentInfo {
            content_type: DATA,
            content_enc_alg: algorithm,
            encrypted_content: Some(OctetString::new(encrypted).unwrap()),
        },
        unprotected_attrs: None,
    };
    let certs_safe = ContentInfo {
        content_type: ENCRYPTED_DATA,
        content: Any::from_der(&encrypted_data.to_der().unwrap()).unwrap(),
    };
    let keys_safe = ContentInfo {
        content_type: DATA,
        content: Any::from_der(
            &OctetString::new(key_bags.to_der().unwrap())
                .unwrap()
                .to_der()
                .unwrap(),
        )
        .unwrap(),
    };

    let safes = vec![certs_safe, keys_safe].to_der().unwrap();
    let auth_safe = ContentInfo {
        content_type: DATA,
        content: Any::from_der(&OctetString::new(safes.clone()).unwrap().to_der().unwrap()).unwrap(),
    };

    let salt = [5u8; 32];
    let mac_key = derive_key_utf8::<Sha256>(
        store_password,
        &salt,
        Pkcs12KeyType::Mac,
        MAC_ITERATIONS,
        <Sha256 as Digest>::output_size(),
    )
    .unwrap();
    let mut mac = Hmac::<Sha256>::new_from_slice(&mac_key).unwrap();
    mac.update(&safes);
    let mac_data = MacData {
        mac: DigestInfo {
            algorithm: AlgorithmIdentifierOwned {
                oid: SHA256_OID,
                parameters: None,
            },
            digest: OctetString::new(mac.finalize().into_bytes().to_vec()).unwrap(),
        },
        mac_salt: OctetString::new(salt.to_vec()).unwrap(),
        iterations: MAC_ITERATIONS,
    };

    Pfx {
        version: Version::V3,
        auth_safe,
        mac_data: Some(mac_data),
    }
    .to_der()
    .unwrap()
}

fn push_utf(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn java_password(password: &str) -> Vec<u8> {
    password.encode_utf16().flat_map(|u| u.to_be_bytes()).collect()
}

/// Write a JKS trust store holding trusted certificate entries
pub fn jks_trust_store(certs: &[(&str, &[u8])], password: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0xFE, 0xED, 0xFE, 0xED]);
    out.extend_from_slice(&2u32.to_be_bytes());
    out.extend_from_slice(&(certs.len() as u32).to_be_bytes());
    for (alias, der) in certs {
        out.extend_from_slice(&2u32.to_be_bytes());
        push_utf(&mut out, alias);
        out.extend_from_slice(&1_700_000_000_000u64.to_be_bytes());
        push_utf(&mut out, "X.509");
        out.extend_from_slice(&(der.len() as u32).to_be_bytes());
        out.extend_from_slice(der);
    }

    let mut hasher = Sha1::new();
    hasher.update(java_password(password));
    hasher.update(b"Mighty Aphrodite");
    hasher.update(&out);
    let digest = hasher.finalize();
    out.extend_from_slice(&digest);
    out
}

/// Key store and trust store files written to a temporary directory
pub struct StoreFiles {
    pub dir: tempfile::TempDir,
    pub key_store: PathBuf,
    pub trust_store: PathBuf,
}

impl StoreFiles {
    pub fn material(&self) -> CredentialMaterial {
        CredentialMaterial::new(
            &self.key_store,
            STORE_PASSWORD,
            KEY_PASSWORD,
            &self.trust_store,
            TRUST_PASSWORD,
        )
    }

    pub fn write(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }
}

/// The standard layout: `client.p12` (pw1 / pw2) and `truststore.jks` (pw3)
pub fn write_stores(ca: &TestCa, client: &Issued) -> StoreFiles {
    let dir = tempfile::tempdir().unwrap();
    let key_store = dir.path().join("client.p12");
    let trust_store = dir.path().join("truststore.jks");

    let p12 = pkcs12_store(
        &[KeyEntry {
            alias: "client",
            chain: vec![client.cert_der.clone(), ca.cert_der.clone()],
            key_der: &client.key_der,
        }],
        STORE_PASSWORD,
        KEY_PASSWORD,
    );
    std::fs::write(&key_store, p12).unwrap();
    std::fs::write(&trust_store, jks_trust_store(&[("rules-ca", &ca.cert_der)], TRUST_PASSWORD))
        .unwrap();

    StoreFiles {
        dir,
        key_store,
        trust_store,
    }
}

/// Counters observed by the test server
#[derive(Default)]
pub struct ServerStats {
    pub accepted: AtomicUsize,
    pub open: AtomicUsize,
    pub peak_open: AtomicUsize,
    pub client_certs: AtomicUsize,
}

/// HTTPS server requiring client certificates issued by `client_ca`
pub struct TestServer {
    pub addr: SocketAddr,
    pub stats: Arc<ServerStats>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("https://{}{}", self.addr, path)
    }

    pub fn url_for_host(&self, host: &str, path: &str) -> String {
        format!("https://{}:{}{}", host, self.addr.port(), path)
    }

    pub fn open_connections(&self) -> usize {
        self.stats.open.load(Ordering::SeqCst)
    }

    pub fn peak_connections(&self) -> usize {
        self.stats.peak_open.load(Ordering::SeqCst)
    }

    pub fn accepted_connections(&self) -> usize {
        self.stats.accepted.load(Ordering::SeqCst)
    }
}

/// Start a server presenting `identity` and trusting clients signed by `client_ca`.
///
/// `GET /rules` answers with JSON; a `delay_ms` query parameter holds the
/// response back.
pub async fn start_server(identity: &Issued, client_ca: &TestCa) -> TestServer {
    start_server_with_lifetime(identity, client_ca, None).await
}

/// Like [`start_server`], but drops every connection once `lifetime` elapses,
/// idle or not.
pub async fn start_server_with_lifetime(
    identity: &Issued,
    client_ca: &TestCa,
    lifetime: Option<Duration>,
) -> TestServer {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut roots = RootCertStore::empty();
    roots.add(client_ca.cert()).unwrap();
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .unwrap();
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![identity.cert()], identity.key())
        .unwrap();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(ServerStats::default());

    let server_stats = stats.clone();
    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            let stats = server_stats.clone();
            tokio::spawn(async move {
                stats.accepted.fetch_add(1, Ordering::SeqCst);
                let now = stats.open.fetch_add(1, Ordering::SeqCst) + 1;
                stats.peak_open.fetch_max(now, Ordering::SeqCst);

                if let Ok(tls) = acceptor.accept(tcp).await {
                    let presented = tls
                        .get_ref()
                        .1
                        .peer_certificates()
                        .map_or(0, |certs| certs.len());
                    if presented > 0 {
                        stats.client_certs.fetch_add(1, Ordering::SeqCst);
                    }
                    let service = service_fn(move |req| handle(req, presented));
                    let serving = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(tls), service);
                    match lifetime {
                        Some(lifetime) => {
                            let _ = tokio::time::timeout(lifetime, serving).await;
                        }
                        None => {
                            let _ = serving.await;
                        }
                    }
                }

                stats.open.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    TestServer { addr, stats }
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    presented: usize,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let delay = req
        .uri()
        .query()
        .and_then(|q| q.strip_prefix("delay_ms="))
        .and_then(|ms| ms.parse::<u64>().ok());
    if let Some(ms) = delay {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = serde_json::json!({
        "path": req.uri().path(),
        "host": host,
        "client_chain_len": presented,
        "rules": ["allow-eu", "deny-expired"],
    });

    Ok(Response::builder()
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap())
}

pub fn path_string(path: &Path) -> String {
    path.display().to_string()
}
