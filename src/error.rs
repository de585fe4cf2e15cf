//! Error types for the rules mTLS client

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which credential store an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// The store holding the client certificate and private key
    KeyStore,
    /// The store holding trusted certificate authorities
    TrustStore,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::KeyStore => f.write_str("key store"),
            StoreKind::TrustStore => f.write_str("trust store"),
        }
    }
}

/// Which secret was rejected while opening a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordKind {
    /// Password protecting the container integrity and certificate safes
    Store,
    /// Password protecting an individual private key entry
    Key,
}

impl fmt::Display for PasswordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PasswordKind::Store => f.write_str("store"),
            PasswordKind::Key => f.write_str("key"),
        }
    }
}

/// Reason a credential store could not be turned into usable material
#[derive(Error, Debug)]
pub enum CredentialFailure {
    /// The file is missing or cannot be read
    #[error("file could not be read: {0}")]
    Unreadable(#[source] std::io::Error),

    /// A password did not unlock the store
    #[error("incorrect {0} password")]
    IncorrectPassword(PasswordKind),

    /// The file is not a well-formed store
    #[error("malformed store: {0}")]
    Malformed(String),

    /// The store is well formed but lacks a required entry
    #[error("missing entry: {0}")]
    MissingEntry(String),

    /// The store uses an algorithm this crate does not implement
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The decoded material was refused by the TLS stack
    #[error("material rejected: {0}")]
    Rejected(String),
}

/// Main error type for the rules mTLS client
#[derive(Error, Debug)]
pub enum Error {
    /// Key or trust material could not be loaded. Fatal at startup.
    #[error("Failed to load {store} {}: {reason}", .path.display())]
    CredentialLoad {
        /// Store that failed
        store: StoreKind,
        /// Path of the store file
        path: PathBuf,
        /// What went wrong
        #[source]
        reason: CredentialFailure,
    },

    /// Pool bounds are zero or inconsistent
    #[error("Invalid connection pool configuration: {0}")]
    InvalidPoolConfiguration(String),

    /// The peer certificate or its hostname was rejected during the TLS handshake
    #[error("TLS handshake with {host} failed: {source}")]
    Handshake {
        /// Host the client tried to reach
        host: String,
        /// Rejection reported by rustls
        #[source]
        source: rustls::Error,
    },

    /// No connection slot became available in time
    #[error("Connection pool exhausted for {route}")]
    PoolExhausted {
        /// Route the request targeted
        route: String,
    },

    /// The request did not complete within its deadline
    #[error("Request to {route} timed out after {timeout:?}")]
    RequestTimeout {
        /// Route the request targeted
        route: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// TCP connection could not be established
    #[error("Failed to connect to {route}: {source}")]
    Connect {
        /// Route the request targeted
        route: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// TLS configuration could not be assembled
    #[error("TLS configuration error: {0}")]
    TlsError(String),

    /// HTTP protocol error on an established connection
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// The server answered with a status the caller did not accept
    #[error("Unexpected HTTP status {status} from {url}")]
    UnexpectedStatus {
        /// Requested URL
        url: String,
        /// Status returned by the server
        status: http::StatusCode,
    },

    /// The request cannot be sent by this client
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Settings could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Neither the configured nor the default JSON document could be read
    #[error("Default JSON document {} could not be loaded: {reason}", .path.display())]
    DefaultJsonMissing {
        /// Default document path
        path: PathBuf,
        /// Why reading or parsing it failed
        reason: String,
    },

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Network or I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),
}

/// Convenience type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a CredentialLoad error for the given store file
    pub fn credential_load(
        store: StoreKind,
        path: impl Into<PathBuf>,
        reason: CredentialFailure,
    ) -> Self {
        Self::CredentialLoad {
            store,
            path: path.into(),
            reason,
        }
    }

    /// Create an InvalidPoolConfiguration error with detailed message
    pub fn invalid_pool(msg: impl Into<String>) -> Self {
        Self::InvalidPoolConfiguration(msg.into())
    }

    /// Create a TlsError with detailed message
    pub fn tls_error(msg: impl Into<String>) -> Self {
        Self::TlsError(msg.into())
    }

    /// Create a Config error with detailed message
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether a caller may retry the failed request after backing off.
    ///
    /// Handshake failures are never transient: retrying a rejected trust
    /// decision requires operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted { .. } | Error::RequestTimeout { .. } | Error::Connect { .. }
        )
    }

    /// Returns the credential failure reason when this is a load error
    pub fn credential_failure(&self) -> Option<&CredentialFailure> {
        match self {
            Error::CredentialLoad { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
