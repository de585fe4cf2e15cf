//! Service settings and client bootstrap

use crate::client::{build_client_with_options, ClientOptions, SecureClient};
use crate::error::{Error, Result};
use crate::pool::PoolPolicy;
use crate::secret::Password;
use crate::tls::{load_tls_context, CredentialMaterial};
use crate::verifier::HostnameVerification;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Prefix of environment variables overriding file settings,
/// e.g. `RULES_CLIENT__SSL__KEY_STORE_PASSWORD`
pub const ENV_PREFIX: &str = "RULES_CLIENT";

/// Default for both pool bounds
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Key and trust store settings
#[derive(Clone, Debug, Deserialize)]
pub struct SslSettings {
    /// Key store path
    pub key_store: PathBuf,
    /// Key store password
    pub key_store_password: Password,
    /// Private key password
    pub key_password: Password,
    /// Trust store path
    pub trust_store: PathBuf,
    /// Trust store password
    #[serde(default)]
    pub trust_store_password: Password,
    /// Key entry to use when the key store holds several
    #[serde(default)]
    pub key_alias: Option<String>,
}

/// Hostname policy selectable from configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostnameMode {
    /// Certificate must name the host
    #[default]
    Strict,
    /// Any certificate chaining to a trust anchor is accepted
    Permissive,
}

/// Settings of a service calling the rules endpoint
#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    /// Credential stores
    pub ssl: SslSettings,
    /// Size used for both pool bounds unless overridden
    #[serde(default = "default_pool_size")]
    pub connection_pool_size: usize,
    /// Overrides the per-route bound
    #[serde(default)]
    pub max_per_route: Option<usize>,
    /// Overrides the total bound
    #[serde(default)]
    pub max_total: Option<usize>,
    /// Hostname policy
    #[serde(default)]
    pub hostname_verification: HostnameMode,
    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Whole-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Wait for a pool slot in milliseconds; unset waits indefinitely
    #[serde(default)]
    pub pool_acquire_timeout_ms: Option<u64>,
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_connect_timeout_ms() -> u64 {
    crate::client::DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

fn default_request_timeout_ms() -> u64 {
    crate::client::DEFAULT_REQUEST_TIMEOUT.as_millis() as u64
}

impl Settings {
    /// Load settings from an optional TOML or JSON file, then apply
    /// `RULES_CLIENT__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub(crate) fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            // Values stay strings; typed fields convert on deserialization
            ::config::Environment::with_prefix(env_prefix).separator("__"),
        );

        let settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::config_error(format!("Failed to load settings: {}", e)))?;

        match path {
            Some(path) => info!("Loaded settings from {}", path.display()),
            None => info!("Loaded settings from environment"),
        }

        Ok(settings)
    }

    /// Pool bounds after applying the optional overrides
    pub fn pool_policy(&self) -> PoolPolicy {
        let policy = PoolPolicy::new(
            self.max_per_route.unwrap_or(self.connection_pool_size),
            self.max_total.unwrap_or(self.connection_pool_size),
        );
        match self.pool_acquire_timeout_ms {
            Some(ms) => policy.with_acquire_timeout(Duration::from_millis(ms)),
            None => policy,
        }
    }

    /// Client timeouts
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    /// Hostname policy
    pub fn hostname_verification(&self) -> HostnameVerification {
        match self.hostname_verification {
            HostnameMode::Strict => HostnameVerification::Strict,
            HostnameMode::Permissive => {
                warn!("Hostname verification is permissive; server names are not checked");
                HostnameVerification::Permissive
            }
        }
    }

    /// Credential material described by the `[ssl]` table
    pub fn credential_material(&self) -> CredentialMaterial {
        let ssl = &self.ssl;
        let material = CredentialMaterial::new(
            ssl.key_store.clone(),
            ssl.key_store_password.clone(),
            ssl.key_password.clone(),
            ssl.trust_store.clone(),
            ssl.trust_store_password.clone(),
        );
        match &ssl.key_alias {
            Some(alias) => material.with_key_alias(alias.clone()),
            None => material,
        }
    }
}

/// Load credentials and build the client described by `settings`
pub fn bootstrap(settings: &Settings) -> Result<SecureClient> {
    let context = load_tls_context(&settings.credential_material())?;
    build_client_with_options(
        &context,
        settings.hostname_verification(),
        settings.pool_policy(),
        settings.client_options(),
    )
}
