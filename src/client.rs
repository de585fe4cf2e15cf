//! Pooled HTTPS client presenting the loaded client certificate

use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, Lease, PoolPolicy, PoolStats, Poolable, Route};
use crate::tls::TlsContext;
use crate::verifier::HostnameVerification;
use bytes::Bytes;
use http::header::{HeaderValue, ACCEPT, HOST};
use http::{HeaderMap, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use serde::de::DeserializeOwned;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, trace};
use url::Url;

/// Default TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for a whole request once a pool slot is held
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeouts applied by a [`SecureClient`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientOptions {
    /// Limit on establishing the TCP connection
    pub connect_timeout: Duration,
    /// Limit on connecting, handshaking, sending and reading the response
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

struct PooledConnection {
    sender: SendRequest<Full<Bytes>>,
}

impl Poolable for PooledConnection {
    fn is_reusable(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// A fully read HTTP response
#[derive(Clone, Debug)]
pub struct SecureResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl SecureResponse {
    /// Response status
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Response body
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response, returning the body
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body decoded as UTF-8, replacing invalid sequences
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body decoded as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

struct ClientInner {
    connector: TlsConnector,
    pool: ConnectionPool<PooledConnection>,
    options: ClientOptions,
    hostname: HostnameVerification,
}

/// HTTPS client that authenticates with the client certificate of its
/// [`TlsContext`] and reuses connections within the bounds of its
/// [`PoolPolicy`].
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct SecureClient {
    inner: Arc<ClientInner>,
}

/// Build a client with default timeouts
pub fn build_client(
    context: &TlsContext,
    hostname: HostnameVerification,
    pool: PoolPolicy,
) -> Result<SecureClient> {
    build_client_with_options(context, hostname, pool, ClientOptions::default())
}

/// Build a client. No connection is opened until the first request.
pub fn build_client_with_options(
    context: &TlsContext,
    hostname: HostnameVerification,
    pool: PoolPolicy,
    options: ClientOptions,
) -> Result<SecureClient> {
    pool.validate()?;

    let config = context.client_config(&hostname)?;
    let connector = TlsConnector::from(Arc::new(config));

    info!(
        "Created mTLS client for {} (pool {}/{} per route/total, {:?} hostname verification)",
        context.identity().subject(),
        pool.max_per_route,
        pool.max_total,
        hostname
    );

    Ok(SecureClient {
        inner: Arc::new(ClientInner {
            connector,
            pool: ConnectionPool::new(pool),
            options,
            hostname,
        }),
    })
}

impl SecureClient {
    /// Send a request to an absolute `https` URI and read the whole response
    pub async fn execute(&self, request: Request<Bytes>) -> Result<SecureResponse> {
        let route = Route::from_uri(request.uri())?;
        let request = into_origin_form(request)?;

        let mut lease = self.inner.pool.acquire(&route).await?;
        trace!(reused = lease.is_reused(), "Acquired connection slot for {}", route);

        let timeout = self.inner.options.request_timeout;
        match tokio::time::timeout(timeout, self.exchange(&mut lease, &route, request)).await {
            Ok(Ok(response)) => {
                lease.release();
                Ok(response)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!("Request to {} timed out after {:?}", route, timeout);
                Err(Error::RequestTimeout {
                    route: route.to_string(),
                    timeout,
                })
            }
        }
    }

    /// GET a URL
    pub async fn get(&self, url: &str) -> Result<SecureResponse> {
        let url = Url::parse(url)?;
        let request = Request::get(url.as_str())
            .body(Bytes::new())
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
        self.execute(request).await
    }

    /// GET a URL and decode a successful JSON response
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let url = Url::parse(url)?;
        let request = Request::get(url.as_str())
            .header(ACCEPT, "application/json")
            .body(Bytes::new())
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;

        let response = self.execute(request).await?;
        if !response.status().is_success() {
            return Err(Error::UnexpectedStatus {
                url: url.to_string(),
                status: response.status(),
            });
        }
        response.json()
    }

    /// Current pool occupancy
    pub fn pool_state(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Pool bounds this client enforces
    pub fn pool_policy(&self) -> &PoolPolicy {
        self.inner.pool.policy()
    }

    /// Timeouts this client applies
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Hostname policy this client applies
    pub fn hostname_verification(&self) -> &HostnameVerification {
        &self.inner.hostname
    }

    async fn exchange(
        &self,
        lease: &mut Lease<PooledConnection>,
        route: &Route,
        request: Request<Full<Bytes>>,
    ) -> Result<SecureResponse> {
        let reusable = match lease.take_connection() {
            Some(mut conn) => match conn.sender.ready().await {
                Ok(()) => Some(conn),
                Err(e) => {
                    debug!("Idle connection to {} is unusable, reconnecting: {}", route, e);
                    None
                }
            },
            None => None,
        };
        let reused = reusable.is_some();
        let mut conn = match reusable {
            Some(conn) => conn,
            None => self.connect(route).await?,
        };

        let response = match conn.sender.try_send_request(request).await {
            Ok(response) => response,
            Err(mut failed) => match failed.take_message() {
                // The peer closed the idle connection before the request was written
                Some(request) if reused => {
                    debug!(
                        "Reused connection to {} closed before sending, reconnecting: {}",
                        route,
                        failed.error()
                    );
                    conn = self.connect(route).await?;
                    conn.sender
                        .send_request(request)
                        .await
                        .map_err(|e| http_failure(route, e))?
                }
                _ => return Err(http_failure(route, failed.into_error())),
            },
        };
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| http_failure(route, e))?
            .to_bytes();

        debug!(
            "{} responded {} with {} byte body",
            route,
            parts.status,
            body.len()
        );

        lease.attach(conn);
        Ok(SecureResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    async fn connect(&self, route: &Route) -> Result<PooledConnection> {
        let connect_timeout = self.inner.options.connect_timeout;
        let connecting = TcpStream::connect((route.host(), route.port()));
        let tcp = match tokio::time::timeout(connect_timeout, connecting).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                return Err(Error::Connect {
                    route: route.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                return Err(Error::Connect {
                    route: route.to_string(),
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no connection within {:?}", connect_timeout),
                    ),
                })
            }
        };
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(route.host().to_string()).map_err(|e| {
            Error::InvalidRequest(format!("invalid server name '{}': {}", route.host(), e))
        })?;

        let tls = self
            .inner
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| handshake_failure(route, e))?;

        debug!("TLS handshake with {} complete", route);

        let (sender, connection) = http1::handshake(TokioIo::new(tls)).await?;
        let task_route = route.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Connection to {} closed with error: {}", task_route, e);
            }
        });

        Ok(PooledConnection { sender })
    }
}

impl fmt::Debug for SecureClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureClient")
            .field("pool", self.inner.pool.policy())
            .field("options", &self.inner.options)
            .field("hostname", &self.inner.hostname)
            .finish()
    }
}

/// The rustls error behind a failure, looking through wrapped I/O errors
fn tls_rejection<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a rustls::Error> {
    let mut current = Some(err);
    while let Some(cause) = current {
        if let Some(tls) = cause.downcast_ref::<rustls::Error>() {
            return Some(tls);
        }
        // io::Error::source skips the wrapped error itself
        let wrapped = cause
            .downcast_ref::<io::Error>()
            .and_then(io::Error::get_ref)
            .and_then(|inner| inner.downcast_ref::<rustls::Error>());
        if wrapped.is_some() {
            return wrapped;
        }
        current = cause.source();
    }
    None
}

/// Separate TLS rejections from transport failures during the handshake
fn handshake_failure(route: &Route, err: io::Error) -> Error {
    if let Some(tls) = tls_rejection(&err) {
        return Error::Handshake {
            host: route.host().to_string(),
            source: tls.clone(),
        };
    }
    Error::Connect {
        route: route.to_string(),
        source: err,
    }
}

/// A TLS 1.3 server rejects the client certificate after the client side of
/// the handshake completes, so the alert arrives with the first response.
fn http_failure(route: &Route, err: hyper::Error) -> Error {
    if let Some(tls) = tls_rejection(&err) {
        return Error::Handshake {
            host: route.host().to_string(),
            source: tls.clone(),
        };
    }
    Error::Http(err)
}

/// Rewrite an absolute-form request for sending on an HTTP/1.1 connection
fn into_origin_form(request: Request<Bytes>) -> Result<Request<Full<Bytes>>> {
    let (mut parts, body) = request.into_parts();

    if !parts.headers.contains_key(HOST) {
        let authority = parts
            .uri
            .authority()
            .ok_or_else(|| Error::InvalidRequest("request URI has no authority".into()))?;
        let host = HeaderValue::from_str(authority.as_str())
            .map_err(|e| Error::InvalidRequest(format!("invalid Host header: {}", e)))?;
        parts.headers.insert(HOST, host);
    }

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = path
        .parse::<Uri>()
        .map_err(|e| Error::InvalidRequest(format!("invalid request path: {}", e)))?;

    Ok(Request::from_parts(parts, Full::new(body)))
}
