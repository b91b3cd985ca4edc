//! HTTP request handling: dispatch, authentication, admission, cache
//! lookup, upstream forwarding and cancellation.
//!
//! One request moves through a fixed sequence of states: received,
//! authenticated, authorized, admitted, then either replayed from cache or
//! forwarded upstream, and finally released. Failures at any stage release
//! everything acquired so far in reverse order, which falls out of plain
//! drop ordering: host checkout and limiter permits are guards.
//!
//! # Cancellation
//!
//! The client disconnecting drops the handler future (or closes the
//! response channel once streaming has started); the execution deadline
//! fires inside the streaming pump. Both paths abort the cache producer,
//! release the host and limiter guards, and trip the [`KillSwitch`], which
//! sends a detached `KILL QUERY` to the backend under the cluster's
//! kill-query credentials.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, Response, StatusCode, header};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

use crate::cache::{self, FileCache, StartWrite};
use crate::config::{
    CACHE_WAIT_RETRIES, KILL_QUERY_TIMEOUT, MAX_DIAL_RETRIES, MAX_REQUEST_BODY_SIZE,
    RESPONSE_CHANNEL_DEPTH,
};
use crate::helpers::{
    self, error_response, error_response_close,
};
use crate::limits::{BackendUser, LimitError, ProxyUser, SlotPermit};
use crate::metrics::Metrics;
use crate::state::{AppState, Snapshot};
use crate::topology::{Cluster, HostGuard};

/// Which listener a request arrived on; `deny_http`/`deny_https` are
/// checked against this.
#[derive(Clone, Copy, PartialEq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Per-listener handler state.
#[derive(Clone)]
pub struct ListenerState {
    pub app: Arc<AppState>,
    pub scheme: Scheme,
}

/// Single entry point for every request, mirroring the narrow public
/// surface: `/` proxies, `/metrics` and `/favicon.ico` are served locally,
/// everything else is refused.
pub async fn serve_http(State(listener): State<ListenerState>, req: Request) -> Response<Body> {
    let method = req.method().clone();
    if method == Method::OPTIONS {
        return options_response(&listener.app, &req);
    }
    if method != Method::GET && method != Method::POST {
        listener.app.metrics.bad_requests.inc();
        return error_response_close(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("unsupported method {:?}", method.as_str()),
        );
    }

    match req.uri().path() {
        "/favicon.ico" => Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .expect("static response construction cannot fail"),
        "/metrics" => metrics_response(&listener.app).await,
        "/" => {
            let started = Instant::now();
            let (user, response) = proxy_request(&listener, req).await;
            let app = &listener.app;
            app.metrics
                .observe_request(&user, response.status().as_u16());
            app.metrics
                .request_duration
                .get_or_create(&[("user".to_string(), user)])
                .observe(started.elapsed().as_secs_f64());
            response
        }
        path => {
            listener.app.metrics.bad_requests.inc();
            error_response_close(
                StatusCode::BAD_REQUEST,
                format!("unsupported path: {path:?}"),
            )
        }
    }
}

/// Preflight short-circuit: the allowed-methods header always, plus CORS
/// headers when the caller resolves to an `allow_cors` user. Unknown or
/// unauthenticated callers still get the plain allow-list.
fn options_response(app: &Arc<AppState>, req: &Request) -> Response<Body> {
    let snapshot = app.snapshot();
    let params = helpers::query_params(req.uri());
    let (user_name, password) = helpers::credentials(req.headers(), &params);
    let allow_cors = snapshot
        .users
        .get(&user_name)
        .is_some_and(|u| u.password == password && u.allow_cors);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::ALLOW, "GET,POST");
    if allow_cors {
        builder = builder.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");
    }
    builder
        .body(Body::empty())
        .expect("static response construction cannot fail")
}

/// Refreshes the per-cache size gauges, then serves the registry.
async fn metrics_response(app: &Arc<AppState>) -> Response<Body> {
    let snapshot = app.snapshot();
    for (name, cache) in &snapshot.caches {
        match cache.disk_stats().await {
            Ok((bytes, items)) => {
                let labels = [("cache".to_string(), name.clone())];
                app.metrics.cache_size_bytes.get_or_create(&labels).set(bytes as i64);
                app.metrics.cache_items.get_or_create(&labels).set(items as i64);
            }
            Err(e) => warn!(cache = %name, error = %e, "cannot stat cache directory"),
        }
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(Body::from(app.metrics.encode()))
        .expect("static response construction cannot fail")
}

/// The proxy path. Returns the user label for metrics along with the
/// response.
async fn proxy_request(listener: &ListenerState, req: Request) -> (String, Response<Body>) {
    let app = &listener.app;
    let snapshot = app.snapshot();
    let (parts, body) = req.into_parts();
    let params = helpers::query_params(&parts.uri);

    // Received -> Authenticated.
    let (user_name, password) = helpers::credentials(&parts.headers, &params);
    let Some(user) = snapshot
        .users
        .get(&user_name)
        .filter(|u| u.password == password)
        .cloned()
    else {
        return (
            user_name.clone(),
            error_response(
                StatusCode::UNAUTHORIZED,
                format!("invalid username or password for user {user_name:?}"),
            ),
        );
    };

    // Authenticated -> Authorized.
    let denied = match listener.scheme {
        Scheme::Http => user.deny_http,
        Scheme::Https => user.deny_https,
    };
    if denied {
        return (
            user_name,
            error_response(
                StatusCode::FORBIDDEN,
                format!(
                    "user {:?} is not allowed to access via {}",
                    user.name,
                    listener.scheme.as_str()
                ),
            ),
        );
    }

    let Some(cluster) = snapshot.clusters.get(&user.to_cluster).cloned() else {
        error!(user = %user.name, cluster = %user.to_cluster, "snapshot is missing target cluster");
        return (
            user_name,
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal configuration error".to_string(),
            ),
        );
    };
    let Some(backend) = cluster.user(&user.to_user).cloned() else {
        error!(user = %user.name, backend = %user.to_user, "snapshot is missing backend user");
        return (
            user_name,
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal configuration error".to_string(),
            ),
        );
    };

    // Authorized -> Admitted: gateway user first, then backend user.
    // Failures release whatever was already acquired via drop order.
    if let Err(e) = user.rate.try_acquire(&user.name) {
        return (user_name, limit_error_response(e));
    }
    let user_slot = match user.gate.acquire(&user.name).await {
        Ok(permit) => permit,
        Err(e) => return (user_name, limit_error_response(e)),
    };
    if let Err(e) = backend.rate.try_acquire(&backend.name) {
        return (user_name, limit_error_response(e));
    }
    let backend_slot = match backend.gate.acquire(&backend.name).await {
        Ok(permit) => permit,
        Err(e) => return (user_name, limit_error_response(e)),
    };

    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY_SIZE).await {
        Ok(b) => b,
        Err(e) => {
            return (
                user_name,
                error_response(
                    StatusCode::BAD_REQUEST,
                    format!("cannot read request body: {e}"),
                ),
            );
        }
    };

    let deadline_at = effective_deadline(&user, &backend).map(|d| Instant::now() + d);

    let ctx = RequestContext {
        app: app.clone(),
        snapshot,
        user,
        backend,
        cluster,
        method: parts.method,
        headers: parts.headers,
        params,
        body,
        deadline_at,
        user_slot,
        backend_slot,
    };
    let response = ctx.run().await;
    (user_name, response)
}

/// The stricter of the two execution-time limits; `None` when both are
/// unlimited.
fn effective_deadline(user: &ProxyUser, backend: &BackendUser) -> Option<std::time::Duration> {
    [user.max_execution_time, backend.max_execution_time]
        .into_iter()
        .filter(|d| !d.is_zero())
        .min()
}

fn limit_error_response(e: LimitError) -> Response<Body> {
    let status = match e {
        LimitError::RateLimited { .. } | LimitError::TooManyQueries { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
        LimitError::QueueTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, e.to_string())
}

/// Everything an admitted request needs to either replay a cached response
/// or forward upstream.
struct RequestContext {
    app: Arc<AppState>,
    snapshot: Arc<Snapshot>,
    user: Arc<ProxyUser>,
    backend: Arc<BackendUser>,
    cluster: Arc<Cluster>,
    method: Method,
    headers: HeaderMap,
    params: Vec<(String, String)>,
    body: Bytes,
    deadline_at: Option<Instant>,
    user_slot: SlotPermit,
    backend_slot: SlotPermit,
}

impl RequestContext {
    async fn run(self) -> Response<Body> {
        let cache_ctx = match self.resolve_cache() {
            Ok(ctx) => ctx,
            Err(response) => return response,
        };

        if let Some((cache, fingerprint)) = &cache_ctx {
            match self.try_cache(cache, fingerprint).await {
                CacheOutcome::Replay(entry, file) => return self.replay_cached(entry, file),
                CacheOutcome::Response(response) => return response,
                CacheOutcome::Miss => {}
            }
        }

        self.forward(cache_ctx).await
    }

    /// Computes the fingerprint for users with a cache configured. Errors
    /// out only when a gzip body fails to decode, since the fingerprint is
    /// defined over the decoded query text.
    fn resolve_cache(&self) -> Result<Option<(Arc<FileCache>, String)>, Response<Body>> {
        let Some(cache_name) = &self.user.cache else {
            return Ok(None);
        };
        let Some(cache) = self.snapshot.caches.get(cache_name).cloned() else {
            return Ok(None);
        };

        let decoded_body;
        let query_body: &[u8] = if helpers::is_gzip_encoded(&self.headers) {
            match common::decode_gzip(&self.body) {
                Ok(decoded) => {
                    decoded_body = decoded;
                    &decoded_body
                }
                Err(e) => {
                    return Err(error_response(
                        StatusCode::BAD_REQUEST,
                        format!("cannot decode gzipped request body: {e}"),
                    ));
                }
            }
        } else {
            &self.body
        };

        let query = helpers::full_query(&self.params, query_body);
        let group = self.param_group();
        let merged = helpers::fingerprint_params(&self.params, group);
        let format = helpers::output_format(&self.headers, &self.params);
        let fingerprint = common::CacheKey {
            query: &query,
            user: &self.user.name,
            params: &merged,
            accept_gzip: helpers::accepts_gzip(&self.headers),
            format: format.as_deref(),
        }
        .fingerprint();
        Ok(Some((cache, fingerprint)))
    }

    fn param_group(&self) -> Option<&[(String, String)]> {
        self.user
            .params
            .as_ref()
            .and_then(|name| self.snapshot.param_groups.get(name))
            .map(|v| v.as_slice())
    }

    /// Cache lookup with producer coalescing: hits are replayed; requests
    /// racing an in-flight producer wait for it and retry.
    async fn try_cache(&self, cache: &Arc<FileCache>, fingerprint: &str) -> CacheOutcome {
        let labels = [("cache".to_string(), cache.name().to_string())];
        for _ in 0..=CACHE_WAIT_RETRIES {
            match cache.get(fingerprint).await {
                Ok(cache::Lookup::Hit { path }) => match cache.open(&path).await {
                    Ok((header, file)) => {
                        self.app.metrics.cache_hits.get_or_create(&labels).inc();
                        return CacheOutcome::Replay(header, file);
                    }
                    Err(e) => {
                        // Evicted between lookup and open; treat as a miss.
                        debug!(fingerprint, error = %e, "cached entry vanished");
                        break;
                    }
                },
                Ok(cache::Lookup::Wait(handle)) => {
                    let wait = cache::await_producer(handle);
                    let produced = match self.deadline_at {
                        Some(at) => match tokio::time::timeout_at(at, wait).await {
                            Ok(produced) => produced,
                            Err(_) => {
                                return CacheOutcome::Response(self.deadline_response());
                            }
                        },
                        None => wait.await,
                    };
                    if !produced {
                        // Producer failed; retry the lookup, likely
                        // becoming the producer ourselves.
                        continue;
                    }
                }
                Ok(cache::Lookup::Miss) => break,
                Err(e) => {
                    warn!(cache = %cache.name(), error = %e, "cache lookup failed");
                    break;
                }
            }
        }
        self.app.metrics.cache_misses.get_or_create(&labels).inc();
        CacheOutcome::Miss
    }

    /// Streams a committed cache entry back, reconstructing the original
    /// status and headers from the entry header. The limiter permits ride
    /// inside the body stream so release happens after the last byte.
    fn replay_cached(self, entry: cache::EntryHeader, file: tokio::fs::File) -> Response<Body> {
        let mut builder = Response::builder().status(
            StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
        );
        if let Some(ct) = &entry.content_type {
            if let Ok(value) = HeaderValue::from_str(ct) {
                builder = builder.header(header::CONTENT_TYPE, value);
            }
        }
        if let Some(ce) = &entry.content_encoding {
            if let Ok(value) = HeaderValue::from_str(ce) {
                builder = builder.header(header::CONTENT_ENCODING, value);
            }
        }
        if self.user.allow_cors {
            builder = builder.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");
        }

        let guards = (self.user_slot, self.backend_slot);
        let stream = ReaderStream::new(file).map(move |item| {
            let _ = &guards;
            item
        });
        builder
            .body(Body::from_stream(stream))
            .expect("static response construction cannot fail")
    }

    fn deadline_response(&self) -> Response<Body> {
        let limit = effective_deadline(&self.user, &self.backend).unwrap_or_default();
        error_response(
            StatusCode::GATEWAY_TIMEOUT,
            format!(
                "timeout for user {:?} exceeded: {}",
                self.user.name,
                common::Duration(limit)
            ),
        )
    }

    /// Forwards the request to the least-loaded alive host, retrying dial
    /// failures on other hosts for idempotent requests, and tees the
    /// response into the cache when eligible.
    async fn forward(self, cache_ctx: Option<(Arc<FileCache>, String)>) -> Response<Body> {
        let query_id = helpers::generate_query_id();
        let group = self.param_group().map(|g| g.to_vec());
        let upstream_params = helpers::upstream_params(
            &self.params,
            group.as_deref(),
            &self.backend,
            &query_id,
        );

        let mut dial_attempts = 0u32;
        loop {
            let Some(host) = self.cluster.pick_host() else {
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    format!(
                        "no active hosts available in cluster {:?}",
                        self.cluster.name()
                    ),
                );
            };

            let mut builder = self
                .app
                .http_client
                .request(self.method.clone(), format!("http://{}/", host.addr()))
                .query(&upstream_params)
                .body(self.body.clone());
            if let Some(encoding) = self.headers.get(header::CONTENT_ENCODING) {
                builder = builder.header(header::CONTENT_ENCODING, encoding.clone());
            }
            if let Some(accept) = self.headers.get(header::ACCEPT_ENCODING) {
                builder = builder.header(header::ACCEPT_ENCODING, accept.clone());
            }

            let mut kill = KillSwitch::arm(
                &self.app,
                &self.cluster,
                host.addr().to_string(),
                query_id.clone(),
            );

            let send = builder.send();
            let result = match self.deadline_at {
                Some(at) => match tokio::time::timeout_at(at, send).await {
                    Ok(result) => result,
                    Err(_) => {
                        kill.fire();
                        return self.deadline_response();
                    }
                },
                None => send.await,
            };

            let upstream = match result {
                Ok(response) => response,
                Err(e) if e.is_connect() => {
                    // The query never started; nothing to kill.
                    kill.disarm();
                    if self.method == Method::GET && dial_attempts < MAX_DIAL_RETRIES {
                        dial_attempts += 1;
                        warn!(host = %host.addr(), error = %e, "dial failed, retrying on another host");
                        continue;
                    }
                    return error_response(
                        StatusCode::BAD_GATEWAY,
                        format!("cannot reach host {:?}: {e}", host.addr()),
                    );
                }
                Err(e) => {
                    return error_response(
                        StatusCode::BAD_GATEWAY,
                        format!("cannot proxy request to host {:?}: {e}", host.addr()),
                    );
                }
            };

            return self.stream_response(upstream, host, kill, cache_ctx).await;
        }
    }

    /// Streams the upstream response to the client while teeing it into a
    /// cache producer when the response is cacheable.
    async fn stream_response(
        self,
        upstream: reqwest::Response,
        host: HostGuard,
        mut kill: KillSwitch,
        cache_ctx: Option<(Arc<FileCache>, String)>,
    ) -> Response<Body> {
        let status = upstream.status();
        let content_type = upstream.headers().get(header::CONTENT_TYPE).cloned();
        let content_encoding = upstream.headers().get(header::CONTENT_ENCODING).cloned();
        let mut body_stream = Box::pin(upstream.bytes_stream());

        // The first chunk decides cacheability: ClickHouse reports late
        // errors inside 200 responses and those must never be cached.
        let first_chunk = if cache_ctx.is_some() {
            let next = body_stream.next();
            let item = match self.deadline_at {
                Some(at) => match tokio::time::timeout_at(at, next).await {
                    Ok(item) => item,
                    Err(_) => {
                        kill.fire();
                        return self.deadline_response();
                    }
                },
                None => next.await,
            };
            match item {
                Some(Ok(chunk)) => Some(chunk),
                Some(Err(e)) => {
                    kill.disarm();
                    return error_response(
                        StatusCode::BAD_GATEWAY,
                        format!("cannot read response from cluster {:?}: {e}", self.cluster.name()),
                    );
                }
                None => None,
            }
        } else {
            None
        };

        let producer = match &cache_ctx {
            Some((cache, fingerprint))
                if status.is_success()
                    && !first_chunk
                        .as_deref()
                        .map(helpers::looks_like_clickhouse_error)
                        .unwrap_or(false) =>
            {
                let entry = cache::EntryHeader {
                    status: status.as_u16(),
                    content_type: header_str(&content_type),
                    content_encoding: header_str(&content_encoding),
                };
                match cache.start_write(fingerprint, entry).await {
                    Ok(StartWrite::Producer(writer)) => Some(writer),
                    Ok(StartWrite::Wait(_)) => None,
                    Err(e) => {
                        warn!(cache = %cache.name(), error = %e, "cannot start cache producer");
                        None
                    }
                }
            }
            _ => None,
        };

        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(RESPONSE_CHANNEL_DEPTH);
        let guards = StreamGuards {
            _host: host,
            _user_slot: self.user_slot,
            _backend_slot: self.backend_slot,
        };
        spawn_response_pump(
            body_stream,
            first_chunk,
            tx,
            producer,
            kill,
            self.deadline_at,
            guards,
        );

        let mut builder = Response::builder().status(status);
        if let Some(ct) = content_type {
            builder = builder.header(header::CONTENT_TYPE, ct);
        }
        if let Some(ce) = content_encoding {
            builder = builder.header(header::CONTENT_ENCODING, ce);
        }
        if self.user.allow_cors {
            builder = builder.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");
        }
        builder
            .body(Body::from_stream(ReceiverStream::new(rx)))
            .expect("static response construction cannot fail")
    }
}

enum CacheOutcome {
    /// A committed entry ready for replay.
    Replay(cache::EntryHeader, tokio::fs::File),
    /// A terminal response produced during the lookup (deadline expiry).
    Response(Response<Body>),
    Miss,
}

fn header_str(value: &Option<HeaderValue>) -> Option<String> {
    value
        .as_ref()
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Guards released when the response body finishes streaming (or the pump
/// aborts), which is the moment the request leaves the system.
struct StreamGuards {
    _host: HostGuard,
    _user_slot: SlotPermit,
    _backend_slot: SlotPermit,
}

/// Copies upstream chunks to the client and the cache producer until the
/// body ends, the deadline fires or the client disconnects.
#[allow(clippy::too_many_arguments)]
fn spawn_response_pump(
    upstream: impl futures::Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    first_chunk: Option<Bytes>,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    mut producer: Option<cache::CacheWriter>,
    mut kill: KillSwitch,
    deadline_at: Option<Instant>,
    guards: StreamGuards,
) {
    tokio::spawn(async move {
        let _guards = guards;
        tokio::pin!(upstream);
        let deadline = async move {
            match deadline_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut pending = first_chunk;
        loop {
            let item = match pending.take() {
                Some(chunk) => Some(Ok(chunk)),
                None => tokio::select! {
                    _ = &mut deadline => {
                        // Execution deadline fired mid-stream: the client
                        // gets a truncated body, the backend gets a kill.
                        if let Some(writer) = producer.take() {
                            writer.abort().await;
                        }
                        kill.fire();
                        let _ = tx
                            .send(Err(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "query deadline exceeded",
                            )))
                            .await;
                        return;
                    }
                    _ = tx.closed() => {
                        // Client went away.
                        if let Some(writer) = producer.take() {
                            writer.abort().await;
                        }
                        kill.fire();
                        return;
                    }
                    item = upstream.next() => item,
                },
            };

            match item {
                None => {
                    if let Some(writer) = producer.take() {
                        if let Err(e) = writer.commit().await {
                            warn!(error = %e, "cannot commit cache entry");
                        }
                    }
                    kill.disarm();
                    return;
                }
                Some(Ok(chunk)) => {
                    if let Some(writer) = producer.as_mut() {
                        if let Err(e) = writer.write_chunk(&chunk).await {
                            warn!(error = %e, "cache write failed, continuing uncached");
                            if let Some(writer) = producer.take() {
                                writer.abort().await;
                            }
                        }
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        if let Some(writer) = producer.take() {
                            writer.abort().await;
                        }
                        kill.fire();
                        return;
                    }
                }
                Some(Err(e)) => {
                    // Upstream I/O error: never leave a poisoned cache
                    // entry behind.
                    if let Some(writer) = producer.take() {
                        writer.abort().await;
                    }
                    kill.disarm();
                    let _ = tx.send(Err(std::io::Error::other(e))).await;
                    return;
                }
            }
        }
    });
}

/// One-shot trigger for the detached KILL QUERY request.
///
/// Armed for the lifetime of an upstream query; `disarm` on clean
/// completion, `fire` (or drop while armed) on cancellation and timeouts.
/// The kill request runs on its own task with its own timeout and the
/// cluster's kill-query credentials; it never participates in limiters and
/// its failures are logged, not surfaced.
pub struct KillSwitch {
    client: reqwest::Client,
    metrics: Metrics,
    host: String,
    user: String,
    password: String,
    query_id: String,
    armed: bool,
}

impl KillSwitch {
    fn arm(app: &Arc<AppState>, cluster: &Arc<Cluster>, host: String, query_id: String) -> Self {
        let kill_user = cluster.kill_query_user();
        Self {
            client: app.http_client.clone(),
            metrics: app.metrics.clone(),
            host,
            user: kill_user.name.clone(),
            password: kill_user.password.clone(),
            query_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn fire(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        self.metrics.killed_queries.inc();

        let client = self.client.clone();
        let host = self.host.clone();
        let user = self.user.clone();
        let password = self.password.clone();
        let query_id = self.query_id.clone();
        tokio::spawn(async move {
            let query = format!("KILL QUERY WHERE query_id = '{query_id}'");
            let result = client
                .get(format!("http://{host}/"))
                .query(&[("query", query.as_str())])
                .basic_auth(&user, Some(&password))
                .timeout(KILL_QUERY_TIMEOUT)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(host = %host, query_id = %query_id, "query killed");
                }
                Ok(response) => {
                    warn!(host = %host, query_id = %query_id, status = %response.status(), "kill query refused");
                }
                Err(e) => {
                    warn!(host = %host, query_id = %query_id, error = %e, "kill query failed");
                }
            }
        });
    }
}

impl Drop for KillSwitch {
    fn drop(&mut self) {
        self.fire();
    }
}
