//! The mirror handler: admission, the cache state machine, and response
//! shaping. One instance owns the single-flight tables and the tee session
//! map for its lifetime.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::StreamExt;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HOST, LAST_MODIFIED, LOCATION};
use http::{HeaderMap, HeaderName, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::canonical::{Admission, Reject, Target};
use crate::constants::{COPY_CHUNK_SIZE, DEFAULT_LINK_EXPIRES, HEADER_REPO_COMMIT};
use crate::content::{self, Entity, OCTET_STREAM};
use crate::fetch::{is_not_ok, NotOk, OriginFetcher};
use crate::freshness::{self, Verdict};
use crate::metrics;
use crate::orchestrator::Orchestrator;
use crate::singleflight::Group;
use crate::store::{ObjectMeta, ObjectStore, StoreError};
use crate::tee::{self, SessionMap, TeeSession};

/// Response body type used everywhere in the mirror: streaming, with I/O
/// errors surfacing to the connection.
pub type Body = UnsyncBoxBody<Bytes, io::Error>;

pub type NotFoundHandler = Arc<dyn Fn(&Method, &str) -> Response<Body> + Send + Sync>;

type RefreshOutcome = Result<(), Arc<anyhow::Error>>;
type TeeOutcome = Result<Arc<TeeSession>, Arc<anyhow::Error>>;

pub struct MirrorOptions {
    pub fetcher: OriginFetcher,
    /// Remote object-store cache. Absent means plain pass-through proxying.
    pub remote_cache: Option<Arc<dyn ObjectStore>>,
    pub link_expires: Duration,
    pub base_domain: String,
    pub host_from_first_path: bool,
    pub block_suffixes: Vec<String>,
    /// `0` disables origin freshness probing.
    pub check_sync_timeout: Duration,
    /// Serve cached bytes directly instead of redirecting to presigned URLs.
    pub no_redirect: bool,
    /// Stream miss responses live from the origin fetch.
    pub tee_response: bool,
    /// Only meaningful with `tee_response`.
    pub local_cache_dir: Option<PathBuf>,
    pub orchestrator: Option<Arc<Orchestrator>>,
    pub not_found: Option<NotFoundHandler>,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            fetcher: OriginFetcher::new(),
            remote_cache: None,
            link_expires: DEFAULT_LINK_EXPIRES,
            base_domain: String::new(),
            host_from_first_path: false,
            block_suffixes: Vec::new(),
            check_sync_timeout: Duration::ZERO,
            no_redirect: false,
            tee_response: false,
            local_cache_dir: None,
            orchestrator: None,
            not_found: None,
        }
    }
}

pub struct MirrorHandler {
    pub(crate) fetcher: OriginFetcher,
    pub(crate) remote_cache: Option<Arc<dyn ObjectStore>>,
    pub(crate) check_sync_timeout: Duration,
    pub(crate) orchestrator: Option<Arc<Orchestrator>>,
    pub(crate) refresh_group: Group<RefreshOutcome>,
    link_expires: Duration,
    admission: Admission,
    no_redirect: bool,
    tee_response: bool,
    local_cache_dir: Option<PathBuf>,
    not_found: Option<NotFoundHandler>,
    tee_group: Group<TeeOutcome>,
    tee_sessions: SessionMap,
}

impl MirrorHandler {
    pub fn new(opts: MirrorOptions) -> Arc<Self> {
        Arc::new(Self {
            fetcher: opts.fetcher,
            remote_cache: opts.remote_cache,
            link_expires: opts.link_expires,
            admission: Admission {
                base_domain: opts.base_domain,
                host_from_first_path: opts.host_from_first_path,
                block_suffixes: opts.block_suffixes,
            },
            check_sync_timeout: opts.check_sync_timeout,
            no_redirect: opts.no_redirect,
            tee_response: opts.tee_response,
            local_cache_dir: opts.local_cache_dir,
            orchestrator: opts.orchestrator,
            not_found: opts.not_found,
            refresh_group: Group::new(),
            tee_group: Group::new(),
            tee_sessions: tee::new_session_map(),
        })
    }

    /// Serves one request. The request body is never read; only GET and
    /// HEAD make it past admission.
    pub async fn handle<B>(self: Arc<Self>, req: Request<B>) -> Response<Body> {
        metrics::record_request();
        let resp = self.dispatch(req).await;
        metrics::record_status(resp.status());
        resp
    }

    async fn dispatch<B>(self: Arc<Self>, req: Request<B>) -> Response<Body> {
        let method = req.method().clone();
        if method != Method::GET && method != Method::HEAD {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        }

        let host = request_host(&req);
        let raw_path = req.uri().path().to_string();
        let target = match self.admission.resolve(&host, &raw_path) {
            Ok(target) => target,
            Err(Reject::NotFound) => return self.not_found_response(&method, &raw_path),
            Err(Reject::Forbidden) => return text_response(StatusCode::FORBIDDEN, "Forbidden"),
        };

        log::info!("request {}", target.url);

        match self.remote_cache.clone() {
            None => self.direct_response(&method, req.headers(), &target).await,
            Some(store) => {
                self.cache_response(&method, req.headers(), &target, store)
                    .await
            }
        }
    }

    async fn cache_response(
        self: Arc<Self>,
        method: &Method,
        req_headers: &HeaderMap,
        target: &Target,
        store: Arc<dyn ObjectStore>,
    ) -> Response<Body> {
        let repo_commit = match Arc::clone(&self).huggingface_commit(target).await {
            Ok(commit) => commit,
            Err(err) => return error_response(&err),
        };

        let mut resp = self
            .cache_response_inner(method, req_headers, target, store)
            .await;
        if let Some(sha) = repo_commit {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(HEADER_REPO_COMMIT.as_bytes()),
                sha.parse(),
            ) {
                resp.headers_mut().insert(name, value);
            }
        }
        resp
    }

    async fn cache_response_inner(
        self: Arc<Self>,
        method: &Method,
        req_headers: &HeaderMap,
        target: &Target,
        store: Arc<dyn ObjectStore>,
    ) -> Response<Body> {
        if self.tee_response {
            if let Some(dir) = self.local_cache_dir.clone() {
                let local_path = dir.join(&target.key);
                if let Some(resp) = self
                    .try_serve_local(method, req_headers, &local_path, target)
                    .await
                {
                    return resp;
                }
            }
        }

        let cache_info = match store.stat(&target.key).await {
            Ok(meta) => Some(meta),
            Err(StoreError::Canceled) => {
                return error_response(&anyhow!("request canceled during cache stat"))
            }
            Err(err) => {
                log::info!("cache miss {}: {err}", target.key);
                metrics::record_cache("miss");
                None
            }
        };

        if let Some(info) = &cache_info {
            log::info!("cache hit {}", target.key);
            metrics::record_cache("hit");

            if self.check_sync_timeout.is_zero() {
                return self.respond_cache(method, target, &store, Some(info)).await;
            }

            // With an orchestrator the refresh itself is cheap (the blob
            // destination skips existing objects), so no probe is spent.
            if self.orchestrator.is_none() {
                match freshness::arbitrate(
                    &self.fetcher,
                    &target.url,
                    info.size,
                    self.check_sync_timeout,
                )
                .await
                {
                    Verdict::ServeCache => {
                        return self.respond_cache(method, target, &store, Some(info)).await
                    }
                    Verdict::Refresh => {
                        log::info!("source change {}", target.key);
                        metrics::record_cache("stale");
                    }
                }
            }
        }

        if self.tee_response {
            return self
                .tee_refresh(method, req_headers, target, store, cache_info.as_ref())
                .await;
        }

        let (outcome, _shared) = {
            let this = Arc::clone(&self);
            let url = target.url.clone();
            let key = target.key.clone();
            self.refresh_group
                .run(target.key.clone(), move || async move {
                    this.refresh(&url, &key).await.map_err(Arc::new)
                })
                .await
        };

        match outcome {
            Ok(()) => self
                .respond_cache(method, target, &store, cache_info.as_ref())
                .await,
            Err(err) => {
                if cache_info.is_some() {
                    log::warn!("recache error {}: {err:#}", target.key);
                    metrics::record_cache("stale_serve");
                    return self
                        .respond_cache(method, target, &store, cache_info.as_ref())
                        .await;
                }
                if is_not_ok(&err) {
                    return self.not_found_response(method, &target.path);
                }
                error_response(&err)
            }
        }
    }

    /// Fetch-and-commit for one key, delegated to the orchestrator when one
    /// is configured. Runs detached from any request.
    pub(crate) async fn refresh(&self, source_url: &str, cache_key: &str) -> Result<()> {
        metrics::record_cache("refresh");
        if let Some(orchestrator) = &self.orchestrator {
            return orchestrator.sync(source_url, cache_key).await;
        }
        self.cache_file_direct(source_url, cache_key).await
    }

    async fn cache_file_direct(&self, source_url: &str, cache_key: &str) -> Result<()> {
        let store = self
            .remote_cache
            .as_ref()
            .ok_or_else(|| anyhow!("remote cache not configured"))?;

        let (mut body, meta) = self.fetcher.get(source_url).await?;
        let size = meta.size;
        if size == 0 {
            return Err(
                anyhow::Error::new(NotOk).context(format!("{source_url}: zero length origin response"))
            );
        }

        log::info!("cache {cache_key} {size}");
        let mut writer = match store.writer(cache_key).await {
            Ok(writer) => writer,
            Err(err) => {
                log::warn!("cache writer error {cache_key} {size}: {err}");
                return Err(err.into());
            }
        };

        let mut copied: i64 = 0;
        while let Some(frame) = body.frame().await {
            let chunk = match frame {
                Ok(frame) => match frame.into_data() {
                    Ok(data) => data,
                    Err(_) => continue,
                },
                Err(err) => {
                    log::warn!("cache copy error {cache_key} {size} {copied}: {err}");
                    let _ = writer.cancel().await;
                    return Err(anyhow!(err).context("read origin body"));
                }
            };
            if chunk.is_empty() {
                continue;
            }
            copied += chunk.len() as i64;
            if let Err(err) = writer.write(chunk).await {
                log::warn!("cache copy error {cache_key} {size} {copied}: {err}");
                let _ = writer.cancel().await;
                return Err(err.into());
            }
        }

        if size > 0 && copied != size {
            let err = anyhow!("copied {copied} bytes, expected {size}");
            log::warn!("cache copy error {cache_key}: {err}");
            let _ = writer.cancel().await;
            return Err(err);
        }

        if let Err(err) = writer.commit().await {
            log::warn!("cache commit error {cache_key}: {err}");
            return Err(err.into());
        }
        log::info!("cached {cache_key} {size}");
        Ok(())
    }

    async fn tee_refresh(
        self: Arc<Self>,
        method: &Method,
        req_headers: &HeaderMap,
        target: &Target,
        store: Arc<dyn ObjectStore>,
        cache_info: Option<&ObjectMeta>,
    ) -> Response<Body> {
        let existing = {
            let map = self.tee_sessions.lock().expect("tee session map");
            map.get(&target.key).cloned()
        };

        let tee = match existing {
            Some(tee) => tee,
            None => {
                let (outcome, shared) = {
                    let this = Arc::clone(&self);
                    let url = target.url.clone();
                    let key = target.key.clone();
                    self.tee_group
                        .run(target.key.clone(), move || async move {
                            TeeSession::start(
                                &this.fetcher,
                                store,
                                Arc::clone(&this.tee_sessions),
                                &url,
                                &key,
                                this.local_cache_dir.as_deref(),
                            )
                            .await
                            .map_err(Arc::new)
                        })
                        .await
                };
                match outcome {
                    Ok(tee) => {
                        if !shared {
                            let mut map = self.tee_sessions.lock().expect("tee session map");
                            map.insert(target.key.clone(), Arc::clone(&tee));
                        }
                        tee
                    }
                    Err(err) => {
                        log::warn!("tee cache error {}: {err:#}", target.key);
                        if cache_info.is_some() {
                            let store = self.remote_cache.clone().expect("cache mode");
                            metrics::record_cache("stale_serve");
                            return self.respond_cache(method, target, &store, cache_info).await;
                        }
                        if is_not_ok(&err) {
                            return self.not_found_response(method, &target.path);
                        }
                        return error_response(&err);
                    }
                }
            }
        };

        tee.respond(method, req_headers)
    }

    async fn respond_cache(
        &self,
        method: &Method,
        target: &Target,
        store: &Arc<dyn ObjectStore>,
        info: Option<&ObjectMeta>,
    ) -> Response<Body> {
        if self.no_redirect {
            self.serve_from_cache(method, target, store, info).await
        } else {
            self.redirect(method, target, store, info).await
        }
    }

    /// Redirect shaping: HEAD answers from metadata when it is at hand,
    /// otherwise clients are sent to a presigned URL.
    async fn redirect(
        &self,
        method: &Method,
        target: &Target,
        store: &Arc<dyn ObjectStore>,
        info: Option<&ObjectMeta>,
    ) -> Response<Body> {
        if *method == Method::HEAD {
            let stat_info;
            let info = match info {
                Some(info) => Some(info),
                None => match store.stat(&target.key).await {
                    Ok(meta) => {
                        stat_info = meta;
                        Some(&stat_info)
                    }
                    Err(err) => {
                        log::warn!("stat {}: {err}", target.key);
                        None
                    }
                },
            };
            if let Some(info) = info {
                return head_meta_response(info);
            }
            return match store.sign_head(&target.key, self.link_expires) {
                Ok(url) => redirect_response(&url),
                Err(err) => {
                    log::warn!("sign head {}: {err}", target.key);
                    error_response(&anyhow!(err).context("sign head"))
                }
            };
        }

        match store.sign_get(&target.key, self.link_expires) {
            Ok(url) => redirect_response(&url),
            Err(err) => {
                log::warn!("sign get {}: {err}", target.key);
                error_response(&anyhow!(err).context("sign get"))
            }
        }
    }

    /// Streams cached bytes through the proxy instead of redirecting.
    async fn serve_from_cache(
        &self,
        method: &Method,
        target: &Target,
        store: &Arc<dyn ObjectStore>,
        info: Option<&ObjectMeta>,
    ) -> Response<Body> {
        if *method == Method::HEAD {
            let meta = match info {
                Some(info) => info.clone(),
                None => match store.stat(&target.key).await {
                    Ok(meta) => meta,
                    Err(err) => {
                        log::warn!("stat error for direct serve {}: {err}", target.key);
                        return error_response(&anyhow!(err).context("stat cache"));
                    }
                },
            };
            return head_meta_response(&meta);
        }

        match store.reader(&target.key).await {
            Err(err) => {
                log::warn!("reader error for direct serve {}: {err}", target.key);
                error_response(&anyhow!(err).context("open cache reader"))
            }
            Ok((stream, meta)) => {
                let mut builder = Response::builder().status(StatusCode::OK);
                if let Some(headers) = builder.headers_mut() {
                    set_meta_headers(headers, &meta);
                }
                let key = target.key.clone();
                let body = StreamBody::new(stream.map(move |result| match result {
                    Ok(chunk) => Ok(Frame::data(chunk)),
                    Err(err) => {
                        // Headers are gone; all that is left is to drop the
                        // connection.
                        log::warn!("copy error for direct serve {key}: {err}");
                        Err(err)
                    }
                }))
                .boxed_unsync();
                builder.body(body).expect("build cache response")
            }
        }
    }

    /// Fast path for tee mode with a local cache directory: serve the
    /// committed local file, optionally verifying its size against the
    /// origin first.
    async fn try_serve_local(
        &self,
        method: &Method,
        req_headers: &HeaderMap,
        local_path: &Path,
        target: &Target,
    ) -> Option<Response<Body>> {
        let meta = tokio::fs::metadata(local_path).await.ok()?;
        if meta.is_dir() || meta.len() == 0 {
            return None;
        }

        if !self.check_sync_timeout.is_zero() && self.orchestrator.is_none() {
            match tokio::time::timeout(self.check_sync_timeout, self.fetcher.head(&target.url))
                .await
            {
                Ok(Ok(origin)) => {
                    if origin.size > 0 && origin.size as u64 != meta.len() {
                        log::info!(
                            "source change (local cache) {} {} {}",
                            target.key,
                            origin.size,
                            meta.len()
                        );
                        return None;
                    }
                }
                Ok(Err(err)) => log::info!(
                    "source check failed (local cache), serving stale {}: {err:#}",
                    target.key
                ),
                Err(_) => log::info!(
                    "source check timeout (local cache), serving stale {}",
                    target.key
                ),
            }
        }

        log::info!("local cache hit {}", target.key);
        metrics::record_cache("local_hit");

        let entity = Entity {
            size: Some(meta.len()),
            mod_time: meta.modified().ok(),
            etag: content::file_etag(&meta),
        };
        let plan = content::plan(method, req_headers, &entity);
        let mut builder = Response::builder().status(plan.status);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(plan.headers);
        }

        let body = match (plan.send_body, plan.slice) {
            (true, Some((offset, len))) => {
                let mut file = tokio::fs::File::open(local_path).await.ok()?;
                if offset > 0 {
                    file.seek(io::SeekFrom::Start(offset)).await.ok()?;
                }
                let stream = ReaderStream::with_capacity(file.take(len), COPY_CHUNK_SIZE);
                StreamBody::new(stream.map(|result| result.map(Frame::data))).boxed_unsync()
            }
            _ => empty_body(),
        };
        Some(builder.body(body).expect("build local cache response"))
    }

    /// Pass-through proxying for deployments without a remote cache.
    async fn direct_response(
        &self,
        method: &Method,
        req_headers: &HeaderMap,
        target: &Target,
    ) -> Response<Body> {
        let resp = match self
            .fetcher
            .forward(method.clone(), &target.url, req_headers)
            .await
        {
            Ok(resp) => resp,
            Err(err) => return error_response(&err),
        };

        let status = resp.status();
        let mut headers = resp.headers().clone();
        headers.remove(http::header::CONNECTION);
        headers.remove(http::header::SERVER);

        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());

        let mut builder = Response::builder().status(status);
        if let Some(out) = builder.headers_mut() {
            out.extend(headers);
        }

        let body = if *method == Method::GET {
            log::info!("response {} {}", target.url, content_length.unwrap_or(-1));
            bounded_incoming(resp.into_body(), content_length, target.url.clone())
        } else {
            empty_body()
        };
        builder.body(body).expect("build direct response")
    }

    pub(crate) fn not_found_response(&self, method: &Method, path: &str) -> Response<Body> {
        match &self.not_found {
            Some(handler) => handler(method, path),
            None => text_response(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

fn request_host<B>(req: &Request<B>) -> String {
    if let Some(host) = req.headers().get(HOST).and_then(|v| v.to_str().ok()) {
        return host.to_string();
    }
    req.uri().host().unwrap_or_default().to_string()
}

/// Streams an upstream body, truncated to its declared Content-Length when
/// one was reported.
fn bounded_incoming(body: Incoming, content_length: Option<i64>, url: String) -> Body {
    let limit = content_length.filter(|l| *l > 0).map(|l| l as u64);
    let stream = futures::stream::unfold(
        (body, limit, url),
        |(mut body, mut limit, url)| async move {
            loop {
                if limit == Some(0) {
                    return None;
                }
                match body.frame().await {
                    None => return None,
                    Some(Err(err)) => {
                        log::warn!("copy error {url}: {err}");
                        return Some((Err(io::Error::other(err)), (body, limit, url)));
                    }
                    Some(Ok(frame)) => {
                        let Ok(mut data) = frame.into_data() else {
                            continue;
                        };
                        if data.is_empty() {
                            continue;
                        }
                        if let Some(left) = limit.as_mut() {
                            if data.len() as u64 > *left {
                                data = data.slice(..*left as usize);
                            }
                            *left -= data.len() as u64;
                        }
                        return Some((Ok(Frame::data(data)), (body, limit, url)));
                    }
                }
            }
        },
    );
    StreamBody::new(stream).boxed_unsync()
}

fn set_meta_headers(headers: &mut HeaderMap, meta: &ObjectMeta) {
    if let Ok(value) = OCTET_STREAM.parse() {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Ok(value) = meta.size.to_string().parse() {
        headers.insert(CONTENT_LENGTH, value);
    }
    if let Some(mod_time) = meta.last_modified {
        if let Ok(value) = httpdate::fmt_http_date(mod_time).parse() {
            headers.insert(LAST_MODIFIED, value);
        }
    }
    if let Some(etag) = &meta.etag {
        if let Ok(value) = etag.parse() {
            headers.insert(ETAG, value);
        }
    }
}

fn head_meta_response(meta: &ObjectMeta) -> Response<Body> {
    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(headers) = builder.headers_mut() {
        set_meta_headers(headers, meta);
    }
    builder.body(empty_body()).expect("build head response")
}

fn redirect_response(location: &str) -> Response<Body> {
    let mut builder = Response::builder().status(StatusCode::FOUND);
    if let Ok(value) = location.parse::<http::HeaderValue>() {
        builder = builder.header(LOCATION, value);
    }
    builder.body(empty_body()).expect("build redirect")
}

pub(crate) fn error_response(err: &anyhow::Error) -> Response<Body> {
    let text = format!("{err:#}");
    log::error!("{text}");
    text_response(StatusCode::INTERNAL_SERVER_ERROR, &text)
}

pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body.to_string()))
        .expect("build text response")
}

pub fn full_body(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> Body {
    full_body(Bytes::new())
}
