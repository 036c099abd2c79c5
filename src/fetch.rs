//! Origin fetcher: HEAD/GET against upstream origins through a TLS-capable
//! hyper client, with bounded redirect following.

use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::header::{HOST, LOCATION};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::constants::DEFAULT_REDIRECT_LIMIT;

/// Marker for upstream responses that must surface as "not found" rather
/// than an internal error: non-200 statuses and zero-length bodies at
/// cache-write time. Detected with `is_not_ok` through anyhow chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("http status not ok")]
pub struct NotOk;

pub fn is_not_ok(err: &anyhow::Error) -> bool {
    err.downcast_ref::<NotOk>().is_some()
}

/// Metadata derived from an origin response's headers.
#[derive(Debug, Clone)]
pub struct OriginMeta {
    pub url: String,
    /// Content length in bytes, `-1` when the origin did not report one.
    pub size: i64,
    pub last_modified: Option<SystemTime>,
    pub etag: Option<String>,
}

impl OriginMeta {
    fn from_response(url: &str, resp: &Response<Incoming>) -> Self {
        let size = resp
            .headers()
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(-1);
        let last_modified = resp
            .headers()
            .get(http::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok());
        let etag = resp
            .headers()
            .get(http::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string());
        Self {
            url: url.to_string(),
            size,
            last_modified,
            etag,
        }
    }
}

type OriginClient = Client<HttpsConnector<HttpConnector>, Empty<Bytes>>;

/// HTTP client for origin traffic. Redirects are followed manually (and
/// logged) up to `redirect_limit` hops, matching the mirror's read-only
/// access pattern where every hop is a GET or HEAD.
#[derive(Clone)]
pub struct OriginFetcher {
    client: OriginClient,
    redirect_limit: usize,
    origin_override: Option<String>,
}

impl Default for OriginFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl OriginFetcher {
    pub fn new() -> Self {
        Self::with_redirect_limit(DEFAULT_REDIRECT_LIMIT)
    }

    pub fn with_redirect_limit(redirect_limit: usize) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpsConnector::new());
        Self {
            client,
            redirect_limit,
            origin_override: None,
        }
    }

    /// Routes every origin request to `authority` (plain HTTP) while
    /// keeping the logical Host header. The egress equivalent of a custom
    /// dialer; also what the test harness points at its mock origins.
    pub fn override_origin(mut self, authority: impl Into<String>) -> Self {
        self.origin_override = Some(authority.into());
        self
    }

    /// HEAD an origin URL. Fails with a `NotOk`-wrapping error when the
    /// status is not 200.
    pub async fn head(&self, url: &str) -> Result<OriginMeta> {
        let (resp, final_url) = self.request(Method::HEAD, url, None).await?;
        if resp.status() != StatusCode::OK {
            return Err(not_ok(&final_url, resp.status()));
        }
        Ok(OriginMeta::from_response(url, &resp))
    }

    /// GET an origin URL, returning the streaming body and its metadata.
    /// On non-200 the body is dropped and a `NotOk`-wrapping error is
    /// returned.
    pub async fn get(&self, url: &str) -> Result<(Incoming, OriginMeta)> {
        let (resp, final_url) = self.request(Method::GET, url, None).await?;
        if resp.status() != StatusCode::OK {
            return Err(not_ok(&final_url, resp.status()));
        }
        let meta = OriginMeta::from_response(url, &resp);
        Ok((resp.into_body(), meta))
    }

    /// Forwards a request verbatim for direct proxy mode: any status comes
    /// back, redirects are still followed with the same bound.
    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<Response<Incoming>> {
        let (resp, _) = self.request(method, url, Some(headers)).await?;
        Ok(resp)
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: Option<&HeaderMap>,
    ) -> Result<(Response<Incoming>, String)> {
        let mut url = url.to_string();
        for _ in 0..=self.redirect_limit {
            let (uri, host) = self.route(&url)?;
            let mut builder = Request::builder().method(method.clone()).uri(uri);
            if let Some(headers) = headers {
                for (k, v) in headers.iter() {
                    if *k != HOST {
                        builder = builder.header(k, v);
                    }
                }
            }
            let req = builder
                .header(HOST, host.as_str())
                .body(Empty::<Bytes>::new())
                .context("build origin request")?;

            let resp = self
                .client
                .request(req)
                .await
                .with_context(|| format!("origin request {url}"))?;

            if resp.status().is_redirection() {
                if let Some(location) = resp.headers().get(LOCATION).and_then(|v| v.to_str().ok())
                {
                    let next = resolve_location(&url, location)?;
                    log::debug!("redirect {next}");
                    url = next;
                    continue;
                }
            }
            return Ok((resp, url));
        }
        Err(anyhow!("{url}: stopped after {} redirects", self.redirect_limit))
    }

    /// Splits a URL into the URI actually dialed and the Host header value.
    fn route(&self, url: &str) -> Result<(Uri, String)> {
        let uri: Uri = url.parse().with_context(|| format!("invalid origin url {url}"))?;
        let host = uri
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| anyhow!("origin url {url} has no host"))?;
        match &self.origin_override {
            None => Ok((uri, host)),
            Some(authority) => {
                let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
                let routed: Uri = format!("http://{authority}{path}")
                    .parse()
                    .with_context(|| format!("invalid origin override {authority}"))?;
                Ok((routed, host))
            }
        }
    }
}

fn not_ok(url: &str, status: StatusCode) -> anyhow::Error {
    anyhow::Error::new(NotOk).context(format!("{url}: http status {status}"))
}

fn resolve_location(current: &str, location: &str) -> Result<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(location.to_string());
    }
    let uri: Uri = current.parse().context("parse redirect base")?;
    let scheme = uri.scheme_str().unwrap_or("https");
    let authority = uri
        .authority()
        .map(|a| a.as_str())
        .ok_or_else(|| anyhow!("redirect base {current} has no host"))?;
    if location.starts_with('/') {
        return Ok(format!("{scheme}://{authority}{location}"));
    }
    let base_path = uri.path();
    let dir = match base_path.rfind('/') {
        Some(idx) => &base_path[..=idx],
        None => "/",
    };
    Ok(format!("{scheme}://{authority}{dir}{location}"))
}
