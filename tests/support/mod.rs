#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;

use depot::fetch::OriginFetcher;
use depot::mirror::{Body, MirrorHandler, MirrorOptions};
use depot::store::{ByteStream, ObjectMeta, ObjectStore, StoreError, StoreWriter};

pub type OriginResponder =
    Arc<dyn Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static>;

/// Origin stand-in bound to a loopback port, with request accounting.
pub struct MockOrigin {
    addr: SocketAddr,
    gets: Arc<AtomicUsize>,
    heads: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<(String, String, String)>>>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockOrigin {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
        let addr = listener.local_addr().expect("origin addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler: OriginResponder = Arc::new(handler);
        let gets = Arc::new(AtomicUsize::new(0));
        let heads = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let gets_srv = Arc::clone(&gets);
        let heads_srv = Arc::clone(&heads);
        let seen_srv = Arc::clone(&seen);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(conn) => conn, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        let gets = Arc::clone(&gets_srv);
                        let heads = Arc::clone(&heads_srv);
                        let seen = Arc::clone(&seen_srv);
                        tokio::spawn(async move {
                            let service = service_fn(move |req: Request<Incoming>| {
                                match *req.method() {
                                    Method::GET => { gets.fetch_add(1, Ordering::SeqCst); }
                                    Method::HEAD => { heads.fetch_add(1, Ordering::SeqCst); }
                                    _ => {}
                                }
                                let host = req
                                    .headers()
                                    .get(http::header::HOST)
                                    .and_then(|v| v.to_str().ok())
                                    .unwrap_or_default()
                                    .to_string();
                                seen.lock().expect("seen").push((
                                    req.method().to_string(),
                                    host,
                                    req.uri().path().to_string(),
                                ));
                                let resp = handler(req);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            gets,
            heads,
            seen,
            shutdown: Some(shutdown),
        }
    }

    pub fn authority(&self) -> String {
        self.addr.to_string()
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn heads(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<(String, String, String)> {
        self.seen.lock().expect("seen").clone()
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

struct StoredObject {
    data: Bytes,
    last_modified: SystemTime,
    etag: String,
}

#[derive(Default)]
struct MemStoreInner {
    objects: Mutex<HashMap<String, StoredObject>>,
    commits: AtomicUsize,
    cancels: AtomicUsize,
    stat_canceled: AtomicBool,
}

/// In-memory object store with fake presigning and commit/cancel
/// accounting.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<MemStoreInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let etag = format!("\"{:x}\"", md5::compute(&data));
        self.inner.objects.lock().expect("objects").insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: SystemTime::now(),
                etag,
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.inner
            .objects
            .lock()
            .expect("objects")
            .get(key)
            .map(|obj| obj.data.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.objects.lock().expect("objects").len()
    }

    pub fn commits(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.inner.cancels.load(Ordering::SeqCst)
    }

    pub fn set_stat_canceled(&self, canceled: bool) {
        self.inner.stat_canceled.store(canceled, Ordering::SeqCst);
    }

    pub fn signed_get_url(&self, key: &str, expires: Duration) -> String {
        format!(
            "https://signed.store.invalid/{key}?method=GET&expires={}",
            expires.as_secs()
        )
    }

    pub fn signed_head_url(&self, key: &str, expires: Duration) -> String {
        format!(
            "https://signed.store.invalid/{key}?method=HEAD&expires={}",
            expires.as_secs()
        )
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn stat(&self, key: &str) -> Result<ObjectMeta, StoreError> {
        if self.inner.stat_canceled.load(Ordering::SeqCst) {
            return Err(StoreError::Canceled);
        }
        let objects = self.inner.objects.lock().expect("objects");
        match objects.get(key) {
            Some(obj) => Ok(ObjectMeta {
                size: obj.data.len() as u64,
                last_modified: Some(obj.last_modified),
                etag: Some(obj.etag.clone()),
            }),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn reader(&self, key: &str) -> Result<(ByteStream, ObjectMeta), StoreError> {
        let objects = self.inner.objects.lock().expect("objects");
        let obj = objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let meta = ObjectMeta {
            size: obj.data.len() as u64,
            last_modified: Some(obj.last_modified),
            etag: Some(obj.etag.clone()),
        };
        let data = obj.data.clone();
        let stream = futures::stream::iter(vec![Ok::<_, io::Error>(data)]).boxed();
        Ok((stream, meta))
    }

    async fn writer(&self, key: &str) -> Result<Box<dyn StoreWriter>, StoreError> {
        Ok(Box::new(MemWriter {
            store: self.clone(),
            key: key.to_string(),
            buf: Vec::new(),
            done: false,
        }))
    }

    fn sign_get(&self, key: &str, expires: Duration) -> Result<String, StoreError> {
        Ok(self.signed_get_url(key, expires))
    }

    fn sign_head(&self, key: &str, expires: Duration) -> Result<String, StoreError> {
        Ok(self.signed_head_url(key, expires))
    }
}

struct MemWriter {
    store: MemStore,
    key: String,
    buf: Vec<u8>,
    done: bool,
}

#[async_trait]
impl StoreWriter for MemWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<(), StoreError> {
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.done = true;
        self.store.inner.commits.fetch_add(1, Ordering::SeqCst);
        self.store.seed(&self.key, std::mem::take(&mut self.buf));
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), StoreError> {
        self.done = true;
        self.store.inner.cancels.fetch_add(1, Ordering::SeqCst);
        self.buf.clear();
        Ok(())
    }
}

/// A mirror wired to a mock origin and an in-memory store.
pub struct TestMirror {
    pub handler: Arc<MirrorHandler>,
    pub store: MemStore,
    pub origin: MockOrigin,
}

impl TestMirror {
    pub async fn request(&self, method: Method, host: &str, path: &str) -> Response<Body> {
        self.request_with(method, host, path, |_| {}).await
    }

    pub async fn request_with<F>(
        &self,
        method: Method,
        host: &str,
        path: &str,
        edit: F,
    ) -> Response<Body>
    where
        F: FnOnce(&mut HeaderMap),
    {
        let mut req = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, host)
            .body(Empty::<Bytes>::new())
            .expect("build request");
        edit(req.headers_mut());
        Arc::clone(&self.handler).handle(req).await
    }
}

/// Builds a handler against `origin`, with `tweak` adjusting the options
/// before construction. The store is pre-wired unless the tweak removes it.
pub async fn mirror_with<F, T>(origin_handler: F, tweak: T) -> TestMirror
where
    F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    T: FnOnce(&mut MirrorOptions),
{
    let origin = MockOrigin::start(origin_handler).await;
    let store = MemStore::new();
    let mut opts = MirrorOptions {
        fetcher: OriginFetcher::new().override_origin(origin.authority()),
        remote_cache: Some(Arc::new(store.clone())),
        ..MirrorOptions::default()
    };
    tweak(&mut opts);
    TestMirror {
        handler: MirrorHandler::new(opts),
        store,
        origin,
    }
}

pub async fn body_bytes(resp: Response<Body>) -> Bytes {
    resp.into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes()
}

pub fn header<'r>(resp: &'r Response<Body>, name: &str) -> Option<&'r str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

/// A plain 200 file response with Content-Length and Last-Modified.
pub fn serve_bytes(payload: Bytes) -> impl Fn(Request<Incoming>) -> Response<Full<Bytes>> {
    move |_req| file_response(StatusCode::OK, payload.clone())
}

pub fn file_response(status: StatusCode, payload: Bytes) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_LENGTH, payload.len().to_string())
        .header(
            http::header::LAST_MODIFIED,
            httpdate::fmt_http_date(SystemTime::now()),
        )
        .body(Full::new(payload))
        .expect("build origin response")
}

pub fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("build origin response")
}

pub fn gen_payload(size: usize) -> Bytes {
    use rand::RngCore;
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Polls `cond` until it holds or `timeout` elapses.
pub async fn wait_for<F>(mut cond: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
