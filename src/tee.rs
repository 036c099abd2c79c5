//! Tee pipeline: one origin read feeding the HTTP response, the remote
//! store writer and (optionally) a local cache file, without buffering the
//! whole object. Clients arriving while the fetch is in flight attach to
//! the same session and read from its spill buffer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use http::{HeaderMap, Method, Response};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};

use crate::constants::COPY_CHUNK_SIZE;
use crate::content::{self, Entity};
use crate::fetch::{NotOk, OriginFetcher, OriginMeta};
use crate::mirror::{empty_body, Body};
use crate::store::{ObjectStore, StoreWriter};
use crate::swmr::{Swmr, SwmrReader};

pub type SessionMap = Arc<Mutex<HashMap<String, Arc<TeeSession>>>>;

pub fn new_session_map() -> SessionMap {
    Arc::new(Mutex::new(HashMap::new()))
}

/// One in-flight tee fetch, shared by every client reading the same key.
/// Torn down once the producer has closed the spill buffer and the last
/// reader is gone.
pub struct TeeSession {
    key: String,
    meta: OriginMeta,
    swmr: Arc<Swmr>,
    tmp_path: PathBuf,
    local_final: Option<PathBuf>,
    sessions: SessionMap,
}

impl TeeSession {
    /// Issues the origin GET and spawns the detached producer. Returns once
    /// the session is readable; the upload continues regardless of what
    /// happens to the calling request.
    pub async fn start(
        fetcher: &OriginFetcher,
        store: Arc<dyn ObjectStore>,
        sessions: SessionMap,
        source_url: &str,
        key: &str,
        local_cache_dir: Option<&Path>,
    ) -> Result<Arc<TeeSession>> {
        let (body, meta) = fetcher.get(source_url).await?;

        if meta.size == 0 {
            return Err(anyhow::Error::new(NotOk).context(format!("{source_url}: zero length origin response")));
        }

        log::info!("tee cache {key} {}", meta.size);

        let (tmp_file, tmp_path, local_final) = match local_cache_dir {
            Some(dir) => {
                let final_path = dir.join(key);
                if let Some(parent) = final_path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create local cache dir for {key}"))?;
                }
                let tmp_path = with_tmp_suffix(&final_path);
                let file = std::fs::File::create(&tmp_path)
                    .with_context(|| format!("create local cache tmp for {key}"))?;
                (file, tmp_path, Some(final_path))
            }
            None => {
                let tmp = tempfile::Builder::new()
                    .prefix("depot-tee-")
                    .tempfile()
                    .context("create tee spill file")?;
                let (file, path) = tmp.into_parts();
                (file, path.keep().context("keep tee spill file")?, None)
            }
        };

        let writer = match store.writer(key).await {
            Ok(writer) => writer,
            Err(err) => {
                log::warn!("cache writer error {key} {}: {err}", meta.size);
                let _ = std::fs::remove_file(&tmp_path);
                return Err(err.into());
            }
        };

        let swmr = Swmr::new(tmp_file);
        let session = Arc::new(TeeSession {
            key: key.to_string(),
            meta,
            swmr: Arc::clone(&swmr),
            tmp_path,
            local_final,
            sessions,
        });

        let producer = Arc::clone(&session);
        tokio::spawn(async move {
            producer.pump(body, writer).await;
            producer.swmr.close();
            producer.try_release();
        });

        Ok(session)
    }

    /// Copies the origin body into the spill buffer and the store writer,
    /// then commits. Any failure cancels the upload so no partial object
    /// becomes visible.
    async fn pump(&self, mut body: Incoming, mut writer: Box<dyn StoreWriter>) {
        let size = self.meta.size;
        let mut copied: i64 = 0;

        while let Some(frame) = body.frame().await {
            let chunk = match frame {
                Ok(frame) => match frame.into_data() {
                    Ok(data) => data,
                    Err(_) => continue,
                },
                Err(err) => {
                    log::warn!("tee copy error {} {size} {copied}: {err}", self.key);
                    let _ = writer.cancel().await;
                    self.discard_local_tmp();
                    return;
                }
            };
            if chunk.is_empty() {
                continue;
            }
            if let Err(err) = self.swmr.append(&chunk) {
                log::warn!("tee spill error {} {size} {copied}: {err}", self.key);
                let _ = writer.cancel().await;
                self.discard_local_tmp();
                return;
            }
            copied += chunk.len() as i64;
            if let Err(err) = writer.write(chunk).await {
                log::warn!("cache copy error {} {size} {copied}: {err}", self.key);
                let _ = writer.cancel().await;
                self.discard_local_tmp();
                return;
            }
        }

        if size > 0 && copied != size {
            log::warn!("cache copy error {}: copied {copied} bytes, expected {size}", self.key);
            let _ = writer.cancel().await;
            self.discard_local_tmp();
            return;
        }

        if let Err(err) = writer.commit().await {
            log::warn!("cache commit error {}: {err}", self.key);
            self.discard_local_tmp();
            return;
        }

        if let Some(final_path) = &self.local_final {
            // Local rename only after the remote commit, so a present file
            // always corresponds to a committed object. Failure here loses
            // the local copy, not the response.
            if let Err(err) = std::fs::rename(&self.tmp_path, final_path) {
                log::warn!("local cache rename error {}: {err}", self.key);
            }
        }

        log::info!("tee cached {} {size} {copied}", self.key);
    }

    /// Serves this session to one request. The returned body holds a reader
    /// and a release guard, so the session stays alive until the client is
    /// done streaming.
    pub fn respond(self: Arc<Self>, method: &Method, req_headers: &HeaderMap) -> Response<Body> {
        let entity = Entity {
            size: (self.meta.size > 0).then_some(self.meta.size as u64),
            mod_time: self.meta.last_modified,
            etag: self.meta.etag.clone(),
        };
        let plan = content::plan(method, req_headers, &entity);

        let mut builder = Response::builder().status(plan.status);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(plan.headers);
        }

        let body = if plan.send_body {
            let (offset, limit) = match plan.slice {
                Some((offset, len)) => (offset, Some(len)),
                None => (0, None),
            };
            let reader = SessionReader {
                reader: Some(Arc::clone(&self.swmr).reader(offset)),
                session: Arc::clone(&self),
            };
            stream_body(reader, limit)
        } else {
            self.try_release();
            empty_body()
        };
        builder.body(body).expect("build tee response")
    }

    pub fn meta(&self) -> &OriginMeta {
        &self.meta
    }

    fn discard_local_tmp(&self) {
        if self.local_final.is_some() {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }

    /// Tears the session down once nothing can read from it anymore: the
    /// writer has closed the spill buffer and no readers remain. Safe to
    /// call any number of times from any release site.
    fn try_release(&self) {
        if !self.swmr.is_closed() {
            return;
        }
        if self.swmr.users() != 0 {
            return;
        }
        {
            let mut map = self.sessions.lock().expect("tee session map");
            if let Some(current) = map.get(&self.key) {
                if std::ptr::eq(current.as_ref(), self) {
                    map.remove(&self.key);
                }
            }
        }
        if self.local_final.is_none() {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

/// Reader plus its session handle. `Drop` releases the spill-buffer user
/// count first and only then runs the session release check, so teardown is
/// correct no matter where the response body is dropped.
struct SessionReader {
    reader: Option<SwmrReader>,
    session: Arc<TeeSession>,
}

impl SessionReader {
    async fn next_chunk(&mut self, max: usize) -> std::io::Result<bytes::Bytes> {
        match self.reader.as_mut() {
            Some(reader) => reader.next_chunk(max).await,
            None => Ok(bytes::Bytes::new()),
        }
    }
}

impl Drop for SessionReader {
    fn drop(&mut self) {
        self.reader.take();
        self.session.try_release();
    }
}

fn with_tmp_suffix(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Streams up to `limit` bytes from the spill buffer.
fn stream_body(reader: SessionReader, limit: Option<u64>) -> Body {
    let stream = futures::stream::unfold(
        (reader, limit),
        |(mut reader, mut limit)| async move {
            if limit == Some(0) {
                return None;
            }
            let cap = limit
                .map_or(COPY_CHUNK_SIZE as u64, |l| l.min(COPY_CHUNK_SIZE as u64))
                as usize;
            match reader.next_chunk(cap).await {
                Ok(chunk) if chunk.is_empty() => None,
                Ok(chunk) => {
                    if let Some(left) = limit.as_mut() {
                        *left -= chunk.len() as u64;
                    }
                    Some((Ok(Frame::data(chunk)), (reader, limit)))
                }
                Err(err) => Some((Err(err), (reader, limit))),
            }
        },
    );
    StreamBody::new(stream).boxed_unsync()
}
