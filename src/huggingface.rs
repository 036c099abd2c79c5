//! Hugging Face mirror support: resolve the repo commit for
//! `/…/resolve/<ref>/…` paths so clients get an `X-Repo-Commit` header,
//! with revision metadata cached like any other object.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::TryStreamExt;
use serde::Deserialize;

use crate::canonical::Target;
use crate::fetch::is_not_ok;
use crate::freshness::{self, Verdict};
use crate::mirror::MirrorHandler;
use crate::store::{ObjectStore, StoreError};

const HF_HOSTS: [&str; 2] = ["huggingface.co", "hf-mirror.com"];

const RESOLVE_MARKER: &str = "/resolve/";

#[derive(Deserialize)]
struct Revision {
    #[serde(default)]
    sha: String,
}

impl MirrorHandler {
    /// Returns the commit sha to attach to the response, if the request is
    /// a Hugging Face `resolve` path. A full 40-hex ref is used as-is;
    /// symbolic refs are resolved through the cached revision endpoint.
    pub(crate) async fn huggingface_commit(
        self: Arc<Self>,
        target: &Target,
    ) -> Result<Option<String>> {
        let Some(store) = self.remote_cache.clone() else {
            return Ok(None);
        };
        if !HF_HOSTS.contains(&target.host.as_str()) {
            return Ok(None);
        }
        let Some(idx) = target.path.find(RESOLVE_MARKER) else {
            return Ok(None);
        };

        let mut repo_ref = &target.path[idx + RESOLVE_MARKER.len()..];
        if let Some(slash) = repo_ref.find('/') {
            repo_ref = &repo_ref[..slash];
        }
        if repo_ref.len() == 40 && repo_ref.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(Some(repo_ref.to_string()));
        }

        let mut repo_name = &target.path[1..idx];
        let mut repo_type = "models";
        if let Some(rest) = repo_name.strip_prefix("datasets/") {
            repo_type = "datasets";
            repo_name = rest;
        } else if let Some(rest) = repo_name.strip_prefix("spaces/") {
            repo_type = "spaces";
            repo_name = rest;
        }

        let file = format!("{}/api/{repo_type}/{repo_name}/revision/{repo_ref}", target.host);
        let url = format!("https://{file}");
        log::info!("hf repo info {file}");

        let cache_info = match store.stat(&file).await {
            Ok(meta) => Some(meta),
            Err(StoreError::Canceled) => {
                return Err(anyhow!("request canceled during repo stat"));
            }
            Err(err) => {
                log::info!("hf cache miss {file}: {err}");
                None
            }
        };

        if let Some(info) = &cache_info {
            log::info!("hf cache hit {file}");
            if self.orchestrator.is_none() {
                match freshness::arbitrate(&self.fetcher, &url, info.size, self.check_sync_timeout)
                    .await
                {
                    Verdict::ServeCache => return Ok(self.read_repo_sha(&store, &file).await),
                    Verdict::Refresh => log::info!("hf source change {file}"),
                }
            }
        }

        let (outcome, _shared) = {
            let this = Arc::clone(&self);
            let refresh_url = url.clone();
            let key = file.clone();
            self.refresh_group
                .run(file.clone(), move || async move {
                    this.refresh(&refresh_url, &key).await.map_err(Arc::new)
                })
                .await
        };

        match outcome {
            Ok(()) => Ok(self.read_repo_sha(&store, &file).await),
            Err(err) => {
                if cache_info.is_some() {
                    log::warn!("hf recache error {file}: {err:#}");
                    return Ok(self.read_repo_sha(&store, &file).await);
                }
                if is_not_ok(&err) {
                    return Ok(None);
                }
                Err(anyhow!("{err:#}"))
            }
        }
    }

    async fn read_repo_sha(&self, store: &Arc<dyn ObjectStore>, file: &str) -> Option<String> {
        let (stream, _meta) = match store.reader(file).await {
            Ok(found) => found,
            Err(err) => {
                log::info!("hf repo reader error {file}: {err}");
                return None;
            }
        };
        let body = stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .ok()?;
        let revision: Revision = serde_json::from_slice(&body).ok()?;
        if revision.sha.is_empty() {
            None
        } else {
            Some(revision.sha)
        }
    }
}
