use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::constants::DEFAULT_LINK_EXPIRES;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    /// Fail startup on unknown config keys instead of warning.
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub mirror: Mirror,
    #[serde(default)]
    pub storage: Option<Storage>,
    #[serde(default)]
    pub upstream: Upstream,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if let Some(storage) = &self.storage {
            if storage.root.as_os_str().is_empty() {
                return Err(anyhow!("storage.root is required when storage is set"));
            }
        }
        if self.mirror.local_cache_dir.is_some() && !self.mirror.tee_response {
            return Err(anyhow!(
                "mirror.local_cache_dir is only meaningful with mirror.tee_response"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    /// Log file path; empty logs to stderr only.
    #[serde(default)]
    pub path: String,
    /// Rotation threshold in MiB; 0 disables rotation.
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
}

#[derive(Debug, Deserialize, Default)]
pub struct Server {
    #[serde(default)]
    pub addr: String,
}

#[derive(Debug, Deserialize)]
pub struct Mirror {
    /// Expiry for presigned URLs issued on cache hits.
    #[serde(default = "default_link_expires", with = "humantime_serde")]
    pub link_expires: Duration,
    /// Host suffix filter; requests to other hosts are rejected.
    #[serde(default)]
    pub base_domain: String,
    /// Take the origin host from the first path segment instead of Host.
    #[serde(default)]
    pub host_from_first_path: bool,
    #[serde(default)]
    pub block_suffixes: Vec<String>,
    /// Bound for origin freshness probes; 0 disables probing.
    #[serde(default, with = "humantime_serde")]
    pub check_sync_timeout: Duration,
    /// Serve cached bytes directly instead of redirecting to signed URLs.
    #[serde(default)]
    pub no_redirect: bool,
    /// Stream miss responses live while uploading to the cache.
    #[serde(default)]
    pub tee_response: bool,
    #[serde(default)]
    pub local_cache_dir: Option<PathBuf>,
}

impl Default for Mirror {
    fn default() -> Self {
        Self {
            link_expires: DEFAULT_LINK_EXPIRES,
            base_domain: String::new(),
            host_from_first_path: false,
            block_suffixes: Vec::new(),
            check_sync_timeout: Duration::ZERO,
            no_redirect: false,
            tee_response: false,
            local_cache_dir: None,
        }
    }
}

fn default_link_expires() -> Duration {
    DEFAULT_LINK_EXPIRES
}

/// Remote cache backing store. Absent entirely means direct proxy mode.
#[derive(Debug, Deserialize, Default)]
pub struct Storage {
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub root: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct Upstream {
    #[serde(default = "default_redirect_limit")]
    pub redirect_limit: usize,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            redirect_limit: default_redirect_limit(),
        }
    }
}

fn default_redirect_limit() -> usize {
    crate::constants::DEFAULT_REDIRECT_LIMIT
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;

    Ok((cfg, ignored))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg: Bootstrap = serde_yaml::from_str("server:\n  addr: :8080\n").expect("parse");
        assert_eq!(cfg.mirror.link_expires, DEFAULT_LINK_EXPIRES);
        assert!(!cfg.mirror.tee_response);
        assert!(cfg.storage.is_none());
        assert_eq!(cfg.upstream.redirect_limit, 10);
        cfg.validate().expect("valid");
    }

    #[test]
    fn durations_use_humantime() {
        let cfg: Bootstrap = serde_yaml::from_str(
            "server:\n  addr: :8080\nmirror:\n  link_expires: 1h\n  check_sync_timeout: 2s\n",
        )
        .expect("parse");
        assert_eq!(cfg.mirror.link_expires, Duration::from_secs(3600));
        assert_eq!(cfg.mirror.check_sync_timeout, Duration::from_secs(2));
    }

    #[test]
    fn local_cache_requires_tee() {
        let cfg: Bootstrap = serde_yaml::from_str(
            "server:\n  addr: :8080\nmirror:\n  local_cache_dir: /tmp/depot\n",
        )
        .expect("parse");
        assert!(cfg.validate().is_err());
    }
}
