//! Freshness arbitration for cached objects: a bounded origin HEAD probe
//! compared by size. The probe fails open — when the origin cannot answer
//! in time, the cache wins over an error.

use std::time::Duration;

use crate::fetch::OriginFetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    ServeCache,
    Refresh,
}

/// Decides whether a cached object of `cache_size` bytes may be served for
/// `url`. A zero `probe_timeout` disables probing entirely.
pub async fn arbitrate(
    fetcher: &OriginFetcher,
    url: &str,
    cache_size: u64,
    probe_timeout: Duration,
) -> Verdict {
    if probe_timeout.is_zero() {
        return Verdict::ServeCache;
    }
    match tokio::time::timeout(probe_timeout, fetcher.head(url)).await {
        Err(_) => {
            log::debug!("source probe timeout {url}, serving cache");
            Verdict::ServeCache
        }
        Ok(Err(err)) => {
            log::debug!("source probe miss {url}: {err:#}, serving cache");
            Verdict::ServeCache
        }
        Ok(Ok(meta)) => compare_sizes(meta.size, cache_size),
    }
}

/// Size is the only decisive signal. An unknown or unreported origin size
/// (`<= 0`) never invalidates an existing object; ETag and Last-Modified
/// are surfaced to clients but do not gate refresh.
pub fn compare_sizes(origin_size: i64, cache_size: u64) -> Verdict {
    if cache_size != 0 && (origin_size <= 0 || origin_size as u64 == cache_size) {
        Verdict::ServeCache
    } else {
        Verdict::Refresh
    }
}
