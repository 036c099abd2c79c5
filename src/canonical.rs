//! Request admission: path cleaning, domain validation and cache-key
//! derivation. Everything here is pure so the handler can reject early
//! without touching the network.

/// Outcome of admitting a request path + host pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Effective origin host (after first-path extraction and base-domain
    /// stripping).
    pub host: String,
    /// Cleaned, still percent-encoded path, always starting with `/`.
    pub path: String,
    /// Reconstructed upstream URL, query stripped.
    pub url: String,
    /// Cache key: `<host><clean path>`.
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    NotFound,
    Forbidden,
}

#[derive(Debug, Clone, Default)]
pub struct Admission {
    pub base_domain: String,
    pub host_from_first_path: bool,
    pub block_suffixes: Vec<String>,
}

impl Admission {
    /// Resolves the effective origin target for a request, or the status it
    /// must be rejected with. `raw_path` is the percent-encoded request
    /// path, `req_host` the Host header value.
    pub fn resolve(&self, req_host: &str, raw_path: &str) -> Result<Target, Reject> {
        let mut path = raw_path.to_string();
        if path.is_empty() || path.ends_with('/') {
            return Err(Reject::NotFound);
        }
        for suffix in &self.block_suffixes {
            if !suffix.is_empty() && path.ends_with(suffix.as_str()) {
                return Err(Reject::Forbidden);
            }
        }

        let mut host = req_host.to_string();
        if self.host_from_first_path {
            let mut segments = path[1..].splitn(2, '/');
            host = segments.next().unwrap_or_default().to_string();
            path = format!("/{}", segments.next().unwrap_or_default());
            if path == "/" {
                return Err(Reject::NotFound);
            }
        }

        if !host.contains('.') || !is_valid_domain(&host) {
            return Err(Reject::NotFound);
        }

        if !self.base_domain.is_empty() {
            if !host.ends_with(&self.base_domain) {
                return Err(Reject::NotFound);
            }
            host.truncate(host.len() - self.base_domain.len());
        }

        let path = clean_path(&path);
        let url = format!("https://{host}{path}");
        let key = format!("{host}{path}");
        Ok(Target { host, path, url, key })
    }
}

/// Lexically cleans a slash-separated path: empty and `.` segments are
/// dropped, `..` pops one prior segment when there is one. The result is
/// rooted and never ends with a slash unless it is `/` itself.
pub fn clean_path(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return "/".to_string();
    }
    format!("/{}", out.join("/"))
}

const INVALID_HOST_CHARS: &str = "`~!@#$%^&*()+={}[]|\\\"';:><?/";

/// Syntactic domain check per RFC 1035 / RFC 3696. Deliberately
/// non-exhaustive: anything that slips through fails at connect time.
pub fn is_valid_domain(host: &str) -> bool {
    let host = host.trim();
    if host.is_empty() || host.len() > 255 {
        return false;
    }
    if host.starts_with('-') || host.ends_with('-') {
        return false;
    }
    if host.starts_with('_') || host.ends_with('_') {
        return false;
    }
    if host.starts_with('.') {
        return false;
    }
    if host.chars().any(|c| INVALID_HOST_CHARS.contains(c)) {
        return false;
    }
    true
}
