//! Entity-serving decisions shared by the tee path, the local-cache fast
//! path and direct store streaming: single byte ranges, Last-Modified /
//! If-Modified-Since, and advisory ETag handling.

use std::time::SystemTime;

use http::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, LAST_MODIFIED, RANGE,
};
use http::{HeaderMap, Method, StatusCode};

pub const OCTET_STREAM: &str = "application/octet-stream";

/// What is known about the entity being served. A `None` size means the
/// producer is still streaming with no declared length: no ranges, no
/// Content-Length.
#[derive(Debug, Clone, Default)]
pub struct Entity {
    pub size: Option<u64>,
    pub mod_time: Option<SystemTime>,
    pub etag: Option<String>,
}

/// A computed response: status, headers, and the byte window to stream.
/// `slice` is `None` when the body is unbounded; `send_body` folds in the
/// request method and status.
#[derive(Debug)]
pub struct Plan {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub slice: Option<(u64, u64)>,
    pub send_body: bool,
}

pub fn plan(method: &Method, req_headers: &HeaderMap, entity: &Entity) -> Plan {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, OCTET_STREAM.parse().expect("static header"));
    if let Some(mod_time) = entity.mod_time {
        if let Ok(value) = httpdate::fmt_http_date(mod_time).parse() {
            headers.insert(LAST_MODIFIED, value);
        }
    }
    if let Some(etag) = &entity.etag {
        if let Ok(value) = etag.parse() {
            headers.insert(ETAG, value);
        }
    }

    if not_modified(req_headers, entity) {
        headers.remove(CONTENT_TYPE);
        return Plan {
            status: StatusCode::NOT_MODIFIED,
            headers,
            slice: None,
            send_body: false,
        };
    }

    let Some(size) = entity.size else {
        return Plan {
            status: StatusCode::OK,
            headers,
            slice: None,
            send_body: *method == Method::GET,
        };
    };

    if let Ok(value) = "bytes".parse() {
        headers.insert(ACCEPT_RANGES, value);
    }

    let range = req_headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|raw| parse_range(raw, size))
        .unwrap_or(RangeOutcome::None);

    match range {
        RangeOutcome::Satisfiable(start, end) => {
            let len = end - start + 1;
            insert_unchecked(&mut headers, CONTENT_RANGE, format!("bytes {start}-{end}/{size}"));
            insert_unchecked(&mut headers, CONTENT_LENGTH, len.to_string());
            Plan {
                status: StatusCode::PARTIAL_CONTENT,
                headers,
                slice: Some((start, len)),
                send_body: *method == Method::GET,
            }
        }
        RangeOutcome::Unsatisfiable => {
            insert_unchecked(&mut headers, CONTENT_RANGE, format!("bytes */{size}"));
            Plan {
                status: StatusCode::RANGE_NOT_SATISFIABLE,
                headers,
                slice: None,
                send_body: false,
            }
        }
        RangeOutcome::None => {
            insert_unchecked(&mut headers, CONTENT_LENGTH, size.to_string());
            Plan {
                status: StatusCode::OK,
                headers,
                slice: Some((0, size)),
                send_body: *method == Method::GET,
            }
        }
    }
}

/// Weak validator for local cache files, derived from filesystem metadata.
pub fn file_etag(meta: &std::fs::Metadata) -> Option<String> {
    let mtime = meta
        .modified()
        .ok()?
        .duration_since(SystemTime::UNIX_EPOCH)
        .ok()?;
    Some(format!("W/\"{:x}-{:x}\"", mtime.as_secs(), meta.len()))
}

fn not_modified(req_headers: &HeaderMap, entity: &Entity) -> bool {
    if let Some(raw) = req_headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        // If-None-Match, when present, takes precedence.
        let Some(etag) = &entity.etag else {
            return false;
        };
        return raw
            .split(',')
            .map(str::trim)
            .any(|candidate| candidate == "*" || candidate == etag);
    }
    match (
        req_headers
            .get(IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok()),
        entity.mod_time,
    ) {
        (Some(since), Some(mod_time)) => {
            // HTTP dates have second granularity.
            let mod_secs = mod_time
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let since_secs = since
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            mod_secs <= since_secs
        }
        _ => false,
    }
}

fn insert_unchecked(headers: &mut HeaderMap, name: http::header::HeaderName, value: String) {
    if let Ok(value) = value.parse() {
        headers.insert(name, value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeOutcome {
    /// No usable range: absent, multi-range, or malformed enough to ignore.
    None,
    /// Inclusive start/end within the entity.
    Satisfiable(u64, u64),
    Unsatisfiable,
}

fn parse_range(raw: &str, size: u64) -> RangeOutcome {
    let Some(spec) = raw.trim().strip_prefix("bytes=") else {
        return RangeOutcome::None;
    };
    if spec.contains(',') {
        // Multi-range requests get the full entity.
        return RangeOutcome::None;
    }
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return RangeOutcome::None;
    };
    let start_str = start_str.trim();
    let end_str = end_str.trim();

    if start_str.is_empty() {
        // Suffix form: bytes=-N.
        let Ok(suffix) = end_str.parse::<u64>() else {
            return RangeOutcome::None;
        };
        if suffix == 0 || size == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        return RangeOutcome::Satisfiable(size.saturating_sub(suffix), size - 1);
    }

    let Ok(start) = start_str.parse::<u64>() else {
        return RangeOutcome::None;
    };
    if start >= size {
        return RangeOutcome::Unsatisfiable;
    }
    let end = if end_str.is_empty() {
        size - 1
    } else {
        match end_str.parse::<u64>() {
            Ok(end) if end >= start => end.min(size - 1),
            Ok(_) => return RangeOutcome::Unsatisfiable,
            Err(_) => return RangeOutcome::None,
        }
    };
    RangeOutcome::Satisfiable(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entity(size: u64) -> Entity {
        Entity {
            size: Some(size),
            mod_time: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
            etag: Some("\"abc\"".to_string()),
        }
    }

    #[test]
    fn range_grammar() {
        assert_eq!(parse_range("bytes=0-4", 10), RangeOutcome::Satisfiable(0, 4));
        assert_eq!(parse_range("bytes=5-", 10), RangeOutcome::Satisfiable(5, 9));
        assert_eq!(parse_range("bytes=-3", 10), RangeOutcome::Satisfiable(7, 9));
        assert_eq!(parse_range("bytes=0-99", 10), RangeOutcome::Satisfiable(0, 9));
        assert_eq!(parse_range("bytes=10-", 10), RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range("bytes=-0", 10), RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range("bytes=4-2", 10), RangeOutcome::Unsatisfiable);
        assert_eq!(parse_range("bytes=0-2,4-6", 10), RangeOutcome::None);
        assert_eq!(parse_range("items=0-2", 10), RangeOutcome::None);
    }

    #[test]
    fn full_body_plan() {
        let plan = plan(&Method::GET, &HeaderMap::new(), &entity(10));
        assert_eq!(plan.status, StatusCode::OK);
        assert_eq!(plan.slice, Some((0, 10)));
        assert!(plan.send_body);
        assert_eq!(plan.headers.get(CONTENT_LENGTH).unwrap(), "10");
        assert!(plan.headers.get(LAST_MODIFIED).is_some());
    }

    #[test]
    fn head_has_headers_but_no_body() {
        let plan = plan(&Method::HEAD, &HeaderMap::new(), &entity(10));
        assert_eq!(plan.status, StatusCode::OK);
        assert!(!plan.send_body);
        assert_eq!(plan.headers.get(CONTENT_LENGTH).unwrap(), "10");
    }

    #[test]
    fn partial_content_plan() {
        let mut req = HeaderMap::new();
        req.insert(RANGE, "bytes=2-5".parse().unwrap());
        let plan = plan(&Method::GET, &req, &entity(10));
        assert_eq!(plan.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(plan.slice, Some((2, 4)));
        assert_eq!(plan.headers.get(CONTENT_RANGE).unwrap(), "bytes 2-5/10");
        assert_eq!(plan.headers.get(CONTENT_LENGTH).unwrap(), "4");
    }

    #[test]
    fn unsatisfiable_range_plan() {
        let mut req = HeaderMap::new();
        req.insert(RANGE, "bytes=50-".parse().unwrap());
        let plan = plan(&Method::GET, &req, &entity(10));
        assert_eq!(plan.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert!(plan.slice.is_none());
        assert!(!plan.send_body);
        assert_eq!(plan.headers.get(CONTENT_RANGE).unwrap(), "bytes */10");
    }

    #[test]
    fn unknown_size_streams_without_length() {
        let plan = plan(
            &Method::GET,
            &HeaderMap::new(),
            &Entity {
                size: None,
                mod_time: None,
                etag: None,
            },
        );
        assert_eq!(plan.status, StatusCode::OK);
        assert!(plan.slice.is_none());
        assert!(plan.send_body);
        assert!(plan.headers.get(CONTENT_LENGTH).is_none());
        assert!(plan.headers.get(ACCEPT_RANGES).is_none());
    }

    #[test]
    fn if_modified_since_hits_304() {
        let ent = entity(10);
        let mut req = HeaderMap::new();
        req.insert(
            IF_MODIFIED_SINCE,
            httpdate::fmt_http_date(ent.mod_time.unwrap()).parse().unwrap(),
        );
        let plan = plan(&Method::GET, &req, &ent);
        assert_eq!(plan.status, StatusCode::NOT_MODIFIED);
        assert!(!plan.send_body);
    }

    #[test]
    fn if_none_match_hits_304() {
        let ent = entity(10);
        let mut req = HeaderMap::new();
        req.insert(IF_NONE_MATCH, "\"abc\"".parse().unwrap());
        assert_eq!(plan(&Method::GET, &req, &ent).status, StatusCode::NOT_MODIFIED);

        req.insert(IF_NONE_MATCH, "\"other\"".parse().unwrap());
        assert_eq!(plan(&Method::GET, &req, &ent).status, StatusCode::OK);
    }
}
