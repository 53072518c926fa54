//! Canonical HTTP model (spec §3, §4.1).
//!
//! `Request`/`Response` are pure data: the persistence-ready, lossless
//! stand-ins for a live HTTP message. Grounded in
//! `examples/original_source/pkg/http/{requests,response}.go` for the exact
//! field semantics (what gets copied, what gets dropped, how the
//! body/form split is decided) and in `proxy_server.rs`'s header/body
//! handling for the Rust idiom (hyper `HeaderMap`, `Bytes` bodies).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered multimap: declaration order and duplicate values are both
/// significant and must survive persistence (spec §9 "Dynamic maps of
/// lists").
pub type MultiMap = IndexMap<String, Vec<String>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    /// Assigned by the store at persistence time; `None` before `SaveRequest`.
    pub id: Option<i64>,
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query_params: MultiMap,
    pub headers: MultiMap,
    pub cookies: IndexMap<String, String>,
    pub form_params: MultiMap,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: Option<i64>,
    pub request_id: i64,
    pub status_code: u16,
    pub headers: MultiMap,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

fn is_form_encoded(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().eq_ignore_ascii_case(FORM_URLENCODED))
        .unwrap_or(false)
}

fn headers_to_multimap(headers: &HeaderMap) -> MultiMap {
    let mut map: MultiMap = IndexMap::new();
    for (name, value) in headers.iter() {
        let value = value.to_str().unwrap_or_default().to_string();
        map.entry(name.as_str().to_string()).or_default().push(value);
    }
    map
}

fn multimap_to_headers(map: &MultiMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in map {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    headers
}

fn cookies_from_headers(headers: &HeaderMap) -> IndexMap<String, String> {
    let mut cookies = IndexMap::new();
    for value in headers.get_all(http::header::COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            if let Some((name, val)) = pair.split_once('=') {
                // last value wins on name collision
                cookies.insert(name.trim().to_string(), val.trim().to_string());
            }
        }
    }
    cookies
}

fn query_params_from_uri(uri: &http::Uri) -> MultiMap {
    let mut map: MultiMap = IndexMap::new();
    if let Some(query) = uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            map.entry(key.into_owned()).or_default().push(value.into_owned());
        }
    }
    map
}

fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

/// The pieces of a live HTTP request needed to canonicalize it. Decoupled
/// from any particular hyper body type so both the plain leg (`Incoming`)
/// and the MITM leg (also `Incoming`, over TLS) share one code path once
/// the body has been collected into `Bytes`.
pub struct LiveRequestParts<'a> {
    pub method: &'a Method,
    pub uri: &'a http::Uri,
    pub headers: &'a HeaderMap,
    pub host: &'a str,
    pub scheme: &'a str,
    pub body: Bytes,
}

/// ParseRequest(live) -> Request (spec §4.1).
///
/// Reading `body` is considered to exhaust the live message's body stream;
/// callers must collect the body before calling this.
pub fn parse_request(parts: LiveRequestParts<'_>) -> Request {
    let content_type = parts
        .headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let (body, form_params) = if is_form_encoded(content_type) {
        let mut form: MultiMap = IndexMap::new();
        for (key, value) in url::form_urlencoded::parse(&parts.body) {
            form.entry(key.into_owned()).or_default().push(value.into_owned());
        }
        (String::new(), form)
    } else {
        (String::from_utf8_lossy(&parts.body).into_owned(), IndexMap::new())
    };

    Request {
        id: None,
        method: parts.method.as_str().to_uppercase(),
        scheme: parts.scheme.to_string(),
        host: parts.host.to_string(),
        path: normalize_path(parts.uri.path()),
        query_params: query_params_from_uri(parts.uri),
        headers: headers_to_multimap(parts.headers),
        cookies: cookies_from_headers(parts.headers),
        form_params,
        body,
        created_at: Utc::now(),
    }
}

/// A freshly synthesized live request, ready to hand to an HTTP client.
pub struct MadeRequest {
    pub method: Method,
    pub uri: http::Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// MakeRequest(Request) -> live (spec §4.1).
///
/// Does not set `Host` explicitly — the transport derives it from the URI
/// authority. Does not synthesize `Content-Type`: callers relying on form
/// semantics must have persisted the original header.
pub fn make_request(request: &Request) -> anyhow::Result<MadeRequest> {
    let method = Method::from_bytes(request.method.as_bytes())?;

    let mut url = url::Url::parse(&format!("http://{}{}", request.host, normalize_path(&request.path)))?;
    {
        let mut pairs = url.query_pairs_mut();
        for (name, values) in &request.query_params {
            for value in values {
                pairs.append_pair(name, value);
            }
        }
    }
    let uri: http::Uri = url.as_str().parse()?;

    let mut headers = multimap_to_headers(&request.headers);
    // `request.headers` already carries any raw `Cookie` entry captured by
    // `parse_request`; drop it before re-synthesizing one entry per cookie,
    // otherwise both versions end up on the wire at once.
    headers.remove(http::header::COOKIE);
    for (name, value) in &request.cookies {
        if let Ok(value) = HeaderValue::from_str(&format!("{}={}", name, value)) {
            headers.append(http::header::COOKIE, value);
        }
    }

    let body = if !request.body.is_empty() {
        Bytes::from(request.body.clone())
    } else if !request.form_params.is_empty() {
        Bytes::from(serde_urlencoded::to_string(
            request
                .form_params
                .iter()
                .flat_map(|(k, vs)| vs.iter().map(move |v| (k.clone(), v.clone())))
                .collect::<Vec<_>>(),
        )?)
    } else {
        Bytes::new()
    };

    Ok(MadeRequest { method, uri, headers, body })
}

/// ParseResponse(live) -> Response (spec §4.1). `request_id` is filled in
/// by the caller once the parent request has been persisted.
pub fn parse_response(status: StatusCode, headers: &HeaderMap, body: Bytes, request_id: i64) -> Response {
    Response {
        id: None,
        request_id,
        status_code: status.as_u16(),
        headers: headers_to_multimap(headers),
        body: String::from_utf8_lossy(&body).into_owned(),
        created_at: Utc::now(),
    }
}
