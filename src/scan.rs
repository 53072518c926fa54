//! Reflected-parameter scan service (spec §4.5, §9 scan signature mismatch,
//! SPEC_FULL §12).
//!
//! The handler/usecase pair in
//! `examples/original_source/internal/api/handler/http/handler.go` and
//! `internal/api/usecase/requests/usecase_request.go` ground the *contract*
//! this implements: `ScanRequest(id, param)` loads a stored request and
//! reports a reflected parameter name. `usecase_request.go`'s `ScanRequest`
//! is itself an unimplemented stub (`// TODO: Scan request`, returns `"",
//! nil`); the actual probe-token-and-substring-reflection behavior below is
//! grounded in spec.md §4.5's prose, not in any original-source logic.
//! SPEC_FULL §12 unifies the two call shapes the Go interface exposes
//! (`Scan(id)` over every param, `Scan(id, param)` over one) into a single
//! `scan(store, id, Option<param>)`.

use crate::canonical::make_request;
use crate::error::StoreError;
use crate::store::Store;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rand::Rng;

/// Probe tokens are URL-safe base64 strings, truncated to a uniformly
/// random length in `[1, 20]` characters (spec §4.5 step 1). 16 random
/// bytes encode to 22 URL-safe base64 characters, comfortably more than
/// the 20-character ceiling, so truncating never runs out of encoded
/// output.
fn probe_token() -> String {
    let target_len = rand::thread_rng().gen_range(1..=20);
    let bytes: [u8; 16] = rand::thread_rng().gen();
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    encoded.chars().take(target_len).collect()
}

/// Scan(id, param) -> reflected parameter name, or "" if none reflected
/// (spec §4.5). When `param` is `None`, every existing query parameter on
/// the stored request is probed in turn and the first reflection wins.
pub async fn scan(store: &impl Store, id: i64, param: Option<&str>) -> anyhow::Result<String> {
    let request = store.get_request(id).await.map_err(|e| match e {
        StoreError::NotFound => anyhow::anyhow!("request {id} not found"),
        StoreError::Backend(e) => anyhow::anyhow!("store error: {e}"),
    })?;

    let candidates: Vec<String> = match param {
        Some(p) => vec![p.to_string()],
        None => request.query_params.keys().cloned().collect(),
    };

    if candidates.is_empty() {
        return Ok(String::new());
    }

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()?
        .https_or_http()
        .enable_http1()
        .build();
    let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build(https);

    for candidate in candidates {
        let token = probe_token();
        let mut probed = request.clone();
        probed
            .query_params
            .entry(candidate.clone())
            .or_default()
            .push(token.clone());

        let made = match make_request(&probed) {
            Ok(made) => made,
            Err(_) => continue,
        };

        let mut builder = hyper::Request::builder().method(made.method).uri(made.uri);
        for (name, value) in made.headers.iter() {
            builder = builder.header(name, value);
        }
        let Ok(req) = builder.body(Full::new(made.body)) else {
            continue;
        };

        let Ok(resp) = client.request(req).await else {
            continue;
        };
        let Ok(body) = resp.into_body().collect().await else {
            continue;
        };
        let body = body.to_bytes();

        if body.windows(token.len()).any(|window| window == token.as_bytes()) {
            return Ok(candidate);
        }
    }

    Ok(String::new())
}
