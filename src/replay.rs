//! Replay service (spec §4.5).
//!
//! Grounded in `RepeatRequest` (`examples/original_source/internal/api/handler/http/handler.go`)
//! and `Usecase.RepeatRequest`/`pkg/http/requests.go`'s `MakeRequest`: load
//! the stored request, reconstruct a live one, send it, dump the raw wire
//! response back to the caller as text.

use crate::canonical::make_request;
use crate::error::StoreError;
use crate::store::Store;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

/// Replay(id) -> raw wire-format response dump, UTF-8 (spec §4.5).
///
/// Redirects are not followed: the client used here has no redirect
/// policy, so it simply returns whatever the origin sends first.
pub async fn replay(store: &impl Store, id: i64) -> anyhow::Result<String> {
    let request = store.get_request(id).await.map_err(|e| match e {
        StoreError::NotFound => anyhow::anyhow!("request {id} not found"),
        StoreError::Backend(e) => anyhow::anyhow!("store error: {e}"),
    })?;

    let made = make_request(&request)?;

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()?
        .https_or_http()
        .enable_http1()
        .build();
    let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build(https);

    let mut builder = hyper::Request::builder().method(made.method).uri(made.uri);
    for (name, value) in made.headers.iter() {
        builder = builder.header(name, value);
    }
    let req = builder.body(Full::new(made.body))?;

    let resp = client.request(req).await?;
    let status = resp.status();
    let version = resp.version();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await?.to_bytes();

    let mut dump = format!("{version:?} {status}\r\n");
    for (name, value) in headers.iter() {
        dump.push_str(&format!("{}: {}\r\n", name, value.to_str().unwrap_or_default()));
    }
    dump.push_str("\r\n");
    dump.push_str(&String::from_utf8_lossy(&body));

    Ok(dump)
}
