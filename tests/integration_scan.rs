//! End-to-end test of the scan service's reflection detection.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request as HyperRequest, Response as HyperResponse};
use hyper_util::rt::TokioIo;
use indexmap::IndexMap;
use mitm_proxy::canonical::Request;
use mitm_proxy::error::StoreError;
use mitm_proxy::store::Store;
use std::convert::Infallible;
use std::sync::Mutex;
use tokio::net::TcpListener;

struct FakeStore(Mutex<Option<Request>>);

impl Store for FakeStore {
    async fn save_request(&self, _request: &Request) -> Result<i64, StoreError> {
        unimplemented!()
    }
    async fn save_response(&self, _response: &mitm_proxy::canonical::Response) -> Result<i64, StoreError> {
        unimplemented!()
    }
    async fn list_requests(&self) -> Result<Vec<Request>, StoreError> {
        unimplemented!()
    }
    async fn get_request(&self, _id: i64) -> Result<Request, StoreError> {
        self.0.lock().unwrap().clone().ok_or(StoreError::NotFound)
    }
}

/// Reflects the `search` query parameter verbatim into the response body,
/// like a naive search page vulnerable to reflected injection.
async fn reflecting_origin(req: HyperRequest<Incoming>) -> Result<HyperResponse<Full<Bytes>>, Infallible> {
    let query = req.uri().query().unwrap_or("").to_string();
    let reflected = url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "search")
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default();

    Ok(HyperResponse::builder()
        .status(200)
        .body(Full::new(Bytes::from(format!("<p>results for: {reflected}</p>"))))
        .unwrap())
}

async fn spawn_origin() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let _ = http1::Builder::new().serve_connection(io, service_fn(reflecting_origin)).await;
            });
        }
    });

    addr
}

#[tokio::test]
async fn scan_detects_the_reflected_parameter() {
    let addr = spawn_origin().await;

    let mut query_params: IndexMap<String, Vec<String>> = IndexMap::new();
    query_params.insert("search".to_string(), vec!["x".to_string()]);
    query_params.insert("page".to_string(), vec!["1".to_string()]);

    let request = Request {
        id: Some(1),
        method: "GET".to_string(),
        scheme: "http".to_string(),
        host: addr.to_string(),
        path: "/search".to_string(),
        query_params,
        headers: IndexMap::new(),
        cookies: IndexMap::new(),
        form_params: IndexMap::new(),
        body: String::new(),
        created_at: chrono::Utc::now(),
    };

    let store = FakeStore(Mutex::new(Some(request)));
    let reflected = mitm_proxy::scan::scan(&store, 1, None).await.unwrap();

    assert_eq!(reflected, "search");
}

#[tokio::test]
async fn scan_returns_empty_string_when_nothing_reflects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(|_req: HyperRequest<Incoming>| async {
                    Ok::<_, Infallible>(HyperResponse::builder().status(200).body(Full::new(Bytes::from_static(b"static page"))).unwrap())
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    let mut query_params: IndexMap<String, Vec<String>> = IndexMap::new();
    query_params.insert("q".to_string(), vec!["hello".to_string()]);

    let request = Request {
        id: Some(1),
        method: "GET".to_string(),
        scheme: "http".to_string(),
        host: addr.to_string(),
        path: "/".to_string(),
        query_params,
        headers: IndexMap::new(),
        cookies: IndexMap::new(),
        form_params: IndexMap::new(),
        body: String::new(),
        created_at: chrono::Utc::now(),
    };

    let store = FakeStore(Mutex::new(Some(request)));
    let reflected = mitm_proxy::scan::scan(&store, 1, None).await.unwrap();

    assert_eq!(reflected, "");
}
