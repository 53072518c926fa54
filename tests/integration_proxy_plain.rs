//! End-to-end test of the plain forwarding path: a real client sends a
//! proxied request through `ProxyEngine`, a real origin answers it, and the
//! response plus the captured request/response pair are checked.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request as HyperRequest, Response as HyperResponse};
use hyper_util::rt::TokioIo;
use indexmap::IndexMap;
use mitm_proxy::canonical::{Request, Response};
use mitm_proxy::error::StoreError;
use mitm_proxy::store::Store;
use mitm_proxy::ProxyEngine;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Default)]
struct CapturingStore {
    requests: Mutex<Vec<Request>>,
    responses: Mutex<Vec<Response>>,
}

impl Store for CapturingStore {
    async fn save_request(&self, request: &Request) -> Result<i64, StoreError> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        Ok(requests.len() as i64)
    }
    async fn save_response(&self, response: &Response) -> Result<i64, StoreError> {
        let mut responses = self.responses.lock().unwrap();
        responses.push(response.clone());
        Ok(responses.len() as i64)
    }
    async fn list_requests(&self) -> Result<Vec<Request>, StoreError> {
        unimplemented!()
    }
    async fn get_request(&self, _id: i64) -> Result<Request, StoreError> {
        unimplemented!()
    }
}

async fn origin(req: HyperRequest<Incoming>) -> Result<HyperResponse<Full<Bytes>>, Infallible> {
    assert!(req.headers().get("proxy-connection").is_none(), "Proxy-Connection must be stripped before forwarding");
    Ok(HyperResponse::builder()
        .status(201)
        .header("x-origin", "yes")
        .body(Full::new(Bytes::from_static(b"origin body")))
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
                let _ = http1::Builder::new().serve_connection(io, service_fn(origin)).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn plain_forward_streams_the_response_and_captures_request_and_response() {
    let origin_addr = spawn_origin().await;

    let store = Arc::new(CapturingStore::default());
    let ca_dir = tempfile::tempdir().unwrap();
    let (cert_path, key_path) = write_throwaway_ca(&ca_dir);
    let ca = Arc::new(mitm_proxy::CertificateAuthority::load(&cert_path, &key_path).unwrap());
    let engine = Arc::new(ProxyEngine::new(store.clone(), ca).unwrap());

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    drop(proxy_listener);

    let engine_for_run = engine.clone();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let shutdown = async {
            let _ = shutdown_rx.await;
        };
        engine_for_run.run(proxy_addr, shutdown).await.unwrap();
    });

    // give the listener a moment to bind
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Connect directly to the proxy's listener and send an absolute-form
    // request target naming the origin, the way a configured HTTP_PROXY
    // client would -- this is what actually exercises forwarding/capture,
    // as opposed to connecting straight to the origin.
    let proxy_stream = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(proxy_stream)).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let req = HyperRequest::builder()
        .method("GET")
        .uri(format!("http://{origin_addr}/hello"))
        .header("host", origin_addr.to_string())
        .header("proxy-connection", "keep-alive")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();

    assert_eq!(resp.status(), 201);
    assert_eq!(resp.headers().get("x-origin").unwrap(), "yes");
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"origin body");

    let _ = shutdown_tx.send(());

    // capture happens asynchronously after the response is delivered
    tokio::time::sleep(Duration::from_millis(100)).await;
    let captured_requests = store.requests.lock().unwrap();
    let captured_responses = store.responses.lock().unwrap();
    assert_eq!(captured_requests.len(), 1);
    assert_eq!(captured_responses.len(), 1);
    assert_eq!(captured_responses[0].status_code, 201);
}

fn write_throwaway_ca(dir: &tempfile::TempDir) -> (String, String) {
    use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose};
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Test Root CA");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let keypair = KeyPair::generate().unwrap();
    let cert = params.self_signed(&keypair).unwrap();

    let cert_path = dir.path().join("ca.pem");
    let key_path = dir.path().join("ca.key");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, keypair.serialize_pem()).unwrap();

    (cert_path.to_string_lossy().into_owned(), key_path.to_string_lossy().into_owned())
}
