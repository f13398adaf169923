#![allow(dead_code)]

use http::{Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::util::BoxCloneService;

pub type TestService = BoxCloneService<Request<()>, Response<String>, Infallible>;

/// Inner service that answers `200 ok` and counts the calls it sees.
pub fn counting_service() -> (TestService, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let svc = BoxCloneService::new(tower::service_fn(move |_req: Request<()>| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(Response::new(String::from("ok")))
        }
    }));
    (svc, hits)
}

pub fn request_from(path: &str, peer: [u8; 4]) -> Request<()> {
    let mut req = Request::builder().method("POST").uri(path).body(()).unwrap();
    req.extensions_mut().insert(SocketAddr::from((peer, 51000)));
    req
}

pub fn request_with_token(path: &str, token: &str) -> Request<()> {
    Request::builder().uri(path).header("authorization", token).body(()).unwrap()
}
