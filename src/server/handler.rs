// Request handler module
// The serving engine calls a single handler; routing lives outside this crate

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE, SERVER};
use hyper::{Request, Response, StatusCode};

use super::generation::Generation;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Response<Full<Bytes>>> + Send>>;

/// Request handler shared by every connection of a generation
pub type Handler = Arc<dyn Fn(Request<Incoming>) -> HandlerFuture + Send + Sync>;

const SERVER_NAME: &str = concat!("handoff-server/", env!("CARGO_PKG_VERSION"));

/// Wrap an async closure as a [`Handler`].
pub fn from_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    Arc::new(move |req: Request<Incoming>| -> HandlerFuture { Box::pin(f(req)) })
}

/// Plain-text 200 response.
pub fn text(body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(value.to_string())));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    response
}

/// Default handler: reports which generation served the request.
pub fn generation_status(generation: Generation) -> Handler {
    let generation = Arc::new(generation);
    from_fn(move |req: Request<Incoming>| {
        let generation = Arc::clone(&generation);
        async move {
            let body = serde_json::json!({
                "pid": generation.pid,
                "inherited": generation.inherited,
                "started_at": generation.started_at.to_rfc3339(),
                "method": req.method().as_str(),
                "path": req.uri().path(),
            });
            json(StatusCode::OK, &body)
        }
    })
}
