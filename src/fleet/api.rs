use std::sync::Arc;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, Uri};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use super::{FleetProxy, Forward};

pub fn router(proxy: Arc<FleetProxy>) -> Router {
    Router::new()
        .route("/v1/pods",              get(all))
        .route("/v1/trace-hooks",       get(any))
        .route("/v1/trace-session",     post(all))
        .route("/v1/trace-session/:id", get(all).put(all).delete(all))
        .with_state(proxy)
}

async fn all(State(proxy): State<Arc<FleetProxy>>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    forward(&proxy, method, uri, headers, body, false).await
}

async fn any(State(proxy): State<Arc<FleetProxy>>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    forward(&proxy, method, uri, headers, body, true).await
}

async fn forward(
    proxy:   &FleetProxy,
    method:  Method,
    uri:     Uri,
    headers: HeaderMap,
    body:    Bytes,
    any:     bool,
) -> Response {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or(uri.path()).to_owned();
    let req  = Forward { method, path, headers, body };

    let reply = proxy.proxy(req, any).await;
    let json  = HeaderValue::from_static("application/json");

    (reply.status, [(CONTENT_TYPE, json)], reply.body).into_response()
}
