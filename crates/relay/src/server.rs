use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::time::Instant;
use tracing::{error, info};

use crate::{
    api,
    auth::IdentityVerifier,
    error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope},
    metrics,
    rooms::RoomHub,
    ws::{self, WsState},
};

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

pub fn build_router(
    hub: RoomHub,
    verifier: Arc<dyn IdentityVerifier>,
    admission_timeout: Duration,
) -> Router {
    let ws_state = WsState { hub: hub.clone(), verifier: Arc::clone(&verifier), admission_timeout };
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_text))
            .merge(ws::router(ws_state))
            .merge(api::router(hub, verifier)),
    )
}

pub fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_text() -> Response {
    let body = metrics::global_metrics().map(|metrics| metrics.render_prometheus()).unwrap_or_default();
    ([("content-type", "text/plain; version=0.0.4")], body).into_response()
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
