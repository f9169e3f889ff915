//! The scrape endpoint. Serves the metrics text last published by the
//! maintenance loop, returning `500` when nothing has been published inside
//! `metrics_timeout` — a caller asking a collector that's stopped collecting
//! should see a failed scrape, not stale-looking success.

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

pub struct MetricsCache {
    body: RwLock<Option<String>>,
    last_publish: RwLock<Option<Instant>>,
}

impl MetricsCache {
    pub fn new() -> Self {
        MetricsCache { body: RwLock::new(None), last_publish: RwLock::new(None) }
    }

    pub fn publish(&self, body: String) {
        *self.body.write().expect("metrics cache lock poisoned") = Some(body);
        *self.last_publish.write().expect("metrics cache lock poisoned") = Some(Instant::now());
    }

    fn get_if_fresh(&self, timeout: Duration) -> Option<String> {
        let last = *self.last_publish.read().expect("metrics cache lock poisoned");
        let fresh = last.is_some_and(|t| t.elapsed() <= timeout);
        if fresh {
            self.body.read().expect("metrics cache lock poisoned").clone()
        } else {
            None
        }
    }
}

impl Default for MetricsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct AppState {
    cache: Arc<MetricsCache>,
    metrics_timeout: Duration,
}

pub fn router(cache: Arc<MetricsCache>, metrics_timeout_secs: u64) -> Router {
    let state = AppState { cache, metrics_timeout: Duration::from_secs(metrics_timeout_secs) };
    Router::new()
        .route("/metrics", get(scrape_handler))
        .route("/metrics/*rest", get(scrape_handler))
        .layer(middleware::from_fn(access_log))
        .with_state(state)
}

async fn scrape_handler(State(state): State<AppState>) -> Response {
    match state.cache.get_if_fresh(state.metrics_timeout) {
        Some(body) => {
            let mut response = body.into_response();
            response.headers_mut().insert(
                axum::http::header::CONTENT_TYPE,
                HeaderValue::from_static(crate::metrics::CONTENT_TYPE),
            );
            response.headers_mut().insert(
                axum::http::header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache"),
            );
            response
        }
        None => (StatusCode::INTERNAL_SERVER_ERROR, "metrics publisher has not updated recently").into_response(),
    }
}

/// Mirrors the reference access-log token order: remote addr, a `saline_user`
/// placeholder (always `-`, nothing in this system authenticates per-request),
/// method, uri, status, content-length-or-`-`, user-agent-or-`-`, and request
/// time in milliseconds.
async fn access_log(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.to_string())
        .unwrap_or_else(|| "-".to_string());
    let method = req.method().clone();
    let uri = req.uri().clone();
    let user_agent = req
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let content_length = response
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    log::info!(
        "{remote} - {method} {uri} {status} {content_length} \"{user_agent}\" {elapsed_ms:.2}ms",
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use tower::ServiceExt;

    #[tokio::test]
    async fn returns_500_when_never_published() {
        let cache = Arc::new(MetricsCache::new());
        let app = router(cache, 120);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn returns_200_with_fresh_metrics() {
        let cache = Arc::new(MetricsCache::new());
        cache.publish("collector_jobs_total 0\n".to_string());
        let app = router(cache, 120);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(axum::http::header::CONTENT_TYPE).unwrap(),
            crate::metrics::CONTENT_TYPE
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(std::str::from_utf8(&body).unwrap().contains("collector_jobs_total 0"));
    }

    #[tokio::test]
    async fn wildcard_metrics_path_serves_same_body() {
        let cache = Arc::new(MetricsCache::new());
        cache.publish("collector_jobs_total 0\n".to_string());
        let app = router(cache, 120);
        let response = app
            .oneshot(Request::builder().uri("/metrics/foo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn returns_500_when_stale() {
        let cache = Arc::new(MetricsCache::new());
        cache.publish("collector_jobs_total 0\n".to_string());
        let app = router(cache, 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
