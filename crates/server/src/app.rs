use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, HeaderName, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Limits, SiteSettings};
use crate::files::serve_file;
use crate::info::page_info;
use crate::probe::ProbeExecutor;
use crate::rate_limit::RateLimiter;
use crate::session::ws_handler;
use crate::synthetic::FillerBlock;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) executor: ProbeExecutor,
    pub(crate) limiter: RateLimiter,
    pub(crate) limits: Limits,
    pub(crate) filler: FillerBlock,
    pub(crate) site: Arc<SiteSettings>,
    pub(crate) trust_proxy_headers: bool,
    pub(crate) notify_rate_limited: bool,
    pub(crate) shutdown: CancellationToken,
}

impl AppState {
    pub(crate) fn from_config(config: &Config, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let limits = config.limits.resolve()?;
        Ok(Self {
            executor: ProbeExecutor::new(limits.line_buffer_bytes)
                .with_programs(config.probes.programs.clone()),
            limiter: RateLimiter::new(limits.rate_window, limits.rate_threshold),
            limits,
            filler: FillerBlock::random(),
            site: Arc::new(config.site.clone()),
            trust_proxy_headers: config.server.trust_proxy_headers,
            notify_rate_limited: config.session.notify_rate_limited,
            shutdown,
        })
    }
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/file/:file", get(serve_file))
        .route("/api/info", get(page_info))
        .with_state(state)
        .layer(middleware::from_fn(log_http_request))
}

async fn health() -> &'static str {
    "ok"
}

async fn log_http_request(req: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    let user_agent = header_text(req.headers(), header::USER_AGENT);
    let referer = header_text(req.headers(), header::REFERER);
    let response = next.run(req).await;
    tracing::info!(
        event = "http.request",
        method = %method,
        uri = %uri,
        peer = %peer,
        user_agent = %user_agent,
        referer = %referer,
        status = %response.status(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "http request"
    );
    response
}

fn header_text(headers: &HeaderMap, name: HeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    fn state() -> AppState {
        let config = Config::parse("[site]\ntitle = \"Test LG\"").expect("config");
        AppState::from_config(&config, CancellationToken::new()).expect("state")
    }

    fn request(uri: &str) -> Request<Body> {
        let mut req = Request::builder().uri(uri).body(Body::empty()).expect("request");
        let peer: SocketAddr = "198.51.100.4:40000".parse().expect("addr");
        req.extensions_mut().insert(ConnectInfo(peer));
        req
    }

    async fn body_bytes(response: Response) -> axum::body::Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body")
    }

    #[test]
    fn logged_requests_can_run_on_spawned_tasks() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let mut req = request("/health");
            req.headers_mut()
                .insert(header::USER_AGENT, "curl/8.0".parse().expect("header"));
            let response = tokio::spawn(build_router(state()).oneshot(req))
                .await
                .expect("join")
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
        });
    }

    #[test]
    fn missing_headers_log_as_dash() {
        let mut headers = HeaderMap::new();
        headers.insert(header::REFERER, "https://lg.example.com/".parse().expect("header"));
        assert_eq!(header_text(&headers, header::REFERER), "https://lg.example.com/");
        assert_eq!(header_text(&headers, header::USER_AGENT), "-");
    }

    #[test]
    fn health_reports_ok() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let response = build_router(state())
                .oneshot(request("/health"))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(&body_bytes(response).await[..], b"ok");
        });
    }

    #[test]
    fn serves_requested_range_of_test_file() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let mut req = request("/file/10MB.test");
            req.headers_mut()
                .insert(header::RANGE, "bytes=0-999".parse().expect("header"));
            let response = build_router(state()).oneshot(req).await.expect("response");
            assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
            assert_eq!(
                response.headers()[header::CONTENT_RANGE],
                "bytes 0-999/10000000"
            );
            assert_eq!(body_bytes(response).await.len(), 1000);
        });
    }

    #[test]
    fn unknown_test_file_is_404() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            for uri in ["/file/3MB.test", "/file/10MB.bin", "/file/10MB"] {
                let response = build_router(state())
                    .oneshot(request(uri))
                    .await
                    .expect("response");
                assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
            }
        });
    }

    #[test]
    fn info_lists_site_and_files() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let response = build_router(state())
                .oneshot(request("/api/info"))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
            let info: serde_json::Value =
                serde_json::from_slice(&body_bytes(response).await).expect("json");
            assert_eq!(info["title"], "Test LG");
            assert_eq!(info["client_ip"], "198.51.100.4");
            assert_eq!(info["test_files"].as_array().map(Vec::len), Some(6));
            assert_eq!(info["test_files"][0]["path"], "/file/10MB.test");
            assert_eq!(info["test_files"][0]["bytes"], 10_000_000);
        });
    }

    #[test]
    fn websocket_route_requires_upgrade() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let response = build_router(state())
                .oneshot(request("/ws"))
                .await
                .expect("response");
            assert!(response.status().is_client_error());
        });
    }
}
