/// HTTP audio gateway.
///
/// Serves `GET /audio/{filename}` on a local port (default 8991).  When mpv
/// wants track N it is directed to `http://127.0.0.1:8991/audio/day-N.webm`.
/// The handler opens **one** upstream connection per request and streams the
/// bytes straight through, forwarding the Range request header upstream and
/// the 206 response headers (Content-Range, Content-Length, Accept-Ranges)
/// back, so mpv can seek mid-file without us buffering anything.
///
/// With `audio.local_dir` configured the gateway serves files from disk
/// instead; `ServeDir` handles Range requests natively.
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use reqwest::Client;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use loopcast_core::catalog::TrackCatalog;
use loopcast_core::config::HttpConfig;

// ── Shared state ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct GatewayState {
    pub catalog: TrackCatalog,
    pub upstream_base: String,
    pub client: Client,
}

impl GatewayState {
    pub fn new(catalog: TrackCatalog, upstream_base: String) -> Self {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .expect("failed to build reqwest client for gateway");

        Self {
            catalog,
            upstream_base,
            client,
        }
    }
}

// ── Route handlers ────────────────────────────────────────────────────────────

async fn stream_audio(
    Path(filename): Path<String>,
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    // Only filenames the catalog knows; rejects traversal at the same time.
    if filename.contains('/') || filename.contains("..") {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Body::empty())
            .unwrap();
    }
    if !state
        .catalog
        .tracks()
        .iter()
        .any(|t| t.filename == filename)
    {
        warn!("gateway: unknown file requested: {}", filename);
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap();
    }

    let url = format!(
        "{}/{}",
        state.upstream_base.trim_end_matches('/'),
        filename
    );

    // Forward the Range header so seeks hit the upstream directly
    let mut req = state.client.get(&url);
    if let Some(range) = headers.get(header::RANGE) {
        req = req.header(header::RANGE, range.clone());
    }

    let upstream = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            warn!("gateway: upstream connect failed for {}: {}", filename, e);
            return Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(Body::empty())
                .unwrap();
        }
    };

    let upstream_status = upstream.status();
    if !upstream_status.is_success() {
        warn!(
            "gateway: upstream returned {} for {}",
            upstream_status, filename
        );
        return Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .body(Body::empty())
            .unwrap();
    }

    // 206 must survive the hop or mpv falls back to full-file reads
    let mut builder = Response::builder().status(upstream_status.as_u16());
    let mut saw_content_type = false;
    for (name, value) in upstream.headers() {
        let name_str = name.as_str();
        if name_str == "content-type"
            || name_str == "content-length"
            || name_str == "content-range"
            || name_str == "accept-ranges"
        {
            if name_str == "content-type" {
                saw_content_type = true;
            }
            if let Ok(hv) = axum::http::HeaderValue::from_bytes(value.as_bytes()) {
                builder = builder.header(name_str, hv);
            }
        }
    }
    if !saw_content_type {
        builder = builder.header(header::CONTENT_TYPE, "audio/webm");
    }
    builder = builder
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "public, max-age=3600");

    let byte_stream = upstream.bytes_stream();
    let reader = tokio_util::io::StreamReader::new(
        byte_stream
            .map(|result| result.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
    );
    let body = Body::from_stream(ReaderStream::new(reader));

    builder.body(body).unwrap()
}

async fn list_tracks(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.catalog.tracks().to_vec())
}

async fn health() -> &'static str {
    "ok"
}

// ── Server startup ────────────────────────────────────────────────────────────

pub fn router(
    catalog: TrackCatalog,
    upstream_base: String,
    local_dir: Option<std::path::PathBuf>,
) -> Router {
    let gateway_state = GatewayState::new(catalog, upstream_base);

    let mut app = Router::new()
        .route("/api/tracks", get(list_tracks))
        .route("/health", get(health));

    app = match local_dir {
        // local files: ServeDir already answers Range requests
        Some(dir) => app.nest_service("/audio", ServeDir::new(dir)),
        None => app.route("/audio/:filename", get(stream_audio)),
    };

    app.layer(CorsLayer::permissive()).with_state(gateway_state)
}

pub fn start_server(
    http: HttpConfig,
    catalog: TrackCatalog,
    upstream_base: String,
    local_dir: Option<std::path::PathBuf>,
) -> tokio::task::JoinHandle<()> {
    let app = router(catalog, upstream_base, local_dir);

    tokio::spawn(async move {
        let addr = format!("{}:{}", http.bind_address, http.port);
        info!("Audio gateway listening on http://{}", addr);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to bind audio gateway on {}: {}", addr, e);
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Audio gateway error: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> Router {
        router(
            TrackCatalog::builtin(3),
            "http://127.0.0.1:1/upstream".to_string(),
            None,
        )
    }

    async fn get_status(uri: &str) -> StatusCode {
        let response = test_router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn test_traversal_request_rejected() {
        // a lone ".." survives routing as a single segment; the guard owns it
        assert_eq!(get_status("/audio/..").await, StatusCode::BAD_REQUEST);
        assert_eq!(get_status("/audio/%2e%2e").await, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_file_is_404_before_upstream() {
        // 404, not 502: the catalog check runs before any upstream connect
        assert_eq!(
            get_status("/audio/not-in-catalog.webm").await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_health_and_tracks_endpoints() {
        assert_eq!(get_status("/health").await, StatusCode::OK);
        assert_eq!(get_status("/api/tracks").await, StatusCode::OK);
    }
}
