//! HTTP query surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/wind` | Greeting |
//! | `GET`  | `/wind/alive` | Liveness check |
//! | `GET`  | `/wind/latest` | Newest cached snapshot |
//! | `GET`  | `/wind/nearest?timeIso=…&searchLimit=…` | Snapshot closest to `timeIso` |
//! | `GET`  | `/wind/stamps` | Cached snapshot keys, oldest first |
//!
//! Snapshot bodies are served verbatim with an `x-snapshot-key` header.
//! Errors use `{ "error": { "code": "...", "message": "..." } }`.

use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

use common::{Error, SnapshotKey};
use harvest::{Resolved, Resolver, SnapshotStore};

const SNAPSHOT_KEY_HEADER: HeaderName = HeaderName::from_static("x-snapshot-key");

/// Shared state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<Resolver>,
    pub store: Arc<dyn SnapshotStore>,
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/wind", get(handle_root))
        .route("/wind/alive", get(handle_alive))
        .route("/wind/latest", get(handle_latest))
        .route("/wind/nearest", get(handle_nearest))
        .route("/wind/stamps", get(handle_stamps))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// `*` anywhere in the list allows every origin.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(allowed))
}

/// Bind `bind` and serve until the task is dropped.
pub async fn serve(bind: &str, app: Router) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Wind server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Handlers ============

async fn handle_root() -> &'static str {
    "Wind data server. Try /wind/latest for the most recent snapshot."
}

async fn handle_alive() -> &'static str {
    "wind-harvest is alive"
}

async fn handle_latest(State(state): State<AppState>) -> Result<Response, AppError> {
    let resolved = state.resolver.latest(Utc::now()).await?;
    Ok(snapshot_response(resolved))
}

#[derive(Debug, Deserialize)]
struct NearestParams {
    #[serde(rename = "timeIso")]
    time_iso: Option<String>,
    #[serde(rename = "searchLimit")]
    search_limit: Option<String>,
}

async fn handle_nearest(
    State(state): State<AppState>,
    params: Result<Query<NearestParams>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(params) = params.map_err(|rejection| bad_request(rejection.body_text()))?;
    let resolved = state
        .resolver
        .nearest_query(params.time_iso.as_deref(), params.search_limit.as_deref())
        .await?;
    Ok(snapshot_response(resolved))
}

async fn handle_stamps(State(state): State<AppState>) -> Result<Json<Vec<SnapshotKey>>, AppError> {
    Ok(Json(state.store.list().await?))
}

fn snapshot_response(resolved: Resolved) -> Response {
    let mut response = (
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        resolved.payload,
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(resolved.key.as_str()) {
        response.headers_mut().insert(SNAPSHOT_KEY_HEADER, value);
    }
    response
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidInput(msg) => bad_request(msg),
            e @ (Error::SearchExhausted { .. } | Error::NotFoundYet | Error::NotFound(_)) => {
                not_found(e.to_string())
            }
            other => {
                error!("Request failed: {}", other);
                internal("internal error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use common::TimeGrid;
    use harvest::{MemorySnapshotStore, ResolverSettings};
    use tower::ServiceExt;

    const ORIGIN: &str = "http://allowed.test";

    async fn app_with(keys: &[SnapshotKey]) -> Router {
        let store = Arc::new(MemorySnapshotStore::new());
        for key in keys {
            let payload = format!("{{\"key\":\"{}\"}}", key);
            store.write(key, payload.as_bytes()).await.unwrap();
        }
        let store: Arc<dyn SnapshotStore> = store;
        let resolver = Resolver::new(
            TimeGrid::default(),
            ResolverSettings::default(),
            store.clone(),
        );
        router(
            AppState {
                resolver: Arc::new(resolver),
                store,
            },
            &[ORIGIN.to_string()],
        )
    }

    fn key(raw: &str) -> SnapshotKey {
        SnapshotKey::parse(raw).unwrap()
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body.to_vec())
    }

    fn error_code(body: &[u8]) -> String {
        let value: serde_json::Value = serde_json::from_slice(body).unwrap();
        value["error"]["code"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_plain_text_routes() {
        let (status, _, body) = get(app_with(&[]).await, "/wind/alive").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"wind-harvest is alive");

        let (status, _, body) = get(app_with(&[]).await, "/wind").await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("/wind/latest"));
    }

    #[tokio::test]
    async fn test_nearest_serves_snapshot_verbatim() {
        let app = app_with(&[key("2024010100"), key("2024010112")]).await;

        let (status, headers, body) =
            get(app.clone(), "/wind/nearest?timeIso=2024-01-01T03:00Z&searchLimit=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(headers[SNAPSHOT_KEY_HEADER], "2024010100");
        assert_eq!(body, br#"{"key":"2024010100"}"#);

        let (_, headers, _) = get(app, "/wind/nearest?timeIso=2024-01-01T15:00:00Z").await;
        assert_eq!(headers[SNAPSHOT_KEY_HEADER], "2024010112");
    }

    #[tokio::test]
    async fn test_nearest_error_statuses() {
        let app = app_with(&[key("2024010100")]).await;

        let (status, _, body) = get(app.clone(), "/wind/nearest").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&body), "bad_request");

        let (status, _, _) = get(app.clone(), "/wind/nearest?timeIso=yesterday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, headers, body) = get(
            app.clone(),
            "/wind/nearest?timeIso=2024-01-01T03:00Z&timeIso=2024-01-02T03:00Z",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(error_code(&body), "bad_request");

        let (status, _, body) =
            get(app, "/wind/nearest?timeIso=2023-01-01T00:00Z&searchLimit=1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error_code(&body), "not_found");
    }

    #[tokio::test]
    async fn test_latest() {
        let (status, _, body) = get(app_with(&[]).await, "/wind/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error_code(&body), "not_found");

        let current = TimeGrid::default().key(Utc::now());
        let (status, headers, _) = get(app_with(&[current.clone()]).await, "/wind/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[SNAPSHOT_KEY_HEADER], current.as_str());
    }

    #[tokio::test]
    async fn test_stamps_lists_keys_in_order() {
        let app = app_with(&[key("2024010112"), key("2024010100")]).await;
        let (status, _, body) = get(app, "/wind/stamps").await;
        assert_eq!(status, StatusCode::OK);
        let stamps: Vec<String> = serde_json::from_slice(&body).unwrap();
        assert_eq!(stamps, vec!["2024010100", "2024010112"]);
    }

    #[tokio::test]
    async fn test_cors_whitelist() {
        let request = |origin: &str| {
            Request::builder()
                .uri("/wind/alive")
                .header(header::ORIGIN, origin)
                .body(Body::empty())
                .unwrap()
        };

        let response = app_with(&[]).await.oneshot(request(ORIGIN)).await.unwrap();
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], ORIGIN);

        let response = app_with(&[])
            .await
            .oneshot(request("http://elsewhere.test"))
            .await
            .unwrap();
        assert!(!response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }
}
