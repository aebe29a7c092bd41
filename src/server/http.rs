//! HTTP surface: pairing, credential management, session index, health.
//!
//! Only the pairing endpoints and the health check are reachable without a
//! credential; everything else demands a valid bearer key.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::AuthService;
use crate::broker::BrokerHandle;
use crate::config::RelayConfig;
use crate::registry::{RegistryHandle, SessionDescriptor, SessionStatus};

use super::connection::ws_handler;
use super::error::ApiError;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Auth service for pairing and validation.
    pub auth: Arc<AuthService>,
    /// Registry handle for the session index.
    pub registry: RegistryHandle,
    /// Broker handle for viewer channels.
    pub broker: BrokerHandle,
    /// Shared configuration.
    pub config: Arc<RelayConfig>,
    /// Server start time, for health reporting.
    pub started_at: DateTime<Utc>,
    /// Relay-wide shutdown token; open channels close when it fires.
    pub cancel: CancellationToken,
}

/// Build the axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/qr", post(post_qr))
        .route("/api/auth/mobile", post(post_mobile))
        .route("/api/auth/refresh", post(post_refresh))
        .route("/api/auth/revoke", post(post_revoke))
        .route("/api/auth/info", get(get_info))
        .route("/api/sessions", get(get_sessions))
        .route("/health", get(get_health))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Extract a bearer key from the Authorization header.
pub(super) fn bearer_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

/// Response for POST /api/auth/qr.
#[derive(Debug, Serialize, Deserialize)]
pub struct QrResponse {
    /// The enrollment token.
    pub token: String,
    /// Seconds until the token expires.
    pub expires_in_s: u64,
    /// URL the QR code encodes; opaque apart from the `token` parameter.
    pub enroll_url: String,
}

/// POST /api/auth/qr - issue an enrollment token for QR pairing.
async fn post_qr(State(state): State<AppState>) -> Json<QrResponse> {
    let enrollment = state.auth.issue_enrollment();
    let enroll_url = format!(
        "{}/pair?token={}",
        state.config.public_url, enrollment.token
    );
    Json(QrResponse {
        token: enrollment.token,
        expires_in_s: state.config.enrollment_ttl.as_secs(),
        enroll_url,
    })
}

#[derive(Debug, Deserialize)]
struct RedeemRequest {
    token: String,
    device_id: String,
}

/// Server description returned on pairing.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
    /// Server wall clock.
    pub server_time: DateTime<Utc>,
}

/// Response for POST /api/auth/mobile.
#[derive(Debug, Serialize, Deserialize)]
pub struct RedeemResponse {
    /// The minted device credential key.
    pub key: String,
    /// Who the device just paired with.
    pub server_info: ServerInfo,
}

/// POST /api/auth/mobile - redeem an enrollment token for a credential.
///
/// The body is parsed by hand so a malformed payload is a clean 400; all
/// redemption goes through the auth service's atomic path.
async fn post_mobile(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<RedeemResponse>, ApiError> {
    let request: RedeemRequest =
        serde_json::from_str(&body).map_err(|e| ApiError::BadRequest {
            message: e.to_string(),
        })?;
    if request.token.is_empty() || request.device_id.is_empty() {
        return Err(ApiError::BadRequest {
            message: "token and device_id are required".to_string(),
        });
    }

    let credential = state
        .auth
        .redeem_enrollment(&request.token, &request.device_id)
        .map_err(ApiError::from_redeem)?;

    Ok(Json(RedeemResponse {
        key: credential.key,
        server_info: ServerInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            server_time: Utc::now(),
        },
    }))
}

/// Response for POST /api/auth/refresh.
#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    /// The credential key (unchanged).
    pub key: String,
    /// The extended expiry.
    pub expires_at: DateTime<Utc>,
}

/// POST /api/auth/refresh - extend a valid credential by one TTL.
async fn post_refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RefreshResponse>, ApiError> {
    let key = bearer_key(&headers).ok_or(ApiError::Unauthorized { code: "unknown" })?;
    let credential = state.auth.refresh(&key).map_err(ApiError::from_validate)?;
    Ok(Json(RefreshResponse {
        key: credential.key,
        expires_at: credential.expires_at,
    }))
}

/// POST /api/auth/revoke - revoke the presented credential.
async fn post_revoke(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = bearer_key(&headers).ok_or(ApiError::Unauthorized { code: "unknown" })?;
    state.auth.revoke(&key).map_err(|_| ApiError::NotFound)?;
    Ok(Json(serde_json::json!({})))
}

/// Credential introspection, without the key itself.
#[derive(Debug, Serialize, Deserialize)]
pub struct CredentialInfo {
    /// Device the credential is bound to.
    pub device_id: String,
    /// When it was minted.
    pub issued_at: DateTime<Utc>,
    /// When it expires.
    pub expires_at: DateTime<Utc>,
    /// Last successful validation.
    pub last_used_at: Option<DateTime<Utc>>,
}

/// GET /api/auth/info - introspect the presented credential.
async fn get_info(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CredentialInfo>, ApiError> {
    let key = bearer_key(&headers).ok_or(ApiError::Unauthorized { code: "unknown" })?;
    let credential = state.auth.validate(&key).map_err(ApiError::from_validate)?;
    Ok(Json(CredentialInfo {
        device_id: credential.device_id,
        issued_at: credential.issued_at,
        expires_at: credential.expires_at,
        last_used_at: credential.last_used_at,
    }))
}

/// Response for GET /api/sessions.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionsResponse {
    /// Known sessions, most recently active first.
    pub sessions: Vec<SessionDescriptor>,
    /// Total number of known sessions.
    pub total: usize,
    /// How many are actively streaming records.
    pub active: usize,
}

/// GET /api/sessions - the session index.
async fn get_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionsResponse>, ApiError> {
    let key = bearer_key(&headers).ok_or(ApiError::Unauthorized { code: "unknown" })?;
    state.auth.validate(&key).map_err(ApiError::from_validate)?;

    let sessions = state.registry.list().await;
    let total = sessions.len();
    let active = sessions
        .iter()
        .filter(|s| s.status == SessionStatus::Active)
        .count();
    Ok(Json(SessionsResponse {
        sessions,
        total,
        active,
    }))
}

/// Response for GET /health.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` or `unhealthy`.
    pub status: String,
    /// Seconds since startup.
    pub uptime_s: i64,
    /// The watched root.
    pub watch_root: String,
    /// Whether the watch root currently exists.
    pub watch_root_present: bool,
    /// Number of known sessions.
    pub sessions: usize,
}

/// GET /health - liveness. Reports unhealthy (503) when the watch root has
/// vanished; existing subscribers keep streaming regardless.
async fn get_health(
    State(state): State<AppState>,
) -> (axum::http::StatusCode, Json<HealthResponse>) {
    let watch_root_present = state.config.watch_root.is_dir();
    let sessions = state.registry.list().await.len();
    let response = HealthResponse {
        status: if watch_root_present {
            "healthy".to_string()
        } else {
            "unhealthy".to_string()
        },
        uptime_s: (Utc::now() - state.started_at).num_seconds(),
        watch_root: state.config.watch_root.display().to_string(),
        watch_root_present,
        sessions,
    };
    let status = if watch_root_present {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker;
    use crate::registry;
    use axum::http::{HeaderValue, StatusCode};
    use tokio_util::sync::CancellationToken;

    fn test_state(watch_root: &std::path::Path) -> AppState {
        let config = Arc::new(RelayConfig {
            watch_root: watch_root.to_path_buf(),
            ..RelayConfig::default()
        });
        let cancel = CancellationToken::new();
        let (broker_handle, broker_task) = broker::channel(Arc::clone(&config), cancel.clone(), 64);
        tokio::spawn(broker_task.run());
        let (registry_handle, registry_task) =
            registry::channel(broker_handle.sender(), cancel.clone(), 64);
        tokio::spawn(registry_task.run());

        AppState {
            auth: Arc::new(AuthService::new(&config)),
            registry: registry_handle,
            broker: broker_handle,
            config,
            started_at: Utc::now(),
            cancel,
        }
    }

    fn auth_headers(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_bearer_key_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_key(&headers), None);

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc123"),
        );
        assert_eq!(bearer_key(&headers), Some("abc123".to_string()));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic abc123"),
        );
        assert_eq!(bearer_key(&headers), None);

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer "),
        );
        assert_eq!(bearer_key(&headers), None);
    }

    #[tokio::test]
    async fn test_qr_embeds_token_in_enroll_url() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let Json(response) = post_qr(State(state)).await;

        assert_eq!(response.expires_in_s, 30);
        assert!(response
            .enroll_url
            .ends_with(&format!("/pair?token={}", response.token)));
    }

    #[tokio::test]
    async fn test_redeem_then_info_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let Json(qr) = post_qr(State(state.clone())).await;

        let body = serde_json::json!({ "token": qr.token, "device_id": "D1" }).to_string();
        let Json(redeemed) = post_mobile(State(state.clone()), body)
            .await
            .expect("redeem should succeed");
        assert_eq!(redeemed.server_info.name, "claude-relay");

        let Json(info) = get_info(State(state), auth_headers(&redeemed.key))
            .await
            .expect("info should succeed");
        assert_eq!(info.device_id, "D1");
    }

    #[tokio::test]
    async fn test_redeem_replay_maps_to_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let Json(qr) = post_qr(State(state.clone())).await;
        let body = serde_json::json!({ "token": qr.token, "device_id": "D1" }).to_string();

        let _ = post_mobile(State(state.clone()), body.clone()).await.unwrap();
        let err = post_mobile(State(state), body).await.unwrap_err();
        assert_eq!(err, ApiError::EnrollmentConsumed);
    }

    #[tokio::test]
    async fn test_redeem_rejects_bad_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let err = post_mobile(State(state.clone()), "{not json".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest { .. }));

        let err = post_mobile(
            State(state),
            serde_json::json!({ "token": "", "device_id": "" }).to_string(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest { .. }));
    }

    #[tokio::test]
    async fn test_sessions_rejects_missing_and_bogus_keys() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let err = get_sessions(State(state.clone()), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::Unauthorized { code: "unknown" });

        let err = get_sessions(State(state), auth_headers("bogus"))
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::Unauthorized { code: "unknown" });
    }

    #[tokio::test]
    async fn test_revoke_then_refresh_fails() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let Json(qr) = post_qr(State(state.clone())).await;
        let body = serde_json::json!({ "token": qr.token, "device_id": "D1" }).to_string();
        let Json(redeemed) = post_mobile(State(state.clone()), body).await.unwrap();

        post_revoke(State(state.clone()), auth_headers(&redeemed.key))
            .await
            .expect("revoke should succeed");

        let err = post_refresh(State(state), auth_headers(&redeemed.key))
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::Unauthorized { code: "revoked" });
    }

    #[tokio::test]
    async fn test_health_status_tracks_root() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let (status, Json(body)) = get_health(State(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "healthy");

        let gone = test_state(std::path::Path::new("/definitely/not/here"));
        let (status, Json(body)) = get_health(State(gone)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "unhealthy");
    }
}
