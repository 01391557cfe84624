use axum::{
    body::Bytes,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use subtle::ConstantTimeEq;

use crate::{
    auth::{extract_bearer_token, Identity},
    flags::FlagKind,
    state::AppState,
};

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let sentinel = &state.sentinel;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "identityVerification": state.identity.is_configured(),
            "trackedKeys": sentinel.tracked_keys(),
            "pendingAlerts": sentinel.alerts().pending(),
            "pendingFlags": sentinel.flags().pending(),
            "recordedFlags": sentinel.flags().recorded_count(),
            "activeBans": state.bans.count(),
        })),
    )
}

/// Violation filed by a game service that detected it itself, such as a
/// stat that cannot be reached through normal play.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationReport {
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    pub flag_type: FlagKind,
    pub reason: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Token first, body second: 404 without a configured token, 401 for a wrong
/// one, 400 for a malformed or incomplete report.
pub async fn report_violation(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(expected) = state.config.report_token.as_deref() else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };

    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| extract_bearer_token(value).ok());
    let authorized =
        presented.is_some_and(|token| bool::from(token.as_bytes().ct_eq(expected.as_bytes())));
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let report: ViolationReport = match serde_json::from_slice(&body) {
        Ok(report) => report,
        Err(error) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid report: {error}") })),
            )
                .into_response();
        }
    };

    let user_id = report.user_id.trim();
    if user_id.is_empty() || report.reason.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "userId and reason are required" })),
        )
            .into_response();
    }

    let identity = Identity {
        user_id: user_id.to_string(),
        username: report.username,
    };
    state
        .sentinel
        .report(&identity, report.flag_type, report.reason, report.details);

    (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response()
}
