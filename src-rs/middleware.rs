use std::{net::SocketAddr, time::Instant};

use axum::{
    body::{Body, HttpBody},
    extract::connect_info::ConnectInfo,
    extract::State,
    http::{
        uri::{PathAndQuery, Uri},
        HeaderMap, Request, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    policy,
    sentinel::{InboundCall, Verdict},
    state::AppState,
};

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("failed to read request body: {0}")]
    Body(#[from] axum::Error),
}

/// Abuse-detection layer in front of every game route.
///
/// Unauthenticated and bypass-listed traffic goes straight through. For an
/// identified caller the sentinel decides allow or reject before the handler
/// runs; the handler's 4xx answers feed the failed-action window afterwards.
pub async fn intercept(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = policy::canonical_path(request.uri().path());
    if path != request.uri().path() {
        let Some(uri) = with_path(request.uri(), &path) else {
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        };
        tracing::debug!(raw = %request.uri().path(), path = %path, "canonicalized request path");
        *request.uri_mut() = uri;
    }

    if policy::is_bypassed(&path) {
        return next.run(request).await;
    }

    let now_utc = Utc::now();
    let client_ip = client_ip(
        request.headers(),
        socket_addr(&request),
        state.config.trust_proxy,
    );
    if let Some(ban) = state.bans.ip_ban(&client_ip, now_utc) {
        tracing::info!(ip = %client_ip, ban_id = %ban.id, "rejected request from banned IP");
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    let Some(identity) = state.identity.identify(request.headers()) else {
        return next.run(request).await;
    };

    if let Some(ban) = state.bans.user_ban(&identity.user_id, now_utc) {
        tracing::info!(user_id = %identity.user_id, ban_id = %ban.id, "rejected request from banned user");
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    let method = request.method().clone();
    let (request, fingerprint) = if policy::is_mutating(&method) {
        match fingerprint_request(request, state.config.detection.fingerprint_body_limit).await {
            Ok(pair) => pair,
            Err(error) => {
                tracing::warn!(error = %error, user_id = %identity.user_id, "unreadable request body");
                return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
            }
        }
    } else {
        (request, None)
    };

    let call = InboundCall {
        method: &method,
        path: &path,
        identity: Some(&identity),
        fingerprint: fingerprint.as_deref(),
    };
    if let Verdict::Reject(_) = state.sentinel.inspect(&call, Instant::now()) {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests").into_response();
    }

    let response = next.run(request).await;

    let status = response.status();
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        state
            .sentinel
            .observe_failed_action(&identity, &path, status.as_u16(), Instant::now());
    }

    response
}

/// Buffers small bodies and hashes them together with the method, path and
/// query. Bodies above `limit`, or of unknown length, are passed through
/// untouched and produce no fingerprint.
async fn fingerprint_request(
    request: Request<Body>,
    limit: usize,
) -> Result<(Request<Body>, Option<String>), FingerprintError> {
    let fits = request
        .body()
        .size_hint()
        .upper()
        .is_some_and(|upper| upper <= limit as u64);
    if !fits {
        return Ok((request, None));
    }

    let (parts, body) = request.into_parts();
    let bytes: Bytes = axum::body::to_bytes(body, limit).await?;

    let mut hasher = Sha256::new();
    hasher.update(parts.method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(parts.uri.path().as_bytes());
    hasher.update(b"\n");
    hasher.update(parts.uri.query().unwrap_or_default().as_bytes());
    hasher.update(b"\n");
    hasher.update(&bytes);
    let fingerprint = hex::encode(hasher.finalize());

    Ok((Request::from_parts(parts, Body::from(bytes)), Some(fingerprint)))
}

/// Same URI with its path replaced. Downstream handlers and the upstream
/// see exactly the path that was inspected.
fn with_path(uri: &Uri, path: &str) -> Option<Uri> {
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query).ok()?);
    Uri::from_parts(parts).ok()
}

fn socket_addr(request: &Request<Body>) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<SocketAddr>()
        .copied()
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|value| value.0)
        })
}

fn client_ip(headers: &HeaderMap, socket_addr: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(value) = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            if let Some(first) = value.split(',').next() {
                let candidate = first.trim();
                if !candidate.is_empty() {
                    return candidate.to_string();
                }
            }
        }

        if let Some(value) = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
        {
            let candidate = value.trim();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }
    }

    socket_addr
        .map(|address| address.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
