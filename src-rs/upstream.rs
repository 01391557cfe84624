use std::time::Duration;

use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    response::{IntoResponse, Response},
};
use http::{header::HOST, HeaderMap, Request, StatusCode};

use crate::state::AppState;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const UPSTREAM_BODY_LIMIT: usize = 25 * 1024 * 1024;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client for the game API that sits behind the interceptor.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build upstream HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn forward(&self, request: Request<Body>) -> anyhow::Result<Response> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|value| value.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base_url, path_and_query);

        let body = axum::body::to_bytes(body, UPSTREAM_BODY_LIMIT)
            .await
            .context("failed to read request body")?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);

        let upstream_response = self
            .http
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .with_context(|| format!("upstream request failed for {path_and_query}"))?;

        let status = upstream_response.status();
        let mut response_headers = upstream_response.headers().clone();
        strip_hop_by_hop(&mut response_headers);
        let bytes = upstream_response
            .bytes()
            .await
            .context("failed to read upstream response body")?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

pub async fn forward(State(state): State<AppState>, request: Request<Body>) -> Response {
    let path = request.uri().path().to_string();
    match state.upstream.forward(request).await {
        Ok(response) => response,
        Err(error) => {
            tracing::error!(error = ?error, path = %path, "failed to reach game API");
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}
