use std::time::Duration;

use anyhow::{anyhow, Context};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// HTTP client for the game's shared document store.
///
/// Functions are addressed as `module:function` and called with a single
/// argument object, e.g. `securityFlags:create`.
#[derive(Clone)]
pub struct DocumentStore {
    base_url: String,
    http: reqwest::Client,
}

const STORE_USER_AGENT: &str = concat!("heist-sentinel/", env!("CARGO_PKG_VERSION"));
const STORE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

impl DocumentStore {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(STORE_USER_AGENT)
            .timeout(STORE_REQUEST_TIMEOUT)
            .build()
            .context("failed to create document store HTTP client")?;

        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn query<T: DeserializeOwned>(&self, path: &str, args: Value) -> anyhow::Result<T> {
        let value = self.call("query", path, args).await?;
        serde_json::from_value(value)
            .with_context(|| format!("failed to decode store query result for {path}"))
    }

    pub async fn mutation(&self, path: &str, args: Value) -> anyhow::Result<Value> {
        self.call("mutation", path, args).await
    }

    async fn call(&self, kind: &str, path: &str, args: Value) -> anyhow::Result<Value> {
        let endpoint = format!("{}/api/{}", self.base_url, kind);
        let mut args = args;
        prune_null_object_fields(&mut args);
        let body = json!({
            "path": path,
            "format": "json",
            "args": [args],
        });

        let response = self
            .http
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .with_context(|| {
                format!(
                    "store {} request failed for {} (base_url={})",
                    kind, path, self.base_url
                )
            })?;

        let status = response.status();
        let response_body: Value = response
            .json()
            .await
            .with_context(|| format!("failed to parse store {} response for {}", kind, path))?;

        // 560 carries a function error in the regular envelope.
        if !status.is_success() && status.as_u16() != 560 {
            return Err(anyhow!(
                "store {} HTTP error {} for {}: {}",
                kind,
                status,
                path,
                response_body
            ));
        }

        unwrap_envelope(kind, path, response_body)
    }
}

fn unwrap_envelope(kind: &str, path: &str, body: Value) -> anyhow::Result<Value> {
    match body.get("status").and_then(Value::as_str) {
        Some("success") => Ok(body.get("value").cloned().unwrap_or(Value::Null)),
        Some("error") => {
            let message = body
                .get("errorMessage")
                .and_then(Value::as_str)
                .unwrap_or("store function error");
            Err(anyhow!("store {} {} failed: {}", kind, path, message))
        }
        _ => Err(anyhow!(
            "invalid store {} response for {}: {}",
            kind,
            path,
            body
        )),
    }
}

fn prune_null_object_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, child| !child.is_null());
            for child in map.values_mut() {
                prune_null_object_fields(child);
            }
        }
        Value::Array(values) => {
            for child in values {
                prune_null_object_fields(child);
            }
        }
        _ => {}
    }
}
