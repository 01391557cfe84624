use std::{env, path::PathBuf, time::Duration};

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub trust_proxy: bool,
    pub tls_key_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub upstream_url: String,
    pub store_url: Option<String>,
    pub jwt_secret: Option<String>,
    pub jwt_issuer: Option<String>,
    pub report_token: Option<String>,
    pub alert_bot_token: Option<String>,
    pub alert_chat_id: Option<String>,
    pub alert_api_base: String,
    pub ban_refresh_interval: Duration,
    pub detection: DetectionConfig,
}

/// Thresholds and windows for the detection core.
#[derive(Clone, Debug)]
pub struct DetectionConfig {
    pub spam_window: Duration,
    pub spam_threshold: usize,
    pub failed_action_window: Duration,
    pub failed_action_threshold: usize,
    pub duplicate_interval: Duration,
    pub duplicate_idle: Duration,
    pub max_tracked_keys: usize,
    pub alert_flush_interval: Duration,
    pub fingerprint_body_limit: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            spam_window: Duration::from_secs(1),
            spam_threshold: 10,
            failed_action_window: Duration::from_secs(60),
            failed_action_threshold: 20,
            duplicate_interval: Duration::from_millis(100),
            duplicate_idle: Duration::from_secs(2),
            max_tracked_keys: 100_000,
            alert_flush_interval: Duration::from_secs(30),
            fingerprint_body_limit: 64 * 1024,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = parse_u16(env::var("PORT").ok(), 9010);

        let trust_proxy = match env::var("TRUST_PROXY") {
            Ok(value) => {
                let normalized = value.trim().to_lowercase();
                !matches!(normalized.as_str(), "false" | "0" | "off" | "no")
            }
            Err(_) => true,
        };

        let upstream_url = env::var("UPSTREAM_URL")
            .map_err(|_| anyhow::anyhow!("UPSTREAM_URL environment variable is not set"))?;
        let upstream_url = upstream_url.trim().trim_end_matches('/').to_string();

        let defaults = DetectionConfig::default();
        let detection = DetectionConfig {
            spam_window: Duration::from_millis(parse_u64(
                env::var("SPAM_WINDOW_MS").ok(),
                defaults.spam_window.as_millis() as u64,
            )),
            spam_threshold: parse_usize(env::var("SPAM_THRESHOLD").ok(), defaults.spam_threshold),
            failed_action_window: Duration::from_secs(parse_u64(
                env::var("FAILED_ACTION_WINDOW_SECS").ok(),
                defaults.failed_action_window.as_secs(),
            )),
            failed_action_threshold: parse_usize(
                env::var("FAILED_ACTION_THRESHOLD").ok(),
                defaults.failed_action_threshold,
            ),
            duplicate_interval: Duration::from_millis(parse_u64(
                env::var("DUPLICATE_INTERVAL_MS").ok(),
                defaults.duplicate_interval.as_millis() as u64,
            )),
            duplicate_idle: Duration::from_millis(parse_u64(
                env::var("DUPLICATE_IDLE_MS").ok(),
                defaults.duplicate_idle.as_millis() as u64,
            )),
            max_tracked_keys: parse_usize(
                env::var("MAX_TRACKED_KEYS").ok(),
                defaults.max_tracked_keys,
            ),
            alert_flush_interval: Duration::from_secs(parse_u64(
                env::var("ALERT_FLUSH_INTERVAL_SECS").ok(),
                defaults.alert_flush_interval.as_secs(),
            )),
            fingerprint_body_limit: parse_usize(
                env::var("FINGERPRINT_BODY_LIMIT").ok(),
                defaults.fingerprint_body_limit,
            ),
        };

        Ok(Self {
            port,
            trust_proxy,
            tls_key_path: env::var("TLS_KEY_PATH").ok().map(PathBuf::from),
            tls_cert_path: env::var("TLS_CERT_PATH").ok().map(PathBuf::from),
            upstream_url,
            store_url: non_empty(env::var("STORE_URL").ok()).map(|url| normalize_store_url(&url)),
            jwt_secret: non_empty(env::var("JWT_SECRET").ok()),
            jwt_issuer: non_empty(env::var("JWT_ISSUER").ok()),
            report_token: non_empty(env::var("REPORT_TOKEN").ok()),
            alert_bot_token: non_empty(env::var("ALERT_BOT_TOKEN").ok()),
            alert_chat_id: non_empty(env::var("ALERT_CHAT_ID").ok()),
            alert_api_base: env::var("ALERT_API_BASE")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            ban_refresh_interval: Duration::from_secs(parse_u64(
                env::var("BAN_REFRESH_SECS").ok(),
                60,
            )),
            detection,
        })
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests(upstream_url: &str) -> Self {
        Self {
            port: 0,
            trust_proxy: true,
            tls_key_path: None,
            tls_cert_path: None,
            upstream_url: upstream_url.to_string(),
            store_url: None,
            jwt_secret: None,
            jwt_issuer: None,
            report_token: None,
            alert_bot_token: None,
            alert_chat_id: None,
            alert_api_base: "http://127.0.0.1:9".to_string(),
            ban_refresh_interval: Duration::from_secs(60),
            detection: DetectionConfig::default(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_u16(value: Option<String>, fallback: u16) -> u16 {
    value
        .and_then(|v| v.parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_u64(value: Option<String>, fallback: u64) -> u64 {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn normalize_store_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(stripped) = trimmed.strip_prefix("wss://") {
        return format!("https://{}", stripped);
    }
    if let Some(stripped) = trimmed.strip_prefix("ws://") {
        return format!("http://{}", stripped);
    }
    trimmed.trim_end_matches('/').to_string()
}
