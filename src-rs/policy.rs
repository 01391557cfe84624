use std::{borrow::Cow, time::Duration};

use axum::http::Method;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::flags::FlagKind;

/// Paths that are never inspected: login/registration, operator tooling,
/// service-to-service reports, API docs and health checks.
const BYPASS_PREFIXES: &[&str] = &[
    "/api/auth",
    "/api/admin",
    "/internal",
    "/docs",
    "/redoc",
    "/openapi.json",
    "/health",
];

#[derive(Debug)]
pub struct EndpointPolicy {
    pub name: &'static str,
    pattern: Regex,
    pub window: Duration,
    pub threshold: usize,
    pub kind: FlagKind,
}

impl EndpointPolicy {
    fn new(
        name: &'static str,
        pattern: &str,
        window: Duration,
        threshold: usize,
        kind: FlagKind,
    ) -> Self {
        Self {
            name,
            pattern: Regex::new(pattern).expect("valid regex"),
            window,
            threshold,
            kind,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }
}

static ENDPOINT_POLICIES: Lazy<Vec<EndpointPolicy>> = Lazy::new(|| {
    vec![
        EndpointPolicy::new(
            "bank-transfer",
            r"^/api/bank/transfer/?$",
            Duration::from_secs(10),
            5,
            FlagKind::RapidTransfer,
        ),
        EndpointPolicy::new(
            "crime-commit",
            r"^/api/crimes/[^/]+/commit/?$",
            Duration::from_secs(60),
            30,
            FlagKind::RequestSpam,
        ),
        EndpointPolicy::new(
            "heist-join",
            r"^/api/heists/[^/]+/(join|start)/?$",
            Duration::from_secs(30),
            10,
            FlagKind::RequestSpam,
        ),
        EndpointPolicy::new(
            "combat-attack",
            r"^/api/combat/attack(/[^/]+)?/?$",
            Duration::from_secs(60),
            20,
            FlagKind::RequestSpam,
        ),
    ]
});

pub fn endpoint_policies() -> &'static [EndpointPolicy] {
    &ENDPOINT_POLICIES
}

/// Index into [`endpoint_policies`] of the first policy covering `path`.
pub fn policy_index(path: &str) -> Option<usize> {
    endpoint_policies()
        .iter()
        .position(|policy| policy.matches(path))
}

pub fn is_bypassed(path: &str) -> bool {
    BYPASS_PREFIXES.iter().any(|prefix| {
        path.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    })
}

pub fn is_mutating(method: &Method) -> bool {
    [Method::POST, Method::PUT, Method::PATCH, Method::DELETE].contains(method)
}

/// The path as the game API will route it: escaped unreserved characters
/// decoded, empty and `.` segments dropped, `..` resolved. A trailing slash is
/// kept. Escapes of reserved characters such as `%2F` stay encoded.
pub fn canonical_path(path: &str) -> String {
    let decoded = decode_unreserved(path);

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    let mut canonical = String::with_capacity(decoded.len());
    for segment in &segments {
        canonical.push('/');
        canonical.push_str(segment);
    }
    let trailing_slash =
        decoded.ends_with('/') || decoded.ends_with("/.") || decoded.ends_with("/..");
    if canonical.is_empty() || trailing_slash {
        canonical.push('/');
    }
    canonical
}

fn decode_unreserved(path: &str) -> Cow<'_, str> {
    if !path.contains('%') {
        return Cow::Borrowed(path);
    }

    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let decoded = path
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                .filter(|byte| byte.is_ascii_alphanumeric() || b"-._~".contains(byte));
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    match String::from_utf8(out) {
        Ok(decoded) => Cow::Owned(decoded),
        Err(_) => Cow::Borrowed(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_matches_whole_path_segments() {
        assert!(is_bypassed("/api/auth/login"));
        assert!(is_bypassed("/api/auth"));
        assert!(is_bypassed("/api/admin/flags/12/resolve"));
        assert!(is_bypassed("/docs"));
        assert!(is_bypassed("/openapi.json"));
        assert!(is_bypassed("/health"));
        assert!(is_bypassed("/internal/flags"));

        assert!(!is_bypassed("/api/authority/claim"));
        assert!(!is_bypassed("/api/bank/transfer"));
        assert!(!is_bypassed("/"));
    }

    #[test]
    fn policies_resolve_by_path() {
        let transfer = policy_index("/api/bank/transfer").unwrap();
        assert_eq!(endpoint_policies()[transfer].kind, FlagKind::RapidTransfer);
        assert_eq!(endpoint_policies()[transfer].threshold, 5);

        let heist = policy_index("/api/heists/h-77/start").unwrap();
        assert_eq!(endpoint_policies()[heist].name, "heist-join");

        assert!(policy_index("/api/crimes/pickpocket/commit").is_some());
        assert!(policy_index("/api/combat/attack/user-9").is_some());
        assert!(policy_index("/api/crimes").is_none());
        assert!(policy_index("/api/bank/transfer/history").is_none());
    }

    #[test]
    fn canonical_path_resolves_dot_segments() {
        assert_eq!(canonical_path("/api/auth/../crimes"), "/api/crimes");
        assert_eq!(canonical_path("/api/./bank//transfer"), "/api/bank/transfer");
        assert_eq!(canonical_path("/../../health"), "/health");
        assert_eq!(canonical_path("/api/heists/h1/join/"), "/api/heists/h1/join/");
        assert_eq!(canonical_path("/api/crimes/.."), "/api/");
        assert_eq!(canonical_path("/"), "/");
        assert_eq!(canonical_path(""), "/");
    }

    #[test]
    fn canonical_path_decodes_only_unreserved_escapes() {
        assert_eq!(canonical_path("/api/bank/%74ransfer"), "/api/bank/transfer");
        assert_eq!(canonical_path("/api/auth/%2e%2E/crimes"), "/api/crimes");
        assert_eq!(canonical_path("/api/auth%2Fx"), "/api/auth%2Fx");
        assert_eq!(canonical_path("/api/100%"), "/api/100%");
        assert_eq!(canonical_path("/api/%zz"), "/api/%zz");

        assert!(!is_bypassed(&canonical_path("/api/auth/../crimes")));
        assert!(policy_index(&canonical_path("/api/bank/%74ransfer")).is_some());
    }

    #[test]
    fn only_state_changing_methods_are_mutating() {
        assert!(is_mutating(&Method::POST));
        assert!(is_mutating(&Method::DELETE));
        assert!(!is_mutating(&Method::GET));
        assert!(!is_mutating(&Method::OPTIONS));
    }
}
