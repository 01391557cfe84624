use axum::http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{de, Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: Option<String>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity verification is not configured")]
    NotConfigured,
    #[error("invalid Authorization header format")]
    MalformedHeader,
    #[error("token verification failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token subject is empty")]
    EmptySubject,
}

#[derive(Debug, Deserialize)]
struct SessionClaims {
    #[serde(deserialize_with = "de_subject")]
    sub: String,
    #[serde(default)]
    username: Option<String>,
}

/// Verifies the game's HS256 session tokens and yields the caller identity.
#[derive(Clone)]
pub struct IdentityVerifier {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl IdentityVerifier {
    pub fn new(secret: Option<&str>, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
            validation.set_required_spec_claims(&["exp", "iss"]);
        }

        Self {
            key: secret.map(|secret| DecodingKey::from_secret(secret.as_bytes())),
            validation,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    pub fn verify_bearer(&self, authorization_header: &str) -> Result<Identity, IdentityError> {
        let key = self.key.as_ref().ok_or(IdentityError::NotConfigured)?;
        let token = extract_bearer_token(authorization_header)?;

        let claims = decode::<SessionClaims>(token, key, &self.validation)?.claims;
        let user_id = claims.sub.trim().to_string();
        if user_id.is_empty() {
            return Err(IdentityError::EmptySubject);
        }

        Ok(Identity {
            user_id,
            username: claims
                .username
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty()),
        })
    }

    /// Identity of the caller, or `None` for anonymous traffic. A bad or
    /// missing credential is not an error here.
    pub fn identify(&self, headers: &HeaderMap) -> Option<Identity> {
        let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
        match self.verify_bearer(header) {
            Ok(identity) => Some(identity),
            Err(error) => {
                tracing::debug!(error = %error, "treating caller as anonymous");
                None
            }
        }
    }
}

pub fn extract_bearer_token(value: &str) -> Result<&str, IdentityError> {
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default();

    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(IdentityError::MalformedHeader);
    }

    Ok(token.trim())
}

fn de_subject<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(de::Error::custom(format!("unsupported sub claim: {other}"))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use axum::http::HeaderValue;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    use super::*;

    pub(crate) const SECRET: &str = "test-secret";

    pub(crate) fn token_for(sub: Value, username: &str, secret: &str, ttl_secs: i64) -> String {
        let claims = json!({
            "sub": sub,
            "username": username,
            "exp": Utc::now().timestamp() + ttl_secs,
        });
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn valid_token_yields_identity() {
        let verifier = IdentityVerifier::new(Some(SECRET), None);
        let token = token_for(json!("user-1"), "vito", SECRET, 600);

        let identity = verifier.verify_bearer(&format!("Bearer {token}")).unwrap();
        assert_eq!(
            identity,
            Identity {
                user_id: "user-1".into(),
                username: Some("vito".into())
            }
        );
    }

    #[test]
    fn numeric_subject_is_accepted() {
        let verifier = IdentityVerifier::new(Some(SECRET), None);
        let token = token_for(json!(42), "", SECRET, 600);

        let identity = verifier.verify_bearer(&format!("bearer {token}")).unwrap();
        assert_eq!(identity.user_id, "42");
        assert_eq!(identity.username, None);
    }

    #[test]
    fn bad_credentials_are_anonymous() {
        let verifier = IdentityVerifier::new(Some(SECRET), None);

        let forged = token_for(json!("user-1"), "vito", "other-secret", 600);
        assert!(verifier.identify(&headers_with(&format!("Bearer {forged}"))).is_none());

        let expired = token_for(json!("user-1"), "vito", SECRET, -3600);
        assert!(verifier.identify(&headers_with(&format!("Bearer {expired}"))).is_none());

        assert!(verifier.identify(&headers_with("Basic dXNlcjpwYXNz")).is_none());
        assert!(verifier.identify(&HeaderMap::new()).is_none());
    }

    #[test]
    fn unconfigured_verifier_treats_everyone_as_anonymous() {
        let verifier = IdentityVerifier::new(None, None);
        let token = token_for(json!("user-1"), "vito", SECRET, 600);

        assert!(!verifier.is_configured());
        assert!(matches!(
            verifier.verify_bearer(&format!("Bearer {token}")),
            Err(IdentityError::NotConfigured)
        ));
        assert!(verifier.identify(&headers_with(&format!("Bearer {token}"))).is_none());
    }

    #[test]
    fn issuer_is_enforced_when_configured() {
        let verifier = IdentityVerifier::new(Some(SECRET), Some("game-auth"));
        let token = token_for(json!("user-1"), "vito", SECRET, 600);
        assert!(verifier.verify_bearer(&format!("Bearer {token}")).is_err());
    }
}
