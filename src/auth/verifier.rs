//! Credential verification
//!
//! JWT validation with issuer/audience/expiry claims and a UUID `user_id`
//! claim, plus the trusted-header mode for deployments where a reverse
//! proxy terminates authentication. Token sources are tried in order:
//! `token` query parameter, `Authorization: Bearer`, then the configured
//! cookie.

use actix_web::HttpRequest;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AuthError, AuthenticatedUser};
use crate::config::{AuthConfig, AuthMode};

const USER_ID_HEADER: &str = "X-User-Id";
const USER_EMAIL_HEADER: &str = "X-User-Email";
const USER_NAME_HEADER: &str = "X-User-Name";

/// JWT claims accepted by the verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
    pub user_id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Stateless token verifier.
pub struct TokenVerifier {
    mode: AuthMode,
    decoding_key: DecodingKey,
    validation: Validation,
    cookie_name: String,
}

impl TokenVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);

        Self {
            mode: config.mode,
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            cookie_name: config.cookie_name.clone(),
        }
    }

    /// Authenticate an upgrade or HTTP request according to the configured
    /// mode. In signed-token mode, upstream identity headers are ignored.
    pub fn verify_request(&self, req: &HttpRequest) -> Result<AuthenticatedUser, AuthError> {
        match self.mode {
            AuthMode::SignedToken => {
                let token = self.extract_token(req)?;
                self.verify_token(&token)
            }
            AuthMode::TrustedHeader => self.verify_headers(req),
            AuthMode::Both => match self.extract_token(req) {
                Ok(token) => self.verify_token(&token),
                Err(AuthError::Missing) => self.verify_headers(req),
                Err(err) => Err(err),
            },
        }
    }

    /// Validate a signed token and extract the principal.
    pub fn verify_token(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(
            |err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken
                | jsonwebtoken::errors::ErrorKind::Base64(_)
                | jsonwebtoken::errors::ErrorKind::Json(_)
                | jsonwebtoken::errors::ErrorKind::Utf8(_) => {
                    AuthError::Malformed(err.to_string())
                }
                _ => AuthError::Invalid(err.to_string()),
            },
        )?;

        debug!(user_id = %data.claims.user_id, "Token verified");
        Ok(AuthenticatedUser {
            user_id: data.claims.user_id,
            email: data.claims.email,
            username: data.claims.username,
        })
    }

    /// Token source precedence: query parameter, bearer header, cookie.
    fn extract_token(&self, req: &HttpRequest) -> Result<String, AuthError> {
        let params: std::collections::HashMap<String, String> =
            url::form_urlencoded::parse(req.query_string().as_bytes())
                .into_owned()
                .collect();
        if let Some(token) = params.get("token") {
            return Ok(token.clone());
        }

        if let Some(header) = req.headers().get("Authorization") {
            let raw = header
                .to_str()
                .map_err(|_| AuthError::Malformed("non-ASCII Authorization header".into()))?;
            return raw
                .strip_prefix("Bearer ")
                .map(str::to_string)
                .ok_or_else(|| {
                    AuthError::Malformed("Authorization header must be 'Bearer <token>'".into())
                });
        }

        if let Some(cookie) = req.cookie(&self.cookie_name) {
            return Ok(cookie.value().to_string());
        }

        Err(AuthError::Missing)
    }

    /// Trusted-header mode: the upstream already authenticated the caller.
    fn verify_headers(&self, req: &HttpRequest) -> Result<AuthenticatedUser, AuthError> {
        let raw_id = req
            .headers()
            .get(USER_ID_HEADER)
            .ok_or(AuthError::Missing)?
            .to_str()
            .map_err(|_| AuthError::Malformed("non-ASCII identity header".into()))?;

        let user_id = raw_id.parse::<Uuid>().map_err(|_| {
            warn!(header = USER_ID_HEADER, "Identity header is not a UUID");
            AuthError::Malformed(format!("{} must be a UUID", USER_ID_HEADER))
        })?;

        let header_string = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        Ok(AuthenticatedUser {
            user_id,
            email: header_string(USER_EMAIL_HEADER),
            username: header_string(USER_NAME_HEADER),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn config(mode: AuthMode) -> AuthConfig {
        AuthConfig {
            mode,
            secret: SECRET.to_string(),
            issuer: "chat-platform".to_string(),
            audience: "realtime-chat".to_string(),
            cookie_name: "chat_token".to_string(),
        }
    }

    fn issue(user_id: Uuid, expires_in: Duration) -> String {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + expires_in).timestamp(),
            iss: "chat-platform".to_string(),
            aud: "realtime-chat".to_string(),
            user_id,
            email: Some("u@example.com".to_string()),
            username: Some("u".to_string()),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes()))
            .unwrap()
    }

    #[test]
    fn test_valid_token() {
        let verifier = TokenVerifier::new(&config(AuthMode::SignedToken));
        let user_id = Uuid::new_v4();
        let token = issue(user_id, Duration::hours(1));

        let principal = verifier.verify_token(&token).unwrap();
        assert_eq!(principal.user_id, user_id);
        assert_eq!(principal.email.as_deref(), Some("u@example.com"));
    }

    #[test]
    fn test_expired_token() {
        let mut cfg = config(AuthMode::SignedToken);
        cfg.secret = SECRET.to_string();
        let verifier = TokenVerifier::new(&cfg);
        let token = issue(Uuid::new_v4(), Duration::seconds(-120));

        assert!(matches!(verifier.verify_token(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn test_garbage_token() {
        let verifier = TokenVerifier::new(&config(AuthMode::SignedToken));
        let result = verifier.verify_token("not-a-jwt");
        assert!(matches!(
            result,
            Err(AuthError::Malformed(_)) | Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn test_wrong_audience_rejected() {
        let verifier = TokenVerifier::new(&config(AuthMode::SignedToken));
        let now = Utc::now();
        let user_id = Uuid::new_v4();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::hours(1)).timestamp(),
            iss: "chat-platform".to_string(),
            aud: "some-other-service".to_string(),
            user_id,
            email: None,
            username: None,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        assert!(verifier.verify_token(&token).is_err());
    }

    #[test]
    fn test_query_parameter_precedence() {
        let verifier = TokenVerifier::new(&config(AuthMode::SignedToken));
        let query_user = Uuid::new_v4();
        let header_user = Uuid::new_v4();

        let req = TestRequest::default()
            .uri(&format!("/ws?token={}", issue(query_user, Duration::hours(1))))
            .insert_header((
                "Authorization",
                format!("Bearer {}", issue(header_user, Duration::hours(1))),
            ))
            .to_http_request();

        let principal = verifier.verify_request(&req).unwrap();
        assert_eq!(principal.user_id, query_user);
    }

    #[test]
    fn test_bearer_header_source() {
        let verifier = TokenVerifier::new(&config(AuthMode::SignedToken));
        let user_id = Uuid::new_v4();

        let req = TestRequest::default()
            .uri("/ws")
            .insert_header((
                "Authorization",
                format!("Bearer {}", issue(user_id, Duration::hours(1))),
            ))
            .to_http_request();

        assert_eq!(verifier.verify_request(&req).unwrap().user_id, user_id);
    }

    #[test]
    fn test_missing_credential() {
        let verifier = TokenVerifier::new(&config(AuthMode::SignedToken));
        let req = TestRequest::default().uri("/ws").to_http_request();
        assert!(matches!(verifier.verify_request(&req), Err(AuthError::Missing)));
    }

    #[test]
    fn test_signed_token_mode_ignores_identity_headers() {
        let verifier = TokenVerifier::new(&config(AuthMode::SignedToken));
        let spoofed = Uuid::new_v4();

        let req = TestRequest::default()
            .uri("/ws")
            .insert_header((USER_ID_HEADER, spoofed.to_string()))
            .to_http_request();

        // The spoofed header must not authenticate the request.
        assert!(matches!(verifier.verify_request(&req), Err(AuthError::Missing)));
    }

    #[test]
    fn test_trusted_header_mode() {
        let verifier = TokenVerifier::new(&config(AuthMode::TrustedHeader));
        let user_id = Uuid::new_v4();

        let req = TestRequest::default()
            .uri("/ws")
            .insert_header((USER_ID_HEADER, user_id.to_string()))
            .insert_header((USER_EMAIL_HEADER, "u@example.com"))
            .to_http_request();

        let principal = verifier.verify_request(&req).unwrap();
        assert_eq!(principal.user_id, user_id);
        assert_eq!(principal.email.as_deref(), Some("u@example.com"));
    }

    #[test]
    fn test_trusted_header_requires_uuid() {
        let verifier = TokenVerifier::new(&config(AuthMode::TrustedHeader));
        let req = TestRequest::default()
            .uri("/ws")
            .insert_header((USER_ID_HEADER, "alice"))
            .to_http_request();

        assert!(matches!(
            verifier.verify_request(&req),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn test_both_mode_prefers_token() {
        let verifier = TokenVerifier::new(&config(AuthMode::Both));
        let token_user = Uuid::new_v4();
        let header_user = Uuid::new_v4();

        let req = TestRequest::default()
            .uri(&format!("/ws?token={}", issue(token_user, Duration::hours(1))))
            .insert_header((USER_ID_HEADER, header_user.to_string()))
            .to_http_request();
        assert_eq!(verifier.verify_request(&req).unwrap().user_id, token_user);

        // Without a token, the trusted headers carry the identity.
        let req = TestRequest::default()
            .uri("/ws")
            .insert_header((USER_ID_HEADER, header_user.to_string()))
            .to_http_request();
        assert_eq!(verifier.verify_request(&req).unwrap().user_id, header_user);
    }
}
