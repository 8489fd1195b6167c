//! Bearer-token authentication.
//!
//! Every client-facing endpoint requires an `Authorization: Bearer <jwt>`
//! header. Tokens are HS256 JWTs whose `sub` claim is the client identity:
//! one token, one logical client, at most one tunnel.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::MIN_SECRET_LEN;

/// Identity of an authenticated client, taken from the token's `sub` claim.
///
/// Inserted into request extensions by [`require_client`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: u64,
}

/// Issues and verifies client tokens with a shared HS256 secret.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Result<Self, AuthError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::WeakSecret);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        // Tokens are long-lived client credentials, not sessions.
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["sub"]);
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        })
    }

    /// Issue a token for a brand-new client identity.
    pub fn issue(&self) -> Result<String, AuthError> {
        self.issue_for(&Uuid::now_v7().to_string())
    }

    /// Issue a token for an existing client identity.
    pub fn issue_for(&self, client_id: &str) -> Result<String, AuthError> {
        let iat = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let claims = Claims {
            sub: client_id.to_string(),
            iat,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Sign(e.to_string()))
    }

    /// Verify a token's signature and return the client it identifies.
    pub fn verify(&self, token: &str) -> Result<ClientId, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|_| AuthError::InvalidToken)?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        Ok(ClientId(data.claims.sub))
    }
}

/// Axum middleware that rejects requests without a valid bearer token and
/// records the caller's [`ClientId`] in the request extensions.
///
/// # Error responses
///
/// - `401 Unauthorized`: header missing, malformed, or token invalid
pub async fn require_client(
    State(signer): State<std::sync::Arc<TokenSigner>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(token) = token else {
        return unauthorized();
    };

    match signer.verify(token.trim()) {
        Ok(client_id) => {
            request.extensions_mut().insert(client_id);
            next.run(request).await
        }
        Err(_) => unauthorized(),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Unauthorized"})),
    )
        .into_response()
}

/// Errors from [`TokenSigner`].
#[derive(Debug)]
pub enum AuthError {
    /// The secret is shorter than the HS256 minimum.
    WeakSecret,
    /// Signature, algorithm or claims did not check out.
    InvalidToken,
    /// Encoding a new token failed.
    Sign(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::WeakSecret => write!(f, "Secret must be at least {MIN_SECRET_LEN} bytes"),
            AuthError::InvalidToken => write!(f, "Invalid token"),
            AuthError::Sign(e) => write!(f, "Failed to sign token: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn issued_token_verifies_to_its_subject() {
        let signer = TokenSigner::new(SECRET).unwrap();
        let token = signer.issue_for("client-a").unwrap();
        assert_eq!(signer.verify(&token).unwrap(), ClientId("client-a".into()));
    }

    #[test]
    fn fresh_tokens_get_distinct_identities() {
        let signer = TokenSigner::new(SECRET).unwrap();
        let a = signer.verify(&signer.issue().unwrap()).unwrap();
        let b = signer.verify(&signer.issue().unwrap()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let signer = TokenSigner::new(SECRET).unwrap();
        let other = TokenSigner::new(b"ffffffffffffffffffffffffffffffff").unwrap();
        let token = other.issue_for("client-a").unwrap();
        assert!(matches!(signer.verify(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let signer = TokenSigner::new(SECRET).unwrap();
        assert!(signer.verify("not-a-jwt").is_err());
    }

    #[test]
    fn short_secret_is_rejected() {
        assert!(matches!(
            TokenSigner::new(b"short"),
            Err(AuthError::WeakSecret)
        ));
    }
}
