//! Authentication: JWT verification only. Issuing tokens (registration, login, refresh) is the
//! job of whatever identity provider sits in front of this service — out of scope here. A
//! bearer token's claims are taken as ground truth once its signature and expiry check out.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Claims this service actually reads off an incoming bearer token. Extra claims an IdP adds
/// (`iss`, `aud`, custom scopes, ...) are ignored rather than rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    email: Option<String>,
    role: Option<String>,
    exp: i64,
}

/// The authenticated caller, attached to the GraphQL request's data map.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
    pub role: Option<String>,
}

/// Per-request auth state. `required` reflects whether a JWT secret is configured at all:
/// when it isn't, every request resolves with `user: None` and resolvers never gate on it.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub user: Option<AuthUser>,
    pub required: bool,
}

/// Verifies `token`'s signature and expiry against `jwt_secret` and extracts the caller's
/// identity. Malformed or expired tokens are a `validation-error`, not an `AuthRequired` —
/// the caller presented a token, it just wasn't any good.
pub fn verify_token(token: &str, jwt_secret: &str) -> Result<AuthUser, CoreError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.validate_aud = false;

    let token_data = decode::<Claims>(token, &DecodingKey::from_secret(jwt_secret.as_bytes()), &validation)
        .map_err(|e| CoreError::validation(format!("invalid bearer token: {e}")))?;

    Ok(AuthUser {
        user_id: token_data.claims.sub,
        email: token_data.claims.email,
        role: token_data.claims.role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_with_claims(claims: &Claims, secret: &str) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn valid_token_round_trips_claims() {
        let secret = "test-secret";
        let claims = Claims {
            sub: "user-1".into(),
            email: Some("a@example.com".into()),
            role: Some("admin".into()),
            exp: (chrono::Utc::now() + chrono::Duration::minutes(5)).timestamp(),
        };
        let token = token_with_claims(&claims, secret);
        let user = verify_token(&token, secret).unwrap();
        assert_eq!(user.user_id, "user-1");
        assert_eq!(user.role.as_deref(), Some("admin"));
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = "test-secret";
        let claims = Claims {
            sub: "user-1".into(),
            email: None,
            role: None,
            exp: (chrono::Utc::now() - chrono::Duration::minutes(5)).timestamp(),
        };
        let token = token_with_claims(&claims, secret);
        let err = verify_token(&token, secret).unwrap_err();
        assert_eq!(err.code(), "validation-error");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let claims = Claims { sub: "user-1".into(), email: None, role: None, exp: i64::MAX / 2 };
        let token = token_with_claims(&claims, "secret-a");
        assert!(verify_token(&token, "secret-b").is_err());
    }
}
