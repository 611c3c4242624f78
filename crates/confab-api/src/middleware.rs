use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use tracing::error;

use confab_types::api::Claims;

use crate::state::AppState;

/// Validate a bearer token against the shared secret. Used by the REST
/// middleware and by the WebSocket upgrade handlers (which carry the token as
/// a query parameter since browsers cannot set headers on upgrades).
pub fn validate_token(secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .ok()
}

/// Extract and validate JWT from the Authorization header, then make sure the
/// local user row exists. Tokens are minted by the account subsystem; a valid
/// token for a user this engine has never seen implies a fresh row.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = validate_token(&state.jwt_secret, token).ok_or(StatusCode::UNAUTHORIZED)?;

    let db = state.db.clone();
    let user_id = claims.sub;
    let username = claims.username.clone();
    tokio::task::spawn_blocking(move || db.ensure_user(user_id, &username))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("Failed to ensure user row: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use uuid::Uuid;

    fn mint(secret: &str, exp: usize) -> String {
        let claims = Claims {
            sub: Uuid::new_v4(),
            username: "ava".into(),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_round_trips() {
        let exp = (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize;
        let token = mint("sekrit", exp);
        let claims = validate_token("sekrit", &token).unwrap();
        assert_eq!(claims.username, "ava");
    }

    #[test]
    fn wrong_secret_and_expired_tokens_are_rejected() {
        let exp = (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize;
        let token = mint("sekrit", exp);
        assert!(validate_token("other", &token).is_none());

        let stale = (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp() as usize;
        let token = mint("sekrit", stale);
        assert!(validate_token("sekrit", &token).is_none());
    }
}
