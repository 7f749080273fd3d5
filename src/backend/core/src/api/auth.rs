//! Shared-secret authentication.
//!
//! Every `/api/v1` request must carry
//! `Authorization: Harbor-Secret <shared-secret>`; the health endpoint
//! stays public.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::api::AppState;
use crate::error::{Result, StevedoreError};

/// Expected prefix of the Authorization header value.
pub const SECRET_PREFIX: &str = "Harbor-Secret";

const AUTH_HEADER: &str = "authorization";

/// Validate the Authorization header against the expected secret.
pub fn check_secret(header: Option<&str>, expected: &str) -> Result<()> {
    let header = header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| StevedoreError::unauthorized("'Authorization' header missing"))?;

    let secret = header
        .strip_prefix(SECRET_PREFIX)
        .ok_or_else(|| {
            StevedoreError::unauthorized(format!(
                "'Authorization' header should start with '{}'",
                SECRET_PREFIX
            ))
        })?
        .trim();

    if secret.is_empty() {
        return Err(StevedoreError::unauthorized("empty secret is not allowed"));
    }

    if secret != expected {
        return Err(StevedoreError::unauthorized("unauthorized"));
    }

    Ok(())
}

/// Axum middleware enforcing the shared secret.
pub async fn secret_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let header = req
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok());

    match check_secret(header, &state.secret) {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_secret_accepted() {
        assert!(check_secret(Some("Harbor-Secret s3cr3t"), "s3cr3t").is_ok());
        // Surrounding whitespace is tolerated.
        assert!(check_secret(Some("  Harbor-Secret   s3cr3t  "), "s3cr3t").is_ok());
    }

    #[test]
    fn test_missing_header_rejected() {
        assert!(check_secret(None, "s3cr3t").is_err());
        assert!(check_secret(Some("   "), "s3cr3t").is_err());
    }

    #[test]
    fn test_wrong_prefix_rejected() {
        assert!(check_secret(Some("Bearer s3cr3t"), "s3cr3t").is_err());
    }

    #[test]
    fn test_empty_or_wrong_secret_rejected() {
        assert!(check_secret(Some("Harbor-Secret"), "s3cr3t").is_err());
        assert!(check_secret(Some("Harbor-Secret   "), "s3cr3t").is_err());
        assert!(check_secret(Some("Harbor-Secret nope"), "s3cr3t").is_err());
    }
}
