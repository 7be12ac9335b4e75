//! Bearer-token identity extractor for Axum handlers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use cuepoint_core::error::CoreError;
use cuepoint_core::identity::Identity;

use crate::error::AppError;
use crate::state::AppState;

/// Identity extracted from an `Authorization: Bearer <token>` header and
/// verified by the service's identity provider.
#[derive(Debug, Clone)]
pub struct AuthIdentity(pub Identity);

impl FromRequestParts<AppState> for AuthIdentity {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Core(CoreError::Unauthorized(
                    "Missing Authorization header".into(),
                ))
            })?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            AppError::Core(CoreError::Unauthorized(
                "Invalid Authorization format. Expected: Bearer <token>".into(),
            ))
        })?;

        let identity = state.service.authenticate(token)?;
        Ok(AuthIdentity(identity))
    }
}
