//! Authentication middleware
//!
//! Validates the bearer token on protected routes and injects the caller as
//! an `AuthUser` into request extensions for the handlers.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::{
    auth::{extract_bearer_token, AuthError},
    error::AppError,
    AppState,
};

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())
        .ok_or(AuthError::MissingCredentials)?
        .to_string();

    let user = state
        .auth
        .authenticate_jwt(&token, state.database.as_ref())
        .await
        .map_err(|e| {
            warn!(path = %request.uri().path(), error = %e, "authentication failed");
            e
        })?;

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use crate::auth::{extract_bearer_token, AuthError};
    use crate::error::AppError;
    use axum::http::{HeaderMap, StatusCode};

    #[test]
    fn test_missing_token_is_unauthorized() {
        let headers = HeaderMap::new();
        let err: AppError = extract_bearer_token(&headers)
            .ok_or(AuthError::MissingCredentials)
            .unwrap_err()
            .into();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_inactive_user_is_forbidden() {
        let err: AppError = AuthError::UserInactive.into();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }
}
