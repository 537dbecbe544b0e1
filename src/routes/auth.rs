//! Registration, login and the caller's own account

use axum::{extract::State, response::Json, Extension};
use tracing::{info, warn};

use crate::{
    audit::{AuditEntry, RequestMeta},
    auth::{validate_email, validate_password_strength, validate_username, AuthError, AuthUser},
    error::{AppError, AppResult},
    models::{
        ChangePasswordRequest, LoginRequest, LoginResponse, NewUser, RegisterRequest,
        UpdateProfileRequest, User,
    },
    ApiResponse, AppState,
};

async fn create_account(state: &AppState, payload: &RegisterRequest) -> AppResult<User> {
    let username = payload.username.trim();
    let email = payload.email.trim();

    if !validate_username(username) {
        return Err(AppError::Validation(
            "Username must be 3-32 characters of letters, digits, '_' or '-'".to_string(),
        ));
    }
    if !validate_email(email) {
        return Err(AppError::Validation("Invalid email format".to_string()));
    }
    validate_password_strength(&payload.password).map_err(AppError::Validation)?;

    let (username_taken, email_taken) = state.database.account_exists(username, email).await?;
    if username_taken {
        return Err(AppError::Conflict("Username already exists".to_string()));
    }
    if email_taken {
        return Err(AppError::Conflict("Email already registered".to_string()));
    }

    let password_hash = state.auth.hash_password(&payload.password)?;
    // no explicit group: the ledger resolves the default group
    let user = state
        .database
        .create_user(NewUser {
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            is_admin: false,
            user_group_id: None,
        })
        .await?;
    Ok(user)
}

pub async fn register(
    State(state): State<AppState>,
    meta: RequestMeta,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<Json<ApiResponse<User>>> {
    let result = create_account(&state, &payload).await;

    let mut entry = AuditEntry::new("register", "user").request(&meta).outcome(&result);
    entry = match &result {
        Ok(user) => entry.actor(user.id).resource(user.id, user.username.clone()),
        Err(_) => entry.details(format!("username={}", payload.username.trim())),
    };
    entry.record(&state.database).await;

    Ok(Json(ApiResponse::success(result?)))
}

pub async fn login(
    State(state): State<AppState>,
    meta: RequestMeta,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<ApiResponse<LoginResponse>>> {
    let login = payload.username.trim();
    let user = state.database.get_user_by_login(login).await?;

    let result: AppResult<LoginResponse> = match &user {
        None => Err(AuthError::InvalidCredentials.into()),
        Some(user) => match state.auth.check_credentials(user, &payload.password) {
            Err(e) => Err(e.into()),
            Ok(()) => {
                state.database.record_login(user.id).await?;
                let (token, expires_at) = state.auth.generate_token(user)?;
                Ok(LoginResponse {
                    token,
                    expires_at,
                    user: user.clone(),
                })
            }
        },
    };

    let mut entry = AuditEntry::new("login", "user").request(&meta).outcome(&result);
    match &user {
        Some(user) => entry = entry.actor(user.id).resource(user.id, user.username.clone()),
        None => entry = entry.details(format!("login={}", login)),
    }
    entry.record(&state.database).await;

    match &result {
        Ok(response) => info!(user_id = %response.user.id, "user logged in"),
        Err(e) => warn!(login = %login, error = %e, "login rejected"),
    }
    Ok(Json(ApiResponse::success(result?)))
}

async fn current_user(state: &AppState, user: &AuthUser) -> AppResult<User> {
    state
        .database
        .get_user_by_id(user.id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))
}

pub async fn profile(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<Json<ApiResponse<User>>> {
    let account = current_user(&state, &user).await?;
    Ok(Json(ApiResponse::success(account)))
}

fn validate_profile(payload: &UpdateProfileRequest) -> AppResult<()> {
    if payload.real_name.as_ref().map_or(false, |name| name.chars().count() > 50) {
        return Err(AppError::Validation("Real name must be at most 50 characters".to_string()));
    }
    if let Some(phone) = &payload.phone {
        let valid = phone.len() <= 20
            && phone
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')'));
        if !valid {
            return Err(AppError::Validation("Invalid phone number".to_string()));
        }
    }
    Ok(())
}

pub async fn update_profile(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Json(payload): Json<UpdateProfileRequest>,
) -> AppResult<Json<ApiResponse<User>>> {
    validate_profile(&payload)?;

    let account = state
        .database
        .update_profile(user.id, &payload)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

    AuditEntry::new("update_profile", "user")
        .actor(user.id)
        .resource(user.id, user.username.clone())
        .request(&meta)
        .record(&state.database)
        .await;

    Ok(Json(ApiResponse::success(account)))
}

pub async fn change_password(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    meta: RequestMeta,
    Json(payload): Json<ChangePasswordRequest>,
) -> AppResult<Json<ApiResponse<()>>> {
    let account = current_user(&state, &user).await?;

    let result: AppResult<()> = async {
        if !state.auth.verify_password(&payload.current_password, &account.password_hash)? {
            return Err(AppError::Auth("Current password is incorrect".to_string()));
        }
        validate_password_strength(&payload.new_password).map_err(AppError::Validation)?;
        let hash = state.auth.hash_password(&payload.new_password)?;
        state.database.update_password(user.id, &hash).await?;
        Ok(())
    }
    .await;

    AuditEntry::new("change_password", "user")
        .actor(user.id)
        .resource(user.id, user.username.clone())
        .request(&meta)
        .outcome(&result)
        .record(&state.database)
        .await;

    result?;
    Ok(Json(ApiResponse::success(())))
}
