use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, HeaderValue},
    Json,
};
use axum_extra::{headers::Cookie, typed_header::TypedHeader};
use chrono::{Duration as ChronoDuration, Utc};
use diesel::{prelude::*, PgConnection};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::{password, AuthenticatedUser, Permission},
    error::{AppError, AppResult},
    extract::ApiJson,
    models::{NewRefreshToken, RefreshToken, User},
    schema::{refresh_tokens, users},
    state::AppState,
    utils::response::{ApiResponse, Empty},
};

use super::users::{normalise_email, trim_in_place, UserResponse};

const REFRESH_COOKIE_NAME: &str = "refresh_token";

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub user: UserResponse,
}

#[derive(Serialize)]
pub struct ProfileResponse {
    #[serde(flatten)]
    pub user: UserResponse,
    pub permissions: &'static [Permission],
}

#[derive(Deserialize, Validate)]
pub struct UpdateDetailsRequest {
    #[validate(length(min = 1, max = 255, message = "full name must be between 1 and 255 characters"))]
    pub full_name: Option<String>,
    #[validate(
        email(message = "please provide a valid email"),
        length(max = 255, message = "email must be at most 255 characters")
    )]
    pub email: Option<String>,
}

#[derive(Deserialize, Validate)]
pub struct UpdatePasswordRequest {
    pub current_password: String,
    #[validate(length(min = 6, message = "password must be at least 6 characters"))]
    pub new_password: String,
}

fn invalid_credentials() -> AppError {
    AppError::unauthorized_with("invalid credentials")
}

/// Issues an access token plus a fresh refresh token and returns the
/// `Set-Cookie` header carrying the latter.
fn issue_tokens(
    state: &AppState,
    conn: &mut PgConnection,
    user: User,
) -> AppResult<(HeaderMap, TokenResponse)> {
    let token = state.jwt.issue(&user)?;

    let now = Utc::now();
    let refresh_value = generate_refresh_token();
    let refresh_expires_at = now + ChronoDuration::days(state.config.refresh_token_expiry_days);

    let new_refresh = NewRefreshToken {
        id: Uuid::new_v4(),
        user_id: user.id,
        token_hash: hash_refresh_token(&refresh_value),
        issued_at: now.naive_utc(),
        expires_at: refresh_expires_at.naive_utc(),
    };

    diesel::insert_into(refresh_tokens::table)
        .values(&new_refresh)
        .execute(conn)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        build_refresh_cookie(state, &refresh_value, refresh_expires_at)?,
    );

    Ok((
        headers,
        TokenResponse {
            token,
            token_type: "Bearer".to_string(),
            expires_in: state.jwt.expires_in_seconds(),
            user: user.into(),
        },
    ))
}

fn revoke_refresh_tokens(conn: &mut PgConnection, user_id: Uuid) -> QueryResult<usize> {
    let now = Utc::now().naive_utc();
    diesel::update(
        refresh_tokens::table
            .filter(refresh_tokens::user_id.eq(user_id))
            .filter(refresh_tokens::revoked_at.is_null()),
    )
    .set((
        refresh_tokens::revoked_at.eq(now),
        refresh_tokens::updated_at.eq(now),
    ))
    .execute(conn)
}

pub async fn login(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<LoginRequest>,
) -> AppResult<(HeaderMap, Json<ApiResponse<TokenResponse>>)> {
    let username = payload.username.trim();
    if username.is_empty() || payload.password.is_empty() {
        return Err(AppError::bad_request("please provide username and password"));
    }

    let mut conn = state.db()?;

    let user: User = users::table
        .filter(users::username.eq(username))
        .first(&mut conn)
        .optional()?
        .ok_or_else(invalid_credentials)?;

    let valid = password::verify_password(&payload.password, &user.password_hash)
        .map_err(|_| invalid_credentials())?;
    if !valid {
        return Err(invalid_credentials());
    }

    if !user.is_active {
        return Err(AppError::unauthorized_with("account is inactive"));
    }

    let now = Utc::now().naive_utc();
    diesel::update(users::table.find(user.id))
        .set(users::last_login_at.eq(Some(now)))
        .execute(&mut conn)?;
    let user: User = users::table.find(user.id).first(&mut conn)?;

    info!(user_id = %user.id, role = %user.role, "user logged in");

    let (headers, body) = issue_tokens(&state, &mut conn, user)?;
    Ok((headers, Json(ApiResponse::ok(body))))
}

pub async fn refresh(
    State(state): State<AppState>,
    jar: Option<TypedHeader<Cookie>>,
) -> AppResult<(HeaderMap, Json<ApiResponse<TokenResponse>>)> {
    let cookies = jar.ok_or_else(AppError::unauthorized)?;
    let refresh_value = cookies
        .get(REFRESH_COOKIE_NAME)
        .ok_or_else(AppError::unauthorized)?;

    let hashed = hash_refresh_token(refresh_value);
    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();

    let token: RefreshToken = refresh_tokens::table
        .filter(refresh_tokens::token_hash.eq(&hashed))
        .filter(refresh_tokens::revoked_at.is_null())
        .filter(refresh_tokens::expires_at.gt(now))
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::unauthorized)?;

    diesel::update(refresh_tokens::table.find(token.id))
        .set((
            refresh_tokens::revoked_at.eq(now),
            refresh_tokens::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

    let user: User = users::table
        .find(token.user_id)
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| AppError::unauthorized_with("user no longer exists"))?;
    if !user.is_active {
        return Err(AppError::unauthorized_with("account is inactive"));
    }

    let (headers, body) = issue_tokens(&state, &mut conn, user)?;
    Ok((headers, Json(ApiResponse::ok(body))))
}

pub async fn logout(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<(HeaderMap, Json<ApiResponse<Empty>>)> {
    let mut conn = state.db()?;
    let revoked = revoke_refresh_tokens(&mut conn, user.user_id)?;
    info!(user_id = %user.user_id, revoked, "user logged out");

    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, build_clear_refresh_cookie(&state)?);
    Ok((headers, Json(ApiResponse::message("logged out"))))
}

pub async fn me(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<ApiResponse<ProfileResponse>>> {
    let mut conn = state.db()?;
    let found: User = users::table.find(user.user_id).first(&mut conn)?;
    Ok(Json(ApiResponse::ok(ProfileResponse {
        user: found.into(),
        permissions: user.role.permissions(),
    })))
}

pub async fn update_details(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiJson(mut payload): ApiJson<UpdateDetailsRequest>,
) -> AppResult<Json<ApiResponse<UserResponse>>> {
    payload.full_name.iter_mut().for_each(trim_in_place);
    payload.email.iter_mut().for_each(normalise_email);
    payload.validate()?;

    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();
    diesel::update(users::table.find(user.user_id))
        .set((
            payload.full_name.map(|value| users::full_name.eq(value)),
            payload.email.map(|value| users::email.eq(value)),
            users::updated_at.eq(now),
        ))
        .execute(&mut conn)?;

    let updated: User = users::table.find(user.user_id).first(&mut conn)?;
    Ok(Json(ApiResponse::with_message("details updated", updated.into())))
}

pub async fn update_password(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiJson(payload): ApiJson<UpdatePasswordRequest>,
) -> AppResult<(HeaderMap, Json<ApiResponse<TokenResponse>>)> {
    payload.validate()?;

    let mut conn = state.db()?;
    let found: User = users::table.find(user.user_id).first(&mut conn)?;

    let matches = password::verify_password(&payload.current_password, &found.password_hash)?;
    if !matches {
        return Err(AppError::unauthorized_with("current password is incorrect"));
    }

    let new_hash = password::hash_password(&payload.new_password)?;
    let now = Utc::now().naive_utc();
    let updated = conn.transaction::<User, AppError, _>(|conn| {
        diesel::update(users::table.find(user.user_id))
            .set((users::password_hash.eq(new_hash), users::updated_at.eq(now)))
            .execute(conn)?;
        revoke_refresh_tokens(conn, user.user_id)?;
        Ok(users::table.find(user.user_id).first(conn)?)
    })?;

    info!(user_id = %user.user_id, "password changed");

    let (headers, body) = issue_tokens(&state, &mut conn, updated)?;
    Ok((
        headers,
        Json(ApiResponse::with_message("password updated", body)),
    ))
}

fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn cookie_header(state: &AppState, mut parts: Vec<String>) -> AppResult<HeaderValue> {
    parts.push("Path=/".into());
    parts.push("HttpOnly".into());
    parts.push("SameSite=Strict".into());
    if state.config.refresh_cookie_secure {
        parts.push("Secure".into());
    }
    if let Some(domain) = &state.config.refresh_cookie_domain {
        parts.push(format!("Domain={domain}"));
    }
    HeaderValue::from_str(&parts.join("; "))
        .map_err(|err| AppError::internal(format!("invalid refresh cookie: {err}")))
}

fn build_refresh_cookie(
    state: &AppState,
    token: &str,
    expires_at: chrono::DateTime<Utc>,
) -> AppResult<HeaderValue> {
    let max_age = ChronoDuration::days(state.config.refresh_token_expiry_days).num_seconds();
    cookie_header(
        state,
        vec![
            format!("{REFRESH_COOKIE_NAME}={token}"),
            format!("Max-Age={max_age}"),
            format!("Expires={}", expires_at.to_rfc2822()),
        ],
    )
}

fn build_clear_refresh_cookie(state: &AppState) -> AppResult<HeaderValue> {
    cookie_header(
        state,
        vec![
            format!("{REFRESH_COOKIE_NAME}="),
            "Max-Age=0".into(),
            "Expires=Thu, 01 Jan 1970 00:00:00 GMT".into(),
        ],
    )
}
