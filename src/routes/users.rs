use std::collections::HashMap;

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use diesel::{pg::Pg, prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::auth::{password, AuthenticatedUser, Permission, Role};
use crate::error::{AppError, AppResult};
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::models::{NewUser, User};
use crate::schema::{refresh_tokens, users};
use crate::state::AppState;
use crate::utils::response::{ApiResponse, PageRequest, DEFAULT_PAGE_SIZE};
use crate::utils::search::contains_pattern;

use super::to_iso;

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub role: String,
    pub is_active: bool,
    pub last_login_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            full_name: user.full_name,
            role: user.role,
            is_active: user.is_active,
            last_login_at: user.last_login_at.map(to_iso),
            created_at: to_iso(user.created_at),
            updated_at: to_iso(user.updated_at),
        }
    }
}

/// The slice of a user embedded in other resources.
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
}

pub(crate) fn load_user_summaries(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> QueryResult<HashMap<Uuid, UserSummary>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<(Uuid, String, String)> = users::table
        .filter(users::id.eq_any(ids))
        .select((users::id, users::username, users::full_name))
        .load(conn)?;
    Ok(rows
        .into_iter()
        .map(|(id, username, full_name)| {
            (
                id,
                UserSummary {
                    id,
                    username,
                    full_name,
                },
            )
        })
        .collect())
}

pub(crate) fn normalise_email(email: &mut String) {
    *email = email.trim().to_lowercase();
}

pub(crate) fn trim_in_place(value: &mut String) {
    *value = value.trim().to_string();
}

fn parse_role(value: &str) -> AppResult<Role> {
    value.trim().parse::<Role>().map_err(AppError::bad_request)
}

#[derive(Deserialize)]
pub struct UserListQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub role: Option<String>,
    pub search: Option<String>,
}

#[derive(Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(length(min = 3, max = 100, message = "username must be between 3 and 100 characters"))]
    pub username: String,
    #[validate(
        email(message = "please provide a valid email"),
        length(max = 255, message = "email must be at most 255 characters")
    )]
    pub email: String,
    #[validate(length(min = 6, message = "password must be at least 6 characters"))]
    pub password: String,
    #[validate(length(min = 1, max = 255, message = "full name must be between 1 and 255 characters"))]
    pub full_name: String,
    pub role: Option<String>,
    pub is_active: Option<bool>,
}

impl CreateUserRequest {
    fn normalise(&mut self) {
        trim_in_place(&mut self.username);
        normalise_email(&mut self.email);
        trim_in_place(&mut self.full_name);
    }
}

#[derive(Deserialize, Validate)]
pub struct UpdateUserRequest {
    #[validate(length(min = 3, max = 100, message = "username must be between 3 and 100 characters"))]
    pub username: Option<String>,
    #[validate(
        email(message = "please provide a valid email"),
        length(max = 255, message = "email must be at most 255 characters")
    )]
    pub email: Option<String>,
    #[validate(length(min = 1, max = 255, message = "full name must be between 1 and 255 characters"))]
    pub full_name: Option<String>,
    pub role: Option<String>,
    pub is_active: Option<bool>,
    #[validate(length(min = 6, message = "password must be at least 6 characters"))]
    pub password: Option<String>,
}

impl UpdateUserRequest {
    fn normalise(&mut self) {
        self.username.iter_mut().for_each(trim_in_place);
        self.email.iter_mut().for_each(normalise_email);
        self.full_name.iter_mut().for_each(trim_in_place);
    }
}

#[derive(AsChangeset, Default)]
#[diesel(table_name = users)]
struct UserChangeset {
    username: Option<String>,
    email: Option<String>,
    full_name: Option<String>,
    role: Option<String>,
    password_hash: Option<String>,
    updated_at: Option<chrono::NaiveDateTime>,
}

fn filtered_users(role: Option<Role>, pattern: Option<&str>) -> users::BoxedQuery<'static, Pg> {
    let mut query = users::table.into_boxed();
    if let Some(role) = role {
        query = query.filter(users::role.eq(role.as_str()));
    }
    if let Some(pattern) = pattern {
        query = query.filter(
            users::username
                .ilike(pattern.to_string())
                .or(users::full_name.ilike(pattern.to_string()))
                .or(users::email.ilike(pattern.to_string())),
        );
    }
    query
}

pub async fn list_users(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiQuery(query): ApiQuery<UserListQuery>,
) -> AppResult<Json<ApiResponse<Vec<UserResponse>>>> {
    user.require(Permission::ManageUsers)?;

    let page = PageRequest {
        page: query.page,
        limit: query.limit,
    }
    .resolve(DEFAULT_PAGE_SIZE)?;

    let role = query.role.as_deref().map(parse_role).transpose()?;
    let search = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(contains_pattern);

    let mut conn = state.db()?;
    let total: i64 = filtered_users(role, search.as_deref())
        .count()
        .get_result(&mut conn)?;
    let rows: Vec<User> = filtered_users(role, search.as_deref())
        .order(users::created_at.desc())
        .limit(page.limit)
        .offset(page.offset())
        .load(&mut conn)?;

    let data: Vec<UserResponse> = rows.into_iter().map(UserResponse::from).collect();
    let count = data.len();
    Ok(Json(ApiResponse::ok(data).count(count).page(page.info(total))))
}

pub async fn get_user(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiPath(user_id): ApiPath<Uuid>,
) -> AppResult<Json<ApiResponse<UserResponse>>> {
    user.require(Permission::ManageUsers)?;

    let mut conn = state.db()?;
    let found: User = users::table
        .find(user_id)
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| AppError::missing("user"))?;
    Ok(Json(ApiResponse::ok(found.into())))
}

pub async fn create_user(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiJson(mut payload): ApiJson<CreateUserRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<UserResponse>>)> {
    user.require(Permission::ManageUsers)?;

    payload.normalise();
    payload.validate()?;
    let role = match payload.role.as_deref() {
        Some(value) => parse_role(value)?,
        None => Role::DataEntry,
    };

    let new_user = NewUser {
        id: Uuid::new_v4(),
        username: payload.username,
        email: payload.email,
        password_hash: password::hash_password(&payload.password)?,
        full_name: payload.full_name,
        role: role.as_str().to_string(),
        is_active: payload.is_active.unwrap_or(true),
    };

    let mut conn = state.db()?;
    diesel::insert_into(users::table)
        .values(&new_user)
        .execute(&mut conn)?;
    let created: User = users::table.find(new_user.id).first(&mut conn)?;

    info!(user_id = %created.id, role = %created.role, created_by = %user.user_id, "user created");

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::with_message("user created", created.into())),
    ))
}

pub async fn update_user(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiPath(user_id): ApiPath<Uuid>,
    ApiJson(mut payload): ApiJson<UpdateUserRequest>,
) -> AppResult<Json<ApiResponse<UserResponse>>> {
    user.require(Permission::ManageUsers)?;

    if user_id == user.user_id && payload.is_active == Some(false) {
        return Err(AppError::bad_request("you cannot deactivate your own account"));
    }

    payload.normalise();
    payload.validate()?;

    let mut changeset = UserChangeset {
        username: payload.username,
        email: payload.email,
        full_name: payload.full_name,
        role: payload
            .role
            .as_deref()
            .map(parse_role)
            .transpose()?
            .map(|role| role.as_str().to_string()),
        updated_at: Some(Utc::now().naive_utc()),
        ..Default::default()
    };
    if let Some(new_password) = payload.password.as_deref() {
        changeset.password_hash = Some(password::hash_password(new_password)?);
    }

    let mut conn = state.db()?;
    let found = conn.transaction::<User, AppError, _>(|conn| {
        let updated = diesel::update(users::table.find(user_id))
            .set(&changeset)
            .execute(conn)?;
        if updated == 0 {
            return Err(AppError::missing("user"));
        }
        match payload.is_active {
            Some(active) => set_active(conn, user_id, active),
            None => Ok(users::table.find(user_id).first(conn)?),
        }
    })?;

    Ok(Json(ApiResponse::with_message("user updated", found.into())))
}

/// Flips `is_active`; deactivation also revokes every live refresh token.
fn set_active(conn: &mut PgConnection, user_id: Uuid, active: bool) -> AppResult<User> {
    let now = Utc::now().naive_utc();
    conn.transaction::<User, AppError, _>(|conn| {
        let updated = diesel::update(users::table.find(user_id))
            .set((users::is_active.eq(active), users::updated_at.eq(now)))
            .execute(conn)?;
        if updated == 0 {
            return Err(AppError::missing("user"));
        }
        if !active {
            diesel::update(
                refresh_tokens::table
                    .filter(refresh_tokens::user_id.eq(user_id))
                    .filter(refresh_tokens::revoked_at.is_null()),
            )
            .set((
                refresh_tokens::revoked_at.eq(now),
                refresh_tokens::updated_at.eq(now),
            ))
            .execute(conn)?;
        }
        Ok(users::table.find(user_id).first(conn)?)
    })
}

/// Users are never removed; deleting one deactivates the account.
pub async fn delete_user(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiPath(user_id): ApiPath<Uuid>,
) -> AppResult<Json<ApiResponse<UserResponse>>> {
    user.require(Permission::ManageUsers)?;

    if user_id == user.user_id {
        return Err(AppError::bad_request("you cannot deactivate your own account"));
    }

    let mut conn = state.db()?;
    let deactivated = set_active(&mut conn, user_id, false)?;
    info!(user_id = %user_id, by = %user.user_id, "user deactivated");
    Ok(Json(ApiResponse::with_message(
        "user deactivated",
        deactivated.into(),
    )))
}

pub async fn toggle_user_active(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiPath(user_id): ApiPath<Uuid>,
) -> AppResult<Json<ApiResponse<UserResponse>>> {
    user.require(Permission::ManageUsers)?;

    if user_id == user.user_id {
        return Err(AppError::bad_request("you cannot deactivate your own account"));
    }

    let mut conn = state.db()?;
    let current: bool = users::table
        .find(user_id)
        .select(users::is_active)
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| AppError::missing("user"))?;

    let toggled = set_active(&mut conn, user_id, !current)?;
    let message = if toggled.is_active {
        "user activated"
    } else {
        "user deactivated"
    };
    Ok(Json(ApiResponse::with_message(message, toggled.into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_request(username: &str, email: &str) -> CreateUserRequest {
        CreateUserRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: "secret-pass".to_string(),
            full_name: " Records Clerk ".to_string(),
            role: None,
            is_active: None,
        }
    }

    #[test]
    fn emails_are_normalised_and_checked() {
        let mut request = create_request("clerk", " Clerk@Ministry.GOV ");
        request.normalise();
        assert!(request.validate().is_ok());
        assert_eq!(request.email, "clerk@ministry.gov");
        assert_eq!(request.full_name, "Records Clerk");

        for bad in ["", "clerk", "@ministry.gov", "clerk@", "a b@c.d", "a@b.c."] {
            let mut request = create_request("clerk", bad);
            request.normalise();
            let err = AppError::from(request.validate().unwrap_err());
            assert_eq!(err.status(), StatusCode::BAD_REQUEST, "{bad} should be rejected");
            assert_eq!(err.message(), "please provide a valid email");
        }
    }

    #[test]
    fn username_length_is_bounded() {
        let mut short = create_request(" ab ", "clerk@ministry.gov");
        short.normalise();
        assert!(short.validate().is_err());

        let mut long = create_request(&"u".repeat(101), "clerk@ministry.gov");
        long.normalise();
        let err = AppError::from(long.validate().unwrap_err());
        assert_eq!(err.message(), "username must be between 3 and 100 characters");

        let mut trimmed = create_request(" abc ", "clerk@ministry.gov");
        trimmed.normalise();
        assert!(trimmed.validate().is_ok());
        assert_eq!(trimmed.username, "abc");
    }

    #[test]
    fn partial_updates_only_check_sent_fields() {
        let mut update = UpdateUserRequest {
            username: None,
            email: Some(" Archive@Ministry.gov".to_string()),
            full_name: None,
            role: None,
            is_active: Some(false),
            password: None,
        };
        update.normalise();
        assert!(update.validate().is_ok());
        assert_eq!(update.email.as_deref(), Some("archive@ministry.gov"));

        update.password = Some("short".to_string());
        assert!(update.validate().is_err());
    }
}
