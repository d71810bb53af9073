pub mod jwt;
pub mod password;
pub mod permissions;

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::User,
    schema::users,
    state::AppState,
};

pub use permissions::{Permission, Role};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
}

impl AuthenticatedUser {
    pub fn require(&self, permission: Permission) -> AppResult<()> {
        if self.role.can(permission) {
            Ok(())
        } else {
            Err(AppError::forbidden(
                "you do not have permission to perform this action",
            ))
        }
    }
}

/// Resolves the bearer token to a live account. Tokens of deleted or
/// deactivated users stop working immediately, not at expiry.
async fn authenticate(parts: &mut Parts, state: &AppState) -> AppResult<AuthenticatedUser> {
    let TypedHeader(Authorization(bearer)) =
        TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
            .await
            .map_err(|_| AppError::unauthorized())?;

    let claims = state.jwt.verify_token(bearer.token())?;

    let mut conn = state.db()?;
    let user: User = users::table
        .find(claims.sub)
        .first(&mut conn)
        .optional()?
        .ok_or_else(|| AppError::unauthorized_with("user no longer exists"))?;

    if !user.is_active {
        return Err(AppError::unauthorized_with("account is inactive"));
    }

    let role = user
        .role
        .parse::<Role>()
        .map_err(|err| AppError::internal(format!("stored role is invalid: {err}")))?;

    Ok(AuthenticatedUser {
        user_id: user.id,
        username: user.username,
        role,
    })
}

/// Guards every protected route and hands the resolved user to handlers
/// through request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let (mut parts, body) = request.into_parts();
    let user = authenticate(&mut parts, &state).await?;
    let mut request = Request::from_parts(parts, body);
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<AuthenticatedUser>() {
            return Ok(user.clone());
        }
        authenticate(parts, state).await
    }
}
