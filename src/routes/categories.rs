use std::collections::HashMap;

use axum::{extract::State, http::StatusCode, Json};
use chrono::{NaiveDateTime, Utc};
use diesel::{dsl::count_star, prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::auth::{AuthenticatedUser, Permission};
use crate::error::{AppError, AppResult};
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::models::{Category, NewCategory};
use crate::schema::{categories, documents};
use crate::state::AppState;
use crate::utils::json::{non_blank, nullable};
use crate::utils::response::{ApiResponse, Empty};

use super::to_iso;
use super::users::{load_user_summaries, UserSummary};

const MAX_NAME_LENGTH: usize = 255;

#[derive(Debug, Clone, Serialize)]
pub struct CategorySummary {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct CategoryResponse {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    pub parent: Option<CategorySummary>,
    pub is_active: bool,
    pub created_by: Option<UserSummary>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcategories: Option<Vec<CategoryResponse>>,
}

#[derive(Deserialize)]
pub struct CategoryListQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Deserialize)]
pub struct CreateCategoryRequest {
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    pub is_active: Option<bool>,
}

#[derive(Deserialize)]
pub struct UpdateCategoryRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub parent_id: Option<Option<Uuid>>,
    pub is_active: Option<bool>,
}

#[derive(AsChangeset, Default)]
#[diesel(table_name = categories)]
struct CategoryChangeset {
    name: Option<String>,
    description: Option<Option<String>>,
    parent_id: Option<Option<Uuid>>,
    is_active: Option<bool>,
    updated_at: Option<NaiveDateTime>,
}

pub(crate) fn load_category_summaries(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> QueryResult<HashMap<Uuid, CategorySummary>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<(Uuid, String)> = categories::table
        .filter(categories::id.eq_any(ids))
        .select((categories::id, categories::name))
        .load(conn)?;
    Ok(rows
        .into_iter()
        .map(|(id, name)| (id, CategorySummary { id, name }))
        .collect())
}

/// Builds responses with parent and creator summaries resolved in two
/// batched lookups.
fn to_responses(
    conn: &mut PgConnection,
    rows: Vec<Category>,
) -> QueryResult<Vec<CategoryResponse>> {
    let mut parent_ids: Vec<Uuid> = rows.iter().filter_map(|c| c.parent_id).collect();
    parent_ids.sort();
    parent_ids.dedup();
    let mut creator_ids: Vec<Uuid> = rows.iter().map(|c| c.created_by).collect();
    creator_ids.sort();
    creator_ids.dedup();

    let parents = load_category_summaries(conn, &parent_ids)?;
    let creators = load_user_summaries(conn, &creator_ids)?;

    Ok(rows
        .into_iter()
        .map(|category| CategoryResponse {
            id: category.id,
            name: category.name,
            description: category.description,
            parent_id: category.parent_id,
            parent: category.parent_id.and_then(|id| parents.get(&id).cloned()),
            is_active: category.is_active,
            created_by: creators.get(&category.created_by).cloned(),
            created_at: to_iso(category.created_at),
            updated_at: to_iso(category.updated_at),
            subcategories: None,
        })
        .collect())
}

fn to_response(conn: &mut PgConnection, category: Category) -> QueryResult<CategoryResponse> {
    let mut responses = to_responses(conn, vec![category])?;
    responses.pop().ok_or(diesel::result::Error::NotFound)
}

fn find_category(conn: &mut PgConnection, category_id: Uuid) -> AppResult<Category> {
    categories::table
        .find(category_id)
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::missing("category"))
}

/// Categories nest one level deep: a parent must exist, be top-level and
/// differ from the category being placed under it.
fn validate_parent(
    conn: &mut PgConnection,
    parent_id: Uuid,
    category_id: Option<Uuid>,
) -> AppResult<()> {
    if Some(parent_id) == category_id {
        return Err(AppError::bad_request("a category cannot be its own parent"));
    }

    let parent: Category = categories::table
        .find(parent_id)
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::bad_request("parent category does not exist"))?;
    if parent.parent_id.is_some() {
        return Err(AppError::bad_request(
            "parent category must be a top-level category",
        ));
    }

    if let Some(category_id) = category_id {
        let children: i64 = categories::table
            .filter(categories::parent_id.eq(category_id))
            .select(count_star())
            .first(conn)?;
        if children > 0 {
            return Err(AppError::bad_request(
                "a category with subcategories cannot become a subcategory",
            ));
        }
    }
    Ok(())
}

fn validate_name(name: &str) -> AppResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_LENGTH {
        return Err(AppError::bad_request(format!(
            "name must be at most {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Documents filed under the category, either as main category or subcategory.
fn referencing_documents(conn: &mut PgConnection, category_id: Uuid) -> QueryResult<i64> {
    documents::table
        .filter(
            documents::category_id
                .eq(category_id)
                .or(documents::subcategory_id.eq(category_id)),
        )
        .select(count_star())
        .first(conn)
}

pub async fn list_categories(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<CategoryListQuery>,
) -> AppResult<Json<ApiResponse<Vec<CategoryResponse>>>> {
    let mut conn = state.db()?;

    let mut listing = categories::table.into_boxed();
    if !query.include_inactive {
        listing = listing.filter(categories::is_active.eq(true));
    }
    let rows: Vec<Category> = listing.order(categories::name.asc()).load(&mut conn)?;

    let data = to_responses(&mut conn, rows)?;
    let count = data.len();
    Ok(Json(ApiResponse::ok(data).count(count)))
}

pub async fn category_tree(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<CategoryResponse>>>> {
    let mut conn = state.db()?;

    let rows: Vec<Category> = categories::table
        .filter(categories::is_active.eq(true))
        .order(categories::name.asc())
        .load(&mut conn)?;

    let (top_level, children): (Vec<Category>, Vec<Category>) =
        rows.into_iter().partition(|c| c.parent_id.is_none());

    let mut by_parent: HashMap<Uuid, Vec<CategoryResponse>> = HashMap::new();
    for child in to_responses(&mut conn, children)? {
        if let Some(parent_id) = child.parent_id {
            by_parent.entry(parent_id).or_default().push(child);
        }
    }

    let tree: Vec<CategoryResponse> = to_responses(&mut conn, top_level)?
        .into_iter()
        .map(|mut category| {
            category.subcategories = Some(by_parent.remove(&category.id).unwrap_or_default());
            category
        })
        .collect();

    let count = tree.len();
    Ok(Json(ApiResponse::ok(tree).count(count)))
}

pub async fn get_category(
    State(state): State<AppState>,
    ApiPath(category_id): ApiPath<Uuid>,
) -> AppResult<Json<ApiResponse<CategoryResponse>>> {
    let mut conn = state.db()?;
    let category = find_category(&mut conn, category_id)?;
    let top_level = category.parent_id.is_none();
    let mut response = to_response(&mut conn, category)?;

    if top_level {
        let children: Vec<Category> = categories::table
            .filter(categories::parent_id.eq(category_id))
            .order(categories::name.asc())
            .load(&mut conn)?;
        response.subcategories = Some(to_responses(&mut conn, children)?);
    }

    Ok(Json(ApiResponse::ok(response)))
}

pub async fn create_category(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiJson(payload): ApiJson<CreateCategoryRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<CategoryResponse>>)> {
    user.require(Permission::ManageCategories)?;

    let name = validate_name(&payload.name)?;
    let mut conn = state.db()?;
    if let Some(parent_id) = payload.parent_id {
        validate_parent(&mut conn, parent_id, None)?;
    }

    let new_category = NewCategory {
        id: Uuid::new_v4(),
        name,
        description: non_blank(payload.description),
        parent_id: payload.parent_id,
        is_active: payload.is_active.unwrap_or(true),
        created_by: user.user_id,
    };

    diesel::insert_into(categories::table)
        .values(&new_category)
        .execute(&mut conn)?;

    let category = find_category(&mut conn, new_category.id)?;
    info!(category_id = %category.id, name = %category.name, "category created");

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::with_message(
            "category created",
            to_response(&mut conn, category)?,
        )),
    ))
}

pub async fn update_category(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiPath(category_id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<UpdateCategoryRequest>,
) -> AppResult<Json<ApiResponse<CategoryResponse>>> {
    user.require(Permission::ManageCategories)?;

    let mut conn = state.db()?;
    let existing = find_category(&mut conn, category_id)?;

    if let Some(parent_id) = payload.parent_id {
        if parent_id != existing.parent_id {
            let referencing = referencing_documents(&mut conn, category_id)?;
            if referencing > 0 {
                return Err(AppError::bad_request(format!(
                    "cannot change parent: category is used by {referencing} documents"
                )));
            }
        }
        if let Some(parent_id) = parent_id {
            validate_parent(&mut conn, parent_id, Some(category_id))?;
        }
    }

    let changeset = CategoryChangeset {
        name: payload.name.as_deref().map(validate_name).transpose()?,
        description: payload.description.map(non_blank),
        parent_id: payload.parent_id,
        is_active: payload.is_active,
        updated_at: Some(Utc::now().naive_utc()),
    };

    diesel::update(categories::table.find(category_id))
        .set(&changeset)
        .execute(&mut conn)?;

    let category = find_category(&mut conn, category_id)?;
    Ok(Json(ApiResponse::with_message(
        "category updated",
        to_response(&mut conn, category)?,
    )))
}

pub async fn delete_category(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiPath(category_id): ApiPath<Uuid>,
) -> AppResult<Json<ApiResponse<Empty>>> {
    user.require(Permission::ManageCategories)?;

    let mut conn = state.db()?;
    find_category(&mut conn, category_id)?;

    let subcategories: i64 = categories::table
        .filter(categories::parent_id.eq(category_id))
        .select(count_star())
        .first(&mut conn)?;
    if subcategories > 0 {
        return Err(AppError::bad_request(format!(
            "cannot delete category: it has {subcategories} subcategories"
        )));
    }

    let referencing = referencing_documents(&mut conn, category_id)?;
    if referencing > 0 {
        return Err(AppError::bad_request(format!(
            "cannot delete category: it is used by {referencing} documents"
        )));
    }

    diesel::delete(categories::table.find(category_id)).execute(&mut conn)?;
    info!(category_id = %category_id, "category deleted");

    Ok(Json(ApiResponse::message("category deleted")))
}

pub async fn toggle_category_active(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiPath(category_id): ApiPath<Uuid>,
) -> AppResult<Json<ApiResponse<CategoryResponse>>> {
    user.require(Permission::ManageCategories)?;

    let mut conn = state.db()?;
    let category = find_category(&mut conn, category_id)?;

    diesel::update(categories::table.find(category_id))
        .set((
            categories::is_active.eq(!category.is_active),
            categories::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(&mut conn)?;

    let toggled = find_category(&mut conn, category_id)?;
    let message = if toggled.is_active {
        "category activated"
    } else {
        "category deactivated"
    };
    Ok(Json(ApiResponse::with_message(
        message,
        to_response(&mut conn, toggled)?,
    )))
}
