use std::collections::HashMap;

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use diesel::{pg::Pg, prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::auth::{AuthenticatedUser, Permission};
use crate::error::{AppError, AppResult};
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::models::Notification;
use crate::notifications::{self, Broadcast, NotificationKind, NotificationPriority, Recipients};
use crate::schema::{documents, notifications as notification_rows};
use crate::state::AppState;
use crate::utils::json::non_blank;
use crate::utils::response::{ApiResponse, Empty, PageRequest};

use super::to_iso;

const DEFAULT_NOTIFICATION_PAGE_SIZE: i64 = 20;

#[derive(Debug, Clone, Serialize)]
pub struct RelatedDocument {
    pub id: Uuid,
    pub document_number: String,
    pub title: String,
    #[serde(rename = "type")]
    pub doc_type: String,
}

#[derive(Debug, Serialize)]
pub struct NotificationResponse {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub priority: String,
    pub is_read: bool,
    pub read_at: Option<String>,
    pub related_document: Option<RelatedDocument>,
    pub created_at: String,
}

#[derive(Deserialize)]
pub struct NotificationListQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub unread_only: bool,
}

#[derive(Deserialize)]
pub struct CreateNotificationRequest {
    pub recipients: Recipients,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub priority: Option<String>,
    pub related_document: Option<Uuid>,
}

fn to_responses(
    conn: &mut PgConnection,
    rows: Vec<Notification>,
) -> QueryResult<Vec<NotificationResponse>> {
    let mut doc_ids: Vec<Uuid> = rows.iter().filter_map(|n| n.related_document_id).collect();
    doc_ids.sort();
    doc_ids.dedup();

    let related: HashMap<Uuid, RelatedDocument> = if doc_ids.is_empty() {
        HashMap::new()
    } else {
        documents::table
            .filter(documents::id.eq_any(&doc_ids))
            .select((
                documents::id,
                documents::document_number,
                documents::title,
                documents::doc_type,
            ))
            .load::<(Uuid, String, String, String)>(conn)?
            .into_iter()
            .map(|(id, document_number, title, doc_type)| {
                (
                    id,
                    RelatedDocument {
                        id,
                        document_number,
                        title,
                        doc_type,
                    },
                )
            })
            .collect()
    };

    Ok(rows
        .into_iter()
        .map(|n| NotificationResponse {
            id: n.id,
            kind: n.kind,
            title: n.title,
            message: n.message,
            priority: n.priority,
            is_read: n.is_read,
            read_at: n.read_at.map(to_iso),
            related_document: n
                .related_document_id
                .and_then(|id| related.get(&id).cloned()),
            created_at: to_iso(n.created_at),
        })
        .collect())
}

fn own_notifications(
    recipient_id: Uuid,
    unread_only: bool,
) -> notification_rows::BoxedQuery<'static, Pg> {
    let mut query = notification_rows::table
        .filter(notification_rows::recipient_id.eq(recipient_id))
        .into_boxed();
    if unread_only {
        query = query.filter(notification_rows::is_read.eq(false));
    }
    query
}

pub async fn list_notifications(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiQuery(query): ApiQuery<NotificationListQuery>,
) -> AppResult<Json<ApiResponse<Vec<NotificationResponse>>>> {
    let page = PageRequest {
        page: query.page,
        limit: query.limit,
    }
    .resolve(DEFAULT_NOTIFICATION_PAGE_SIZE)?;

    let mut conn = state.db()?;
    let total: i64 = own_notifications(user.user_id, query.unread_only)
        .count()
        .get_result(&mut conn)?;
    let unread: i64 = own_notifications(user.user_id, true)
        .count()
        .get_result(&mut conn)?;
    let rows: Vec<Notification> = own_notifications(user.user_id, query.unread_only)
        .order((
            notification_rows::created_at.desc(),
            notification_rows::id.desc(),
        ))
        .limit(page.limit)
        .offset(page.offset())
        .load(&mut conn)?;

    let data = to_responses(&mut conn, rows)?;
    let count = data.len();
    let mut info = page.info(total);
    info.unread_count = Some(unread);
    Ok(Json(ApiResponse::ok(data).count(count).page(info)))
}

pub async fn mark_read(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiPath(notification_id): ApiPath<Uuid>,
) -> AppResult<Json<ApiResponse<NotificationResponse>>> {
    let mut conn = state.db()?;

    let updated = diesel::update(
        notification_rows::table
            .filter(notification_rows::id.eq(notification_id))
            .filter(notification_rows::recipient_id.eq(user.user_id)),
    )
    .set((
        notification_rows::is_read.eq(true),
        notification_rows::read_at.eq(Some(Utc::now().naive_utc())),
    ))
    .execute(&mut conn)?;
    if updated == 0 {
        return Err(AppError::missing("notification"));
    }

    let row: Notification = notification_rows::table
        .find(notification_id)
        .first(&mut conn)?;
    let response = to_responses(&mut conn, vec![row])?
        .pop()
        .ok_or_else(|| AppError::missing("notification"))?;
    Ok(Json(ApiResponse::with_message("notification updated", response)))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<ApiResponse<Empty>>> {
    let mut conn = state.db()?;
    let updated = notifications::mark_all_read(&mut conn, user.user_id)?;
    Ok(Json(
        ApiResponse::message("all notifications marked as read").count(updated),
    ))
}

pub async fn clear_read(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<ApiResponse<Empty>>> {
    let mut conn = state.db()?;
    let deleted = notifications::clear_read(&mut conn, user.user_id)?;
    Ok(Json(
        ApiResponse::message("read notifications deleted").count(deleted),
    ))
}

pub async fn delete_notification(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiPath(notification_id): ApiPath<Uuid>,
) -> AppResult<Json<ApiResponse<Empty>>> {
    let mut conn = state.db()?;
    let deleted = diesel::delete(
        notification_rows::table
            .filter(notification_rows::id.eq(notification_id))
            .filter(notification_rows::recipient_id.eq(user.user_id)),
    )
    .execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::missing("notification"));
    }
    Ok(Json(ApiResponse::message("notification deleted")))
}

pub async fn create_notification(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiJson(payload): ApiJson<CreateNotificationRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<Empty>>)> {
    user.require(Permission::ManageUsers)?;

    let title = non_blank(Some(payload.title))
        .ok_or_else(|| AppError::bad_request("title is required"))?;
    let message = non_blank(Some(payload.message))
        .ok_or_else(|| AppError::bad_request("message is required"))?;
    let kind = match non_blank(payload.kind) {
        Some(value) => value.parse::<NotificationKind>()?,
        None => NotificationKind::System,
    };
    let priority = match non_blank(payload.priority) {
        Some(value) => value.parse::<NotificationPriority>()?,
        None => NotificationPriority::Medium,
    };

    let mut conn = state.db()?;
    if let Some(document_id) = payload.related_document {
        let exists: Option<Uuid> = documents::table
            .find(document_id)
            .select(documents::id)
            .first(&mut conn)
            .optional()?;
        if exists.is_none() {
            return Err(AppError::bad_request("related document does not exist"));
        }
    }

    let broadcast = Broadcast {
        kind,
        title,
        message,
        priority,
        related_document_id: payload.related_document,
    };
    let count = notifications::broadcast(&mut conn, &payload.recipients, &broadcast)?;
    info!(sent_by = %user.user_id, recipients = count, kind = kind.as_str(), "notifications sent");

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::message("notifications sent").count(count)),
    ))
}
