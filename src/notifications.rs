use std::str::FromStr;

use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::archive::Priority;
use crate::error::AppError;
use crate::models::{Document, NewNotification};
use crate::schema::{notifications, users};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewDocument,
    DocumentUpdate,
    System,
    Reminder,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::NewDocument => "new_document",
            NotificationKind::DocumentUpdate => "document_update",
            NotificationKind::System => "system",
            NotificationKind::Reminder => "reminder",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = NotificationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "new_document" => Ok(NotificationKind::NewDocument),
            "document_update" => Ok(NotificationKind::DocumentUpdate),
            "system" => Ok(NotificationKind::System),
            "reminder" => Ok(NotificationKind::Reminder),
            other => Err(NotificationError::InvalidKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
}

impl NotificationPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationPriority::Low => "low",
            NotificationPriority::Medium => "medium",
            NotificationPriority::High => "high",
        }
    }

    /// Urgent documents raise a high-priority notification; everything else
    /// is medium.
    pub fn for_document(priority: Priority) -> Self {
        match priority {
            Priority::Urgent => NotificationPriority::High,
            _ => NotificationPriority::Medium,
        }
    }
}

impl FromStr for NotificationPriority {
    type Err = NotificationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "low" => Ok(NotificationPriority::Low),
            "medium" => Ok(NotificationPriority::Medium),
            "high" => Ok(NotificationPriority::High),
            other => Err(NotificationError::InvalidPriority(other.to_string())),
        }
    }
}

/// Who receives a broadcast: the literal string `"all"` (every active user)
/// or an explicit list of user ids.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Recipients {
    Keyword(String),
    Users(Vec<Uuid>),
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("invalid notification type '{0}'")]
    InvalidKind(String),
    #[error("invalid notification priority '{0}'")]
    InvalidPriority(String),
    #[error("recipients must be \"all\" or a list of user ids")]
    InvalidRecipients,
    #[error("no recipients given")]
    NoRecipients,
    #[error("unknown recipient {0}")]
    UnknownRecipient(Uuid),
}

pub type NotificationResult<T> = Result<T, NotificationError>;

impl From<NotificationError> for AppError {
    fn from(value: NotificationError) -> Self {
        match value {
            NotificationError::Database(err) => AppError::from(err),
            other => AppError::bad_request(other.to_string()),
        }
    }
}

/// Content shared by every recipient of one broadcast.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub related_document_id: Option<Uuid>,
}

fn active_user_ids(conn: &mut PgConnection) -> QueryResult<Vec<Uuid>> {
    users::table
        .filter(users::is_active.eq(true))
        .select(users::id)
        .load(conn)
}

fn insert_for(
    conn: &mut PgConnection,
    recipients: &[Uuid],
    broadcast: &Broadcast,
) -> NotificationResult<usize> {
    if recipients.is_empty() {
        return Ok(0);
    }

    let rows: Vec<NewNotification> = recipients
        .iter()
        .map(|recipient_id| NewNotification {
            id: Uuid::new_v4(),
            recipient_id: *recipient_id,
            kind: broadcast.kind.as_str().to_string(),
            title: broadcast.title.clone(),
            message: broadcast.message.clone(),
            related_document_id: broadcast.related_document_id,
            priority: broadcast.priority.as_str().to_string(),
        })
        .collect();

    let inserted = diesel::insert_into(notifications::table)
        .values(&rows)
        .execute(conn)?;
    Ok(inserted)
}

/// Tells every active user except the creator that a document was registered.
pub fn notify_new_document(
    conn: &mut PgConnection,
    document: &Document,
    priority: Priority,
    creator_id: Uuid,
) -> NotificationResult<usize> {
    let recipients: Vec<Uuid> = active_user_ids(conn)?
        .into_iter()
        .filter(|id| *id != creator_id)
        .collect();

    let broadcast = Broadcast {
        kind: NotificationKind::NewDocument,
        title: "New document".to_string(),
        message: format!("A new document was added: {}", document.title),
        priority: NotificationPriority::for_document(priority),
        related_document_id: Some(document.id),
    };

    let count = insert_for(conn, &recipients, &broadcast)?;
    tracing::debug!(document_id = %document.id, recipients = count, "new document notifications queued");
    Ok(count)
}

/// Delivers an admin-authored notification. Explicit recipients must all
/// exist; `"all"` expands to every active user.
pub fn broadcast(
    conn: &mut PgConnection,
    recipients: &Recipients,
    broadcast: &Broadcast,
) -> NotificationResult<usize> {
    let ids = match recipients {
        Recipients::Keyword(keyword) if keyword == "all" => active_user_ids(conn)?,
        Recipients::Keyword(_) => return Err(NotificationError::InvalidRecipients),
        Recipients::Users(ids) => {
            if ids.is_empty() {
                return Err(NotificationError::NoRecipients);
            }
            let mut unique = ids.clone();
            unique.sort();
            unique.dedup();
            let known: Vec<Uuid> = users::table
                .filter(users::id.eq_any(&unique))
                .select(users::id)
                .load(conn)?;
            if let Some(missing) = unique.iter().find(|id| !known.contains(id)) {
                return Err(NotificationError::UnknownRecipient(*missing));
            }
            unique
        }
    };

    insert_for(conn, &ids, broadcast)
}

pub fn mark_all_read(conn: &mut PgConnection, recipient_id: Uuid) -> NotificationResult<usize> {
    let updated = diesel::update(
        notifications::table
            .filter(notifications::recipient_id.eq(recipient_id))
            .filter(notifications::is_read.eq(false)),
    )
    .set((
        notifications::is_read.eq(true),
        notifications::read_at.eq(Some(Utc::now().naive_utc())),
    ))
    .execute(conn)?;
    Ok(updated)
}

pub fn clear_read(conn: &mut PgConnection, recipient_id: Uuid) -> NotificationResult<usize> {
    let deleted = diesel::delete(
        notifications::table
            .filter(notifications::recipient_id.eq(recipient_id))
            .filter(notifications::is_read.eq(true)),
    )
    .execute(conn)?;
    Ok(deleted)
}
