use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub full_name: String,
    pub role: String,
    pub is_active: bool,
    pub last_login_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub full_name: String,
    pub role: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = refresh_tokens)]
#[diesel(belongs_to(User))]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub revoked_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = refresh_tokens)]
pub struct NewRefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = categories)]
pub struct Category {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    pub is_active: bool,
    pub created_by: Uuid,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = categories)]
pub struct NewCategory {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    pub is_active: bool,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = documents)]
pub struct Document {
    pub id: Uuid,
    pub document_number: String,
    pub title: String,
    pub doc_type: String,
    pub category_id: Uuid,
    pub subcategory_id: Option<Uuid>,
    pub issue_date: NaiveDateTime,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub priority: String,
    pub status: String,
    pub tags: Vec<String>,
    pub archive_date: Option<NaiveDateTime>,
    pub archive_reminder_date: Option<NaiveDateTime>,
    pub archived_by: Option<Uuid>,
    pub created_by: Uuid,
    pub last_modified_by: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub document_number: String,
    pub title: String,
    pub doc_type: String,
    pub category_id: Uuid,
    pub subcategory_id: Option<Uuid>,
    pub issue_date: NaiveDateTime,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub priority: String,
    pub status: String,
    pub tags: Vec<String>,
    pub archive_date: Option<NaiveDateTime>,
    pub archive_reminder_date: Option<NaiveDateTime>,
    pub archived_by: Option<Uuid>,
    pub created_by: Uuid,
}

/// Partial document update. `None` leaves a column untouched; nullable
/// columns use `Some(None)` to clear.
#[derive(Debug, Default, AsChangeset)]
#[diesel(table_name = documents)]
pub struct DocumentChangeset {
    pub document_number: Option<String>,
    pub title: Option<String>,
    pub doc_type: Option<String>,
    pub category_id: Option<Uuid>,
    pub subcategory_id: Option<Option<Uuid>>,
    pub issue_date: Option<NaiveDateTime>,
    pub sender: Option<Option<String>>,
    pub recipient: Option<Option<String>>,
    pub subject: Option<Option<String>>,
    pub description: Option<Option<String>>,
    pub priority: Option<String>,
    pub status: Option<String>,
    pub tags: Option<Vec<String>>,
    pub archive_reminder_date: Option<Option<NaiveDateTime>>,
    pub last_modified_by: Option<Option<Uuid>>,
    pub updated_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = document_files)]
#[diesel(belongs_to(Document))]
pub struct DocumentFile {
    pub id: Uuid,
    pub document_id: Uuid,
    pub filename: String,
    pub original_name: String,
    pub storage_key: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub uploaded_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = document_files)]
pub struct NewDocumentFile {
    pub id: Uuid,
    pub document_id: Uuid,
    pub filename: String,
    pub original_name: String,
    pub storage_key: String,
    pub mime_type: String,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = document_notes)]
#[diesel(belongs_to(Document))]
pub struct DocumentNote {
    pub id: Uuid,
    pub document_id: Uuid,
    pub content: String,
    pub created_by: Uuid,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_notes)]
pub struct NewDocumentNote {
    pub id: Uuid,
    pub document_id: Uuid,
    pub content: String,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = notifications)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub related_document_id: Option<Uuid>,
    pub priority: String,
    pub is_read: bool,
    pub read_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = notifications)]
pub struct NewNotification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub related_document_id: Option<Uuid>,
    pub priority: String,
}
