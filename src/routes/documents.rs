use std::{collections::HashMap, path::Path as FsPath};

use axum::{
    extract::{Multipart, State},
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use diesel::{dsl::count_star, pg::Pg, prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::archive::{self, next_document_number, DocumentStatus, DocumentType, Priority};
use crate::auth::{AuthenticatedUser, Permission, Role};
use crate::error::{AppError, AppResult};
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::models::{
    Category, Document, DocumentChangeset, DocumentFile, DocumentNote, NewDocument,
    NewDocumentFile, NewDocumentNote,
};
use crate::notifications;
use crate::schema::{categories, document_files, document_notes, documents};
use crate::state::AppState;
use crate::utils::json::non_blank;
use crate::utils::response::{ApiResponse, Empty, PageRequest, DEFAULT_PAGE_SIZE};
use crate::utils::search::contains_pattern;

use super::categories::{load_category_summaries, CategorySummary};
use super::to_iso;
use super::users::{load_user_summaries, UserSummary};

const RECENT_DOCUMENTS: i64 = 5;
const MAX_TITLE_LENGTH: usize = 500;
const MAX_DOCUMENT_NUMBER_LENGTH: usize = 64;
const ARCHIVIST_VISIBLE_STATUSES: [&str; 2] = ["active", "archived"];

fn attachment_content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            ch if ch.is_ascii() && !ch.is_ascii_control() => ch,
            _ => '_',
        })
        .collect();
    let fallback = if fallback.is_empty() {
        "download".to_string()
    } else {
        fallback
    };

    let encoded =
        percent_encoding::utf8_percent_encode(filename, percent_encoding::NON_ALPHANUMERIC);
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

#[derive(Debug, Serialize)]
pub struct DocumentFileResponse {
    pub id: Uuid,
    pub filename: String,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub uploaded_at: String,
}

impl From<DocumentFile> for DocumentFileResponse {
    fn from(file: DocumentFile) -> Self {
        Self {
            id: file.id,
            filename: file.filename,
            original_name: file.original_name,
            mime_type: file.mime_type,
            size_bytes: file.size_bytes,
            uploaded_at: to_iso(file.uploaded_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NoteResponse {
    pub id: Uuid,
    pub content: String,
    pub created_by: Option<UserSummary>,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub document_number: String,
    pub title: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub category: Option<CategorySummary>,
    pub subcategory: Option<CategorySummary>,
    pub issue_date: String,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub priority: String,
    pub status: String,
    pub tags: Vec<String>,
    pub archive_date: Option<String>,
    pub archive_reminder_date: Option<String>,
    pub archived_by: Option<UserSummary>,
    pub created_by: Option<UserSummary>,
    pub last_modified_by: Option<UserSummary>,
    pub created_at: String,
    pub updated_at: String,
    pub files: Vec<DocumentFileResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<Vec<NoteResponse>>,
}

#[derive(Deserialize)]
pub struct DocumentListQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    #[serde(rename = "type")]
    pub doc_type: Option<String>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub priority: Option<String>,
    pub search: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Deserialize)]
pub struct AddNoteRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct CountBucket {
    pub value: String,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct RecentDocument {
    pub id: Uuid,
    pub document_number: String,
    pub title: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct DocumentStats {
    pub by_status: Vec<CountBucket>,
    pub by_type: Vec<CountBucket>,
    pub by_priority: Vec<CountBucket>,
    pub total: i64,
    pub recent_documents: Vec<RecentDocument>,
}

struct UploadedFile {
    original_name: String,
    content_type: Option<String>,
    bytes: Bytes,
}

/// Text fields and attachments of a multipart document submission.
#[derive(Default)]
struct DocumentForm {
    fields: HashMap<String, String>,
    files: Vec<UploadedFile>,
}

impl DocumentForm {
    fn text(&self, key: &str) -> Option<String> {
        non_blank(self.fields.get(key).cloned())
    }

    /// `None` when the field was not sent, `Some(None)` when it was sent
    /// blank, which clears the column on update.
    fn nullable_text(&self, key: &str) -> Option<Option<String>> {
        self.fields.get(key).map(|value| non_blank(Some(value.clone())))
    }
}

async fn read_document_form(mut multipart: Multipart, max_files: usize) -> AppResult<DocumentForm> {
    let mut form = DocumentForm::default();

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        warn!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "files" {
            let Some(original_name) = field
                .file_name()
                .map(str::to_string)
                .filter(|value| !value.trim().is_empty())
            else {
                continue;
            };
            if form.files.len() >= max_files {
                return Err(AppError::bad_request(format!(
                    "too many files: at most {max_files} per request"
                )));
            }
            let content_type = field.content_type().map(str::to_string);
            let bytes = field.bytes().await.map_err(|err| {
                warn!(error = %err, "failed to read uploaded file");
                AppError::bad_request(format!("failed to read file bytes: {err}"))
            })?;
            form.files.push(UploadedFile {
                original_name,
                content_type,
                bytes,
            });
        } else {
            let value = field.text().await.map_err(|err| {
                AppError::bad_request(format!("invalid value for field '{name}': {err}"))
            })?;
            form.fields.insert(name, value);
        }
    }

    Ok(form)
}

fn parse_uuid_field(value: &str, field: &str) -> AppResult<Uuid> {
    Uuid::parse_str(value.trim())
        .map_err(|_| AppError::bad_request(format!("{field} must be a valid id")))
}

/// Accepts RFC 3339 timestamps, naive timestamps and plain `YYYY-MM-DD`
/// dates. The flag reports whether only a date was given.
fn parse_date_parts(value: &str) -> Option<(NaiveDateTime, bool)> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some((parsed.naive_utc(), false));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some((parsed, false));
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|start| (start, true))
}

fn parse_date(value: &str, field: &str) -> AppResult<NaiveDateTime> {
    parse_date_parts(value)
        .map(|(parsed, _)| parsed)
        .ok_or_else(|| AppError::bad_request(format!("{field} must be a valid date")))
}

/// Upper bound of an inclusive date filter: a bare date covers the whole day.
fn parse_end_date(value: &str) -> AppResult<NaiveDateTime> {
    match parse_date_parts(value) {
        Some((start, true)) => start
            .date()
            .and_hms_micro_opt(23, 59, 59, 999_999)
            .ok_or_else(|| AppError::bad_request("end_date must be a valid date")),
        Some((parsed, false)) => Ok(parsed),
        None => Err(AppError::bad_request("end_date must be a valid date")),
    }
}

/// Tags arrive either as a JSON array or as a comma-separated list.
fn parse_tags(value: &str) -> AppResult<Vec<String>> {
    let trimmed = value.trim();
    let raw: Vec<String> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|err| {
            AppError::bad_request("tags must be a JSON array of strings or a comma-separated list")
                .with_detail(err.to_string())
        })?
    } else {
        trimmed.split(',').map(str::to_string).collect()
    };

    let mut tags: Vec<String> = Vec::new();
    for tag in raw {
        let tag = tag.trim();
        if !tag.is_empty() && !tags.iter().any(|existing| existing == tag) {
            tags.push(tag.to_string());
        }
    }
    Ok(tags)
}

/// Rejects text longer than the column it is stored in.
fn bounded(value: String, field: &str, max: usize) -> AppResult<String> {
    if value.chars().count() > max {
        return Err(AppError::bad_request(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(value)
}

fn parse_choice<T: std::str::FromStr<Err = String>>(value: &str) -> AppResult<T> {
    value.parse::<T>().map_err(AppError::bad_request)
}

/// Status values a create or update request may set. Archiving has its own
/// endpoint so archive metadata stays consistent.
fn editable_status(value: &str) -> AppResult<DocumentStatus> {
    let status: DocumentStatus = parse_choice(value)?;
    if status == DocumentStatus::Archived {
        return Err(AppError::bad_request(
            "status can only be set to active or pending; use the archive endpoint to archive",
        ));
    }
    Ok(status)
}

fn stored_status(document: &Document) -> AppResult<DocumentStatus> {
    document
        .status
        .parse::<DocumentStatus>()
        .map_err(AppError::internal)
}

fn find_document(conn: &mut PgConnection, document_id: Uuid) -> AppResult<Document> {
    documents::table
        .find(document_id)
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::missing("document"))
}

/// A subcategory is only valid together with the category it belongs to.
fn validate_classification(
    conn: &mut PgConnection,
    category_id: Uuid,
    subcategory_id: Option<Uuid>,
) -> AppResult<()> {
    let category: Option<Category> = categories::table.find(category_id).first(conn).optional()?;
    if category.is_none() {
        return Err(AppError::bad_request("category does not exist"));
    }

    if let Some(subcategory_id) = subcategory_id {
        let subcategory: Category = categories::table
            .find(subcategory_id)
            .first(conn)
            .optional()?
            .ok_or_else(|| AppError::bad_request("subcategory does not exist"))?;
        if subcategory.parent_id != Some(category_id) {
            return Err(AppError::bad_request(
                "subcategory does not belong to the selected category",
            ));
        }
    }
    Ok(())
}

fn collect_ids(ids: impl IntoIterator<Item = Uuid>) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = ids.into_iter().collect();
    ids.sort();
    ids.dedup();
    ids
}

pub(crate) fn build_responses(
    conn: &mut PgConnection,
    docs: Vec<Document>,
    include_notes: bool,
) -> QueryResult<Vec<DocumentResponse>> {
    let doc_ids: Vec<Uuid> = docs.iter().map(|doc| doc.id).collect();

    let mut files_by_doc: HashMap<Uuid, Vec<DocumentFileResponse>> = HashMap::new();
    if !doc_ids.is_empty() {
        let files: Vec<DocumentFile> = document_files::table
            .filter(document_files::document_id.eq_any(&doc_ids))
            .order(document_files::uploaded_at.asc())
            .load(conn)?;
        for file in files {
            files_by_doc
                .entry(file.document_id)
                .or_default()
                .push(file.into());
        }
    }

    let notes: Vec<DocumentNote> = if include_notes && !doc_ids.is_empty() {
        document_notes::table
            .filter(document_notes::document_id.eq_any(&doc_ids))
            .order(document_notes::created_at.asc())
            .load(conn)?
    } else {
        Vec::new()
    };

    let category_ids = collect_ids(
        docs.iter()
            .flat_map(|doc| std::iter::once(doc.category_id).chain(doc.subcategory_id)),
    );
    let user_ids = collect_ids(
        docs.iter()
            .flat_map(|doc| {
                [Some(doc.created_by), doc.archived_by, doc.last_modified_by]
                    .into_iter()
                    .flatten()
            })
            .chain(notes.iter().map(|note| note.created_by)),
    );
    let category_map = load_category_summaries(conn, &category_ids)?;
    let user_map = load_user_summaries(conn, &user_ids)?;

    let mut notes_by_doc: HashMap<Uuid, Vec<NoteResponse>> = HashMap::new();
    for note in notes {
        notes_by_doc
            .entry(note.document_id)
            .or_default()
            .push(NoteResponse {
                id: note.id,
                content: note.content,
                created_by: user_map.get(&note.created_by).cloned(),
                created_at: to_iso(note.created_at),
            });
    }

    let user = |id: Option<Uuid>| id.and_then(|id| user_map.get(&id).cloned());

    Ok(docs
        .into_iter()
        .map(|doc| DocumentResponse {
            id: doc.id,
            document_number: doc.document_number,
            title: doc.title,
            doc_type: doc.doc_type,
            category: category_map.get(&doc.category_id).cloned(),
            subcategory: doc
                .subcategory_id
                .and_then(|id| category_map.get(&id).cloned()),
            issue_date: to_iso(doc.issue_date),
            sender: doc.sender,
            recipient: doc.recipient,
            subject: doc.subject,
            description: doc.description,
            priority: doc.priority,
            status: doc.status,
            tags: doc.tags,
            archive_date: doc.archive_date.map(to_iso),
            archive_reminder_date: doc.archive_reminder_date.map(to_iso),
            archived_by: user(doc.archived_by),
            created_by: user(Some(doc.created_by)),
            last_modified_by: user(doc.last_modified_by),
            created_at: to_iso(doc.created_at),
            updated_at: to_iso(doc.updated_at),
            files: files_by_doc.remove(&doc.id).unwrap_or_default(),
            notes: include_notes.then(|| notes_by_doc.remove(&doc.id).unwrap_or_default()),
        })
        .collect())
}

fn load_detail(conn: &mut PgConnection, document_id: Uuid) -> AppResult<DocumentResponse> {
    let document = find_document(conn, document_id)?;
    build_responses(conn, vec![document], true)?
        .pop()
        .ok_or_else(|| AppError::missing("document"))
}

/// Writes uploads under `documents/<document_id>/`. On failure the files
/// already written for this request are removed again.
async fn store_files(
    state: &AppState,
    document_id: Uuid,
    files: Vec<UploadedFile>,
) -> AppResult<Vec<NewDocumentFile>> {
    let mut stored: Vec<NewDocumentFile> = Vec::with_capacity(files.len());

    for file in files {
        let file_id = Uuid::new_v4();
        let extension = FsPath::new(&file.original_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_lowercase()))
            .unwrap_or_default();
        let filename = format!("{file_id}{extension}");
        let storage_key = format!("documents/{document_id}/{filename}");
        let mime_type = file
            .content_type
            .filter(|value| !value.is_empty() && value != "application/octet-stream")
            .unwrap_or_else(|| {
                mime_guess::from_path(&file.original_name)
                    .first_or_octet_stream()
                    .to_string()
            });
        let size_bytes = file.bytes.len() as i64;

        if let Err(err) = state
            .storage
            .put_object(&storage_key, file.bytes.to_vec(), Some(mime_type.clone()))
            .await
        {
            error!(error = %err, key = %storage_key, "failed to store uploaded file");
            let written: Vec<String> = stored.iter().map(|f| f.storage_key.clone()).collect();
            remove_stored_files(state, &written).await;
            return Err(AppError::internal(format!("failed to store file: {err}")));
        }

        stored.push(NewDocumentFile {
            id: file_id,
            document_id,
            filename,
            original_name: file.original_name,
            storage_key,
            mime_type,
            size_bytes,
        });
    }

    Ok(stored)
}

async fn remove_stored_files(state: &AppState, keys: &[String]) {
    for key in keys {
        if let Err(err) = state.storage.delete_object(key).await {
            warn!(key = %key, error = %err, "failed to remove stored file");
        }
    }
}

struct DocumentFilters {
    doc_type: Option<DocumentType>,
    status: Option<DocumentStatus>,
    category: Option<Uuid>,
    subcategory: Option<Uuid>,
    priority: Option<Priority>,
    search: Option<String>,
    issued_from: Option<NaiveDateTime>,
    issued_to: Option<NaiveDateTime>,
    archivist_view: bool,
}

impl DocumentFilters {
    fn from_query(query: &DocumentListQuery, role: Role) -> AppResult<Self> {
        let value = |raw: &Option<String>| non_blank(raw.clone());

        Ok(Self {
            doc_type: value(&query.doc_type)
                .map(|v| parse_choice(&v))
                .transpose()?,
            status: value(&query.status).map(|v| parse_choice(&v)).transpose()?,
            category: value(&query.category)
                .map(|v| parse_uuid_field(&v, "category"))
                .transpose()?,
            subcategory: value(&query.subcategory)
                .map(|v| parse_uuid_field(&v, "subcategory"))
                .transpose()?,
            priority: value(&query.priority)
                .map(|v| parse_choice(&v))
                .transpose()?,
            search: value(&query.search).map(|v| contains_pattern(&v)),
            issued_from: value(&query.start_date)
                .map(|v| parse_date(&v, "start_date"))
                .transpose()?,
            issued_to: value(&query.end_date)
                .map(|v| parse_end_date(&v))
                .transpose()?,
            archivist_view: role == Role::Archivist,
        })
    }

    fn query(&self) -> documents::BoxedQuery<'static, Pg> {
        let mut query = documents::table.into_boxed();

        if let Some(doc_type) = self.doc_type {
            query = query.filter(documents::doc_type.eq(doc_type.as_str()));
        }
        if let Some(status) = self.status {
            query = query.filter(documents::status.eq(status.as_str()));
        }
        if self.archivist_view {
            query = query.filter(documents::status.eq_any(ARCHIVIST_VISIBLE_STATUSES));
        }
        if let Some(category) = self.category {
            query = query.filter(documents::category_id.eq(category));
        }
        if let Some(subcategory) = self.subcategory {
            query = query.filter(documents::subcategory_id.eq(subcategory));
        }
        if let Some(priority) = self.priority {
            query = query.filter(documents::priority.eq(priority.as_str()));
        }
        if let Some(from) = self.issued_from {
            query = query.filter(documents::issue_date.ge(from));
        }
        if let Some(to) = self.issued_to {
            query = query.filter(documents::issue_date.le(to));
        }
        if let Some(pattern) = &self.search {
            query = query.filter(
                documents::title
                    .ilike(pattern.clone())
                    .or(documents::document_number.ilike(pattern.clone()))
                    .or(documents::subject.assume_not_null().ilike(pattern.clone()))
                    .or(documents::description
                        .assume_not_null()
                        .ilike(pattern.clone()))
                    .or(documents::sender.assume_not_null().ilike(pattern.clone()))
                    .or(documents::recipient.assume_not_null().ilike(pattern.clone())),
            );
        }

        query
    }
}

pub async fn list_documents(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiQuery(params): ApiQuery<DocumentListQuery>,
) -> AppResult<Json<ApiResponse<Vec<DocumentResponse>>>> {
    let filters = DocumentFilters::from_query(&params, user.role)?;
    let page = PageRequest {
        page: params.page,
        limit: params.limit,
    }
    .resolve(DEFAULT_PAGE_SIZE)?;

    let mut conn = state.db()?;
    let total: i64 = filters.query().count().get_result(&mut conn)?;
    let docs: Vec<Document> = filters
        .query()
        .order((documents::created_at.desc(), documents::id.desc()))
        .limit(page.limit)
        .offset(page.offset())
        .load(&mut conn)?;

    let data = build_responses(&mut conn, docs, false)?;
    let count = data.len();
    Ok(Json(ApiResponse::ok(data).count(count).page(page.info(total))))
}

pub async fn get_document(
    State(state): State<AppState>,
    ApiPath(document_id): ApiPath<Uuid>,
) -> AppResult<Json<ApiResponse<DocumentResponse>>> {
    let mut conn = state.db()?;
    Ok(Json(ApiResponse::ok(load_detail(&mut conn, document_id)?)))
}

struct CreateDocument {
    document_number: Option<String>,
    document: NewDocument,
    files: Vec<NewDocumentFile>,
}

fn insert_document(state: &AppState, request: CreateDocument, now: NaiveDateTime) -> AppResult<Document> {
    let mut conn = state.db()?;
    conn.transaction::<Document, AppError, _>(|conn| {
        let CreateDocument {
            document_number,
            mut document,
            files,
        } = request;

        document.document_number = match document_number {
            Some(number) => number,
            None => {
                let doc_type = parse_choice::<DocumentType>(&document.doc_type)?;
                next_document_number(conn, doc_type, now)?
            }
        };

        diesel::insert_into(documents::table)
            .values(&document)
            .execute(conn)?;
        if !files.is_empty() {
            diesel::insert_into(document_files::table)
                .values(&files)
                .execute(conn)?;
        }

        Ok(documents::table.find(document.id).first(conn)?)
    })
}

pub async fn create_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<ApiResponse<DocumentResponse>>)> {
    user.require(Permission::Create)?;

    let form = read_document_form(multipart, state.max_upload_files()).await?;
    let now = Utc::now().naive_utc();

    let title = form
        .text("title")
        .ok_or_else(|| AppError::bad_request("title is required"))?;
    let title = bounded(title, "title", MAX_TITLE_LENGTH)?;
    let doc_type: DocumentType = parse_choice(
        &form
            .text("type")
            .ok_or_else(|| AppError::bad_request("type is required"))?,
    )?;
    let category_id = parse_uuid_field(
        &form
            .text("category")
            .ok_or_else(|| AppError::bad_request("category is required"))?,
        "category",
    )?;
    let subcategory_id = form
        .text("subcategory")
        .map(|v| parse_uuid_field(&v, "subcategory"))
        .transpose()?;
    let issue_date = form
        .text("issue_date")
        .map(|v| parse_date(&v, "issue_date"))
        .transpose()?
        .unwrap_or(now);
    let priority: Priority = form
        .text("priority")
        .map(|v| parse_choice(&v))
        .transpose()?
        .unwrap_or(Priority::Medium);
    let status = form
        .text("status")
        .map(|v| editable_status(&v))
        .transpose()?
        .unwrap_or(DocumentStatus::Active);
    let archive_reminder_date = form
        .text("archive_reminder_date")
        .map(|v| parse_date(&v, "archive_reminder_date"))
        .transpose()?;

    {
        let mut conn = state.db()?;
        validate_classification(&mut conn, category_id, subcategory_id)?;
    }

    let document_number = form
        .text("document_number")
        .map(|v| bounded(v, "document_number", MAX_DOCUMENT_NUMBER_LENGTH))
        .transpose()?;
    let tags = form
        .fields
        .get("tags")
        .map(|v| parse_tags(v))
        .transpose()?
        .unwrap_or_default();

    let document_id = Uuid::new_v4();
    let request = CreateDocument {
        document_number,
        document: NewDocument {
            id: document_id,
            document_number: String::new(),
            title,
            doc_type: doc_type.as_str().to_string(),
            category_id,
            subcategory_id,
            issue_date,
            sender: form.text("sender"),
            recipient: form.text("recipient"),
            subject: form.text("subject"),
            description: form.text("description"),
            priority: priority.as_str().to_string(),
            status: status.as_str().to_string(),
            tags,
            archive_date: None,
            archive_reminder_date,
            archived_by: None,
            created_by: user.user_id,
        },
        files: Vec::new(),
    };

    let files = store_files(&state, document_id, form.files).await?;
    let stored_keys: Vec<String> = files.iter().map(|f| f.storage_key.clone()).collect();

    let document = match insert_document(&state, CreateDocument { files, ..request }, now) {
        Ok(document) => document,
        Err(err) => {
            remove_stored_files(&state, &stored_keys).await;
            return Err(err);
        }
    };

    info!(
        document_id = %document.id,
        document_number = %document.document_number,
        files = stored_keys.len(),
        created_by = %user.user_id,
        "document created"
    );

    let mut conn = state.db()?;
    if let Err(err) =
        notifications::notify_new_document(&mut conn, &document, priority, user.user_id)
    {
        warn!(document_id = %document.id, error = %err, "failed to create document notifications");
    }

    let detail = load_detail(&mut conn, document.id)?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::with_message("document created", detail)),
    ))
}

fn apply_update(
    state: &AppState,
    document_id: Uuid,
    changeset: &DocumentChangeset,
    files: &[NewDocumentFile],
) -> AppResult<()> {
    let mut conn = state.db()?;
    conn.transaction::<(), AppError, _>(|conn| {
        diesel::update(documents::table.find(document_id))
            .set(changeset)
            .execute(conn)?;
        if !files.is_empty() {
            diesel::insert_into(document_files::table)
                .values(files)
                .execute(conn)?;
        }
        Ok(())
    })
}

pub async fn update_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiPath(document_id): ApiPath<Uuid>,
    multipart: Multipart,
) -> AppResult<Json<ApiResponse<DocumentResponse>>> {
    user.require(Permission::Update)?;

    let form = read_document_form(multipart, state.max_upload_files()).await?;
    let existing = {
        let mut conn = state.db()?;
        find_document(&mut conn, document_id)?
    };
    let now = Utc::now().naive_utc();

    let title = match form.fields.get("title") {
        Some(value) => Some(bounded(
            non_blank(Some(value.clone()))
                .ok_or_else(|| AppError::bad_request("title must not be empty"))?,
            "title",
            MAX_TITLE_LENGTH,
        )?),
        None => None,
    };
    let doc_type = form
        .text("type")
        .map(|v| parse_choice::<DocumentType>(&v))
        .transpose()?;
    let category_id = form
        .text("category")
        .map(|v| parse_uuid_field(&v, "category"))
        .transpose()?;
    let subcategory_id = form
        .nullable_text("subcategory")
        .map(|value| value.map(|v| parse_uuid_field(&v, "subcategory")).transpose())
        .transpose()?;
    let status = form.text("status").map(|v| editable_status(&v)).transpose()?;
    if status.is_some() && stored_status(&existing)? == DocumentStatus::Archived {
        return Err(AppError::bad_request(
            "archived documents must be restored before their status can change",
        ));
    }

    if category_id.is_some() || subcategory_id.is_some() {
        let effective_category = category_id.unwrap_or(existing.category_id);
        let effective_subcategory = subcategory_id.unwrap_or(existing.subcategory_id);
        let mut conn = state.db()?;
        validate_classification(&mut conn, effective_category, effective_subcategory)?;
    }

    let changeset = DocumentChangeset {
        document_number: form
            .text("document_number")
            .map(|v| bounded(v, "document_number", MAX_DOCUMENT_NUMBER_LENGTH))
            .transpose()?,
        title,
        doc_type: doc_type.map(|t| t.as_str().to_string()),
        category_id,
        subcategory_id,
        issue_date: form
            .text("issue_date")
            .map(|v| parse_date(&v, "issue_date"))
            .transpose()?,
        sender: form.nullable_text("sender"),
        recipient: form.nullable_text("recipient"),
        subject: form.nullable_text("subject"),
        description: form.nullable_text("description"),
        priority: form
            .text("priority")
            .map(|v| parse_choice::<Priority>(&v))
            .transpose()?
            .map(|p| p.as_str().to_string()),
        status: status.map(|s| s.as_str().to_string()),
        tags: form.fields.get("tags").map(|v| parse_tags(v)).transpose()?,
        archive_reminder_date: form
            .nullable_text("archive_reminder_date")
            .map(|value| {
                value
                    .map(|v| parse_date(&v, "archive_reminder_date"))
                    .transpose()
            })
            .transpose()?,
        last_modified_by: Some(Some(user.user_id)),
        updated_at: Some(now),
    };

    let files = store_files(&state, document_id, form.files).await?;
    if let Err(err) = apply_update(&state, document_id, &changeset, &files) {
        let keys: Vec<String> = files.iter().map(|f| f.storage_key.clone()).collect();
        remove_stored_files(&state, &keys).await;
        return Err(err);
    }

    info!(document_id = %document_id, added_files = files.len(), by = %user.user_id, "document updated");

    let mut conn = state.db()?;
    Ok(Json(ApiResponse::with_message(
        "document updated",
        load_detail(&mut conn, document_id)?,
    )))
}

/// Removes stored attachments first; a failure there is logged and does not
/// stop the record from being deleted.
pub async fn delete_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiPath(document_id): ApiPath<Uuid>,
) -> AppResult<Json<ApiResponse<Empty>>> {
    user.require(Permission::Delete)?;

    let keys: Vec<String> = {
        let mut conn = state.db()?;
        find_document(&mut conn, document_id)?;
        document_files::table
            .filter(document_files::document_id.eq(document_id))
            .select(document_files::storage_key)
            .load(&mut conn)?
    };

    remove_stored_files(&state, &keys).await;

    let mut conn = state.db()?;
    diesel::delete(documents::table.find(document_id)).execute(&mut conn)?;
    info!(document_id = %document_id, files = keys.len(), by = %user.user_id, "document deleted");

    Ok(Json(ApiResponse::message("document deleted")))
}

pub async fn archive_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiPath(document_id): ApiPath<Uuid>,
) -> AppResult<Json<ApiResponse<DocumentResponse>>> {
    user.require(Permission::Archive)?;

    let mut conn = state.db()?;
    let document = find_document(&mut conn, document_id)?;
    let now = Utc::now().naive_utc();
    let next = archive::archive(stored_status(&document)?, user.user_id, now)?;

    let updated = diesel::update(
        documents::table
            .find(document_id)
            .filter(documents::status.ne(DocumentStatus::Archived.as_str())),
    )
    .set((
        documents::status.eq(next.status.as_str()),
        documents::archive_date.eq(next.archive_date),
        documents::archived_by.eq(next.archived_by),
        documents::updated_at.eq(now),
    ))
    .execute(&mut conn)?;
    if updated == 0 {
        return Err(archive::TransitionError::AlreadyArchived.into());
    }

    info!(document_id = %document_id, archived_by = %user.user_id, "document archived");
    Ok(Json(ApiResponse::with_message(
        "document archived",
        load_detail(&mut conn, document_id)?,
    )))
}

pub async fn restore_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiPath(document_id): ApiPath<Uuid>,
) -> AppResult<Json<ApiResponse<DocumentResponse>>> {
    user.require(Permission::Restore)?;

    let mut conn = state.db()?;
    let document = find_document(&mut conn, document_id)?;
    let next = archive::restore(stored_status(&document)?)?;

    let updated = diesel::update(
        documents::table
            .find(document_id)
            .filter(documents::status.eq(DocumentStatus::Archived.as_str())),
    )
    .set((
        documents::status.eq(next.status.as_str()),
        documents::archive_date.eq(next.archive_date),
        documents::archived_by.eq(next.archived_by),
        documents::updated_at.eq(Utc::now().naive_utc()),
    ))
    .execute(&mut conn)?;
    if updated == 0 {
        return Err(archive::TransitionError::NotArchived.into());
    }

    info!(document_id = %document_id, restored_by = %user.user_id, "document restored");
    Ok(Json(ApiResponse::with_message(
        "document restored",
        load_detail(&mut conn, document_id)?,
    )))
}

pub async fn add_note(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiPath(document_id): ApiPath<Uuid>,
    ApiJson(payload): ApiJson<AddNoteRequest>,
) -> AppResult<Json<ApiResponse<DocumentResponse>>> {
    let content = non_blank(Some(payload.content))
        .ok_or_else(|| AppError::bad_request("note content must not be empty"))?;

    let mut conn = state.db()?;
    find_document(&mut conn, document_id)?;

    diesel::insert_into(document_notes::table)
        .values(&NewDocumentNote {
            id: Uuid::new_v4(),
            document_id,
            content,
            created_by: user.user_id,
        })
        .execute(&mut conn)?;

    Ok(Json(ApiResponse::with_message(
        "note added",
        load_detail(&mut conn, document_id)?,
    )))
}

pub async fn download_file(
    State(state): State<AppState>,
    ApiPath((document_id, file_id)): ApiPath<(Uuid, Uuid)>,
) -> AppResult<impl IntoResponse> {
    let file: DocumentFile = {
        let mut conn = state.db()?;
        find_document(&mut conn, document_id)?;
        document_files::table
            .filter(document_files::id.eq(file_id))
            .filter(document_files::document_id.eq(document_id))
            .first(&mut conn)
            .optional()?
            .ok_or_else(|| AppError::missing("file"))?
    };

    let bytes = state
        .storage
        .get_object(&file.storage_key)
        .await
        .map_err(|err| AppError::internal(format!("failed to read stored file: {err}")))?
        .ok_or_else(|| {
            warn!(file_id = %file.id, key = %file.storage_key, "stored file is missing");
            AppError::missing("file")
        })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&file.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&attachment_content_disposition(&file.original_name))
            .map_err(|err| AppError::internal(format!("invalid content disposition: {err}")))?,
    );

    Ok((headers, bytes))
}

fn buckets(rows: Vec<(String, i64)>) -> Vec<CountBucket> {
    rows.into_iter()
        .map(|(value, count)| CountBucket { value, count })
        .collect()
}

pub async fn document_stats(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<DocumentStats>>> {
    let mut conn = state.db()?;

    let by_status: Vec<(String, i64)> = documents::table
        .group_by(documents::status)
        .select((documents::status, count_star()))
        .order(documents::status.asc())
        .load(&mut conn)?;
    let by_type: Vec<(String, i64)> = documents::table
        .group_by(documents::doc_type)
        .select((documents::doc_type, count_star()))
        .order(documents::doc_type.asc())
        .load(&mut conn)?;
    let by_priority: Vec<(String, i64)> = documents::table
        .group_by(documents::priority)
        .select((documents::priority, count_star()))
        .order(documents::priority.asc())
        .load(&mut conn)?;
    let total: i64 = documents::table.count().get_result(&mut conn)?;

    let recent: Vec<Document> = documents::table
        .order(documents::created_at.desc())
        .limit(RECENT_DOCUMENTS)
        .load(&mut conn)?;

    Ok(Json(ApiResponse::ok(DocumentStats {
        by_status: buckets(by_status),
        by_type: buckets(by_type),
        by_priority: buckets(by_priority),
        total,
        recent_documents: recent
            .into_iter()
            .map(|doc| RecentDocument {
                id: doc.id,
                document_number: doc.document_number,
                title: doc.title,
                doc_type: doc.doc_type,
                status: doc.status,
                created_at: to_iso(doc.created_at),
            })
            .collect(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_disposition_keeps_utf8_name_encoded() {
        let header = attachment_content_disposition("رسالة رسمية.pdf");
        assert!(header.starts_with("attachment; filename=\""));
        assert!(header.contains("filename*=UTF-8''"));
        assert!(header.is_ascii());
        assert!(HeaderValue::from_str(&header).is_ok());

        let plain = attachment_content_disposition("report \"final\".pdf");
        assert!(plain.contains("filename=\"report _final_.pdf\""));
    }

    #[test]
    fn dates_accept_plain_days_and_timestamps() {
        let day = parse_date("2024-03-01", "issue_date").unwrap();
        assert_eq!(day.to_string(), "2024-03-01 00:00:00");

        let stamp = parse_date("2024-03-01T10:15:00Z", "issue_date").unwrap();
        assert_eq!(stamp.to_string(), "2024-03-01 10:15:00");

        let end = parse_end_date("2024-03-01").unwrap();
        assert_eq!(end.to_string(), "2024-03-01 23:59:59.999999");

        assert!(parse_date("yesterday", "issue_date").is_err());
    }

    #[test]
    fn tags_parse_from_lists_and_json() {
        assert_eq!(
            parse_tags("finance, urgent ,,finance").unwrap(),
            vec!["finance", "urgent"]
        );
        assert_eq!(parse_tags(r#"["a", " b "]"#).unwrap(), vec!["a", "b"]);
        assert!(parse_tags("  ").unwrap().is_empty());
    }

    #[test]
    fn malformed_tag_json_is_rejected() {
        let err = parse_tags("[broken").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(parse_tags(r#"[1, 2]"#).is_err());
    }

    #[test]
    fn long_text_is_bounded_by_characters() {
        assert!(bounded("ا".repeat(MAX_TITLE_LENGTH), "title", MAX_TITLE_LENGTH).is_ok());
        let err = bounded("x".repeat(MAX_TITLE_LENGTH + 1), "title", MAX_TITLE_LENGTH).unwrap_err();
        assert_eq!(err.message(), "title must be at most 500 characters");
    }

    #[test]
    fn archived_is_not_an_editable_status() {
        assert_eq!(editable_status("pending").unwrap(), DocumentStatus::Pending);
        assert!(editable_status("archived").is_err());
        assert!(editable_status("lost").is_err());
    }
}
