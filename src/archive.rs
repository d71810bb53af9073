//! Rules that belong to documents themselves rather than to HTTP: the
//! classification enums, number generation and the archive/restore
//! transition.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDateTime};
use diesel::dsl::exists;
use diesel::prelude::*;
use diesel::{select, PgConnection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::AppError;
use crate::schema::documents;

pub const DOCUMENT_NUMBER_DIGITS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Incoming,
    Outgoing,
}

impl DocumentType {
    pub const ALL: [DocumentType; 2] = [DocumentType::Incoming, DocumentType::Outgoing];

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::Incoming => "incoming",
            DocumentType::Outgoing => "outgoing",
        }
    }

    pub fn number_prefix(self) -> &'static str {
        match self {
            DocumentType::Incoming => "IN",
            DocumentType::Outgoing => "OUT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Urgent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Active,
    Archived,
    Pending,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 3] = [
        DocumentStatus::Active,
        DocumentStatus::Archived,
        DocumentStatus::Pending,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Active => "active",
            DocumentStatus::Archived => "archived",
            DocumentStatus::Pending => "pending",
        }
    }
}

fn parse_named<T: Copy>(
    value: &str,
    all: &[T],
    name: impl Fn(T) -> &'static str,
    field: &str,
) -> Result<T, String> {
    let needle = value.trim();
    all.iter().copied().find(|v| name(*v) == needle).ok_or_else(|| {
        let allowed: Vec<&str> = all.iter().map(|v| name(*v)).collect();
        format!(
            "invalid {field} '{needle}'. Allowed values: {}",
            allowed.join(", ")
        )
    })
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_named(value, &Self::ALL, Self::as_str, "type")
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_named(value, &Self::ALL, Self::as_str, "priority")
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_named(value, &Self::ALL, Self::as_str, "status")
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{IN|OUT}-{year}-{sequence}` with the sequence zero-padded to five digits.
pub fn format_document_number(doc_type: DocumentType, year: i32, sequence: i64) -> String {
    format!(
        "{}-{}-{:0width$}",
        doc_type.number_prefix(),
        year,
        sequence,
        width = DOCUMENT_NUMBER_DIGITS
    )
}

/// Derives the next number from the current document count and steps past
/// numbers that are already taken, which happens once documents get deleted.
///
/// Two concurrent creations can still compute the same candidate; the unique
/// constraint on `document_number` rejects the second insert.
pub fn next_document_number(
    conn: &mut PgConnection,
    doc_type: DocumentType,
    now: NaiveDateTime,
) -> QueryResult<String> {
    let count: i64 = documents::table.count().get_result(conn)?;
    let year = now.year();
    let mut sequence = count + 1;

    loop {
        let candidate = format_document_number(doc_type, year, sequence);
        let taken: bool = select(exists(
            documents::table.filter(documents::document_number.eq(&candidate)),
        ))
        .get_result(conn)?;
        if !taken {
            return Ok(candidate);
        }
        sequence += 1;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("document is already archived")]
    AlreadyArchived,
    #[error("document is not archived")]
    NotArchived,
}

impl From<TransitionError> for AppError {
    fn from(value: TransitionError) -> Self {
        AppError::bad_request(value.to_string())
    }
}

/// Archive metadata to write back after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveState {
    pub status: DocumentStatus,
    pub archive_date: Option<NaiveDateTime>,
    pub archived_by: Option<Uuid>,
}

pub fn archive(
    current: DocumentStatus,
    archived_by: Uuid,
    now: NaiveDateTime,
) -> Result<ArchiveState, TransitionError> {
    if current == DocumentStatus::Archived {
        return Err(TransitionError::AlreadyArchived);
    }
    Ok(ArchiveState {
        status: DocumentStatus::Archived,
        archive_date: Some(now),
        archived_by: Some(archived_by),
    })
}

pub fn restore(current: DocumentStatus) -> Result<ArchiveState, TransitionError> {
    if current != DocumentStatus::Archived {
        return Err(TransitionError::NotArchived);
    }
    Ok(ArchiveState {
        status: DocumentStatus::Active,
        archive_date: None,
        archived_by: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    fn matches_number_shape(number: &str) -> bool {
        let parts: Vec<&str> = number.split('-').collect();
        parts.len() == 3
            && (parts[0] == "IN" || parts[0] == "OUT")
            && parts[1].len() == 4
            && parts[1].chars().all(|c| c.is_ascii_digit())
            && parts[2].len() == DOCUMENT_NUMBER_DIGITS
            && parts[2].chars().all(|c| c.is_ascii_digit())
    }

    #[test]
    fn formats_numbers_with_prefix_year_and_padding() {
        assert_eq!(
            format_document_number(DocumentType::Incoming, 2024, 1),
            "IN-2024-00001"
        );
        assert_eq!(
            format_document_number(DocumentType::Outgoing, 2025, 1234),
            "OUT-2025-01234"
        );
        for seq in [1, 42, 99_999] {
            assert!(matches_number_shape(&format_document_number(
                DocumentType::Outgoing,
                2024,
                seq
            )));
        }
    }

    #[test]
    fn archiving_sets_metadata() {
        let user = Uuid::new_v4();
        let state = archive(DocumentStatus::Active, user, now()).unwrap();
        assert_eq!(state.status, DocumentStatus::Archived);
        assert_eq!(state.archive_date, Some(now()));
        assert_eq!(state.archived_by, Some(user));

        assert!(archive(DocumentStatus::Pending, user, now()).is_ok());
    }

    #[test]
    fn archiving_twice_is_rejected() {
        assert_eq!(
            archive(DocumentStatus::Archived, Uuid::new_v4(), now()),
            Err(TransitionError::AlreadyArchived)
        );
    }

    #[test]
    fn restoring_clears_metadata() {
        let state = restore(DocumentStatus::Archived).unwrap();
        assert_eq!(state.status, DocumentStatus::Active);
        assert!(state.archive_date.is_none());
        assert!(state.archived_by.is_none());
    }

    #[test]
    fn restoring_a_live_document_is_rejected() {
        assert_eq!(
            restore(DocumentStatus::Active),
            Err(TransitionError::NotArchived)
        );
        assert_eq!(
            restore(DocumentStatus::Pending),
            Err(TransitionError::NotArchived)
        );
    }

    #[test]
    fn parses_enums_and_lists_allowed_values() {
        assert_eq!("incoming".parse::<DocumentType>(), Ok(DocumentType::Incoming));
        assert_eq!("urgent".parse::<Priority>(), Ok(Priority::Urgent));
        assert_eq!(" archived ".parse::<DocumentStatus>(), Ok(DocumentStatus::Archived));
        let err = "lost".parse::<DocumentStatus>().unwrap_err();
        assert!(err.contains("active, archived, pending"));
    }
}
