use serde::Serialize;

use crate::error::{AppError, AppResult};

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;
/// Largest page number whose offset still fits an `i64` at any page size.
pub const MAX_PAGE: i64 = i64::MAX / MAX_PAGE_SIZE;

/// The `{success, message?, data, ...}` envelope every endpoint answers with.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(flatten)]
    pub page: Option<PageInfo>,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            count: None,
            page: None,
            data,
        }
    }

    pub fn with_message(message: impl Into<String>, data: T) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::ok(data)
        }
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn page(mut self, page: PageInfo) -> Self {
        self.page = Some(page);
        self
    }
}

/// Serializes as `{}` for endpoints with nothing to return.
#[derive(Debug, Default, Serialize)]
pub struct Empty {}

impl ApiResponse<Empty> {
    pub fn message(message: impl Into<String>) -> Self {
        Self::with_message(message, Empty {})
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

impl PageRequest {
    pub fn resolve(self, default_limit: i64) -> AppResult<Page> {
        let page = self.page.unwrap_or(1).max(1);
        if page > MAX_PAGE {
            return Err(AppError::bad_request(format!(
                "page must not be greater than {MAX_PAGE}"
            )));
        }
        Ok(Page {
            page,
            limit: self.limit.unwrap_or(default_limit).clamp(1, MAX_PAGE_SIZE),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: i64,
    pub limit: i64,
}

impl Page {
    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.limit
    }

    pub fn info(&self, total: i64) -> PageInfo {
        PageInfo {
            total,
            total_pages: (total + self.limit - 1) / self.limit,
            current_page: self.page,
            unread_count: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageInfo {
    pub total: i64,
    pub total_pages: i64,
    pub current_page: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn paged_envelope_flattens_pagination() {
        let page = PageRequest {
            page: Some(2),
            limit: Some(10),
        }
        .resolve(DEFAULT_PAGE_SIZE)
        .unwrap();
        let body = serde_json::to_value(
            ApiResponse::ok(vec![1, 2, 3]).count(3).page(page.info(23)),
        )
        .unwrap();

        assert_eq!(
            body,
            json!({
                "success": true,
                "count": 3,
                "total": 23,
                "total_pages": 3,
                "current_page": 2,
                "data": [1, 2, 3]
            })
        );
    }

    #[test]
    fn message_only_response_has_empty_data() {
        let body = serde_json::to_value(ApiResponse::message("deleted")).unwrap();
        assert_eq!(body, json!({"success": true, "message": "deleted", "data": {}}));
    }

    #[test]
    fn page_request_clamps_bounds() {
        let page = PageRequest {
            page: Some(0),
            limit: Some(10_000),
        }
        .resolve(20)
        .unwrap();
        assert_eq!(page, Page { page: 1, limit: MAX_PAGE_SIZE });
        assert_eq!(page.offset(), 0);

        let defaulted = PageRequest { page: None, limit: None }.resolve(20).unwrap();
        assert_eq!(defaulted.limit, 20);
        assert_eq!(defaulted.info(0).total_pages, 0);
    }

    #[test]
    fn huge_page_numbers_are_rejected() {
        let last = PageRequest {
            page: Some(MAX_PAGE),
            limit: Some(MAX_PAGE_SIZE),
        }
        .resolve(DEFAULT_PAGE_SIZE)
        .unwrap();
        assert!(last.offset() > 0);

        let err = PageRequest {
            page: Some(i64::MAX / 50),
            limit: Some(100),
        }
        .resolve(DEFAULT_PAGE_SIZE)
        .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
