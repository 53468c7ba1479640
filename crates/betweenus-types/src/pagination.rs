use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaginationError {
    #[error("Page must be >= 1, got {0}")]
    InvalidPage(i64),
    #[error("Size must be between 1 and {MAX_PAGE_SIZE}, got {0}")]
    InvalidSize(i64),
    #[error("{field} must be an integer, got {value:?}")]
    NotAnInteger { field: &'static str, value: String },
}

/// Which slice of a result set a consumer wants.
///
/// Construction validates, it never clamps: a window that exists is always
/// within bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawWindow")]
pub struct PaginationWindow {
    page: u32,
    size: u32,
}

#[derive(Deserialize)]
struct RawWindow {
    page: i64,
    size: i64,
}

impl TryFrom<RawWindow> for PaginationWindow {
    type Error = PaginationError;

    fn try_from(raw: RawWindow) -> Result<Self, Self::Error> {
        Self::new(raw.page, raw.size)
    }
}

impl PaginationWindow {
    pub fn new(page: i64, size: i64) -> Result<Self, PaginationError> {
        if page < 1 || page > i64::from(u32::MAX) {
            return Err(PaginationError::InvalidPage(page));
        }
        if size < 1 || size > i64::from(MAX_PAGE_SIZE) {
            return Err(PaginationError::InvalidSize(size));
        }
        Ok(Self {
            page: page as u32,
            size: size as u32,
        })
    }

    /// Build a window from raw query-string values. Missing values fall
    /// back to page 1 and the default size.
    pub fn from_query(page: Option<&str>, size: Option<&str>) -> Result<Self, PaginationError> {
        let page = parse_param("page", page)?.unwrap_or(1);
        let size = parse_param("size", size)?.unwrap_or(i64::from(DEFAULT_PAGE_SIZE));
        Self::new(page, size)
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.size)
    }

    pub fn limit(&self) -> u32 {
        self.size
    }
}

fn parse_param(field: &'static str, raw: Option<&str>) -> Result<Option<i64>, PaginationError> {
    raw.map(|value| {
        value.trim().parse().map_err(|_| PaginationError::NotAnInteger {
            field,
            value: value.to_string(),
        })
    })
    .transpose()
}

impl Default for PaginationWindow {
    fn default() -> Self {
        Self {
            page: 1,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub current_page: u32,
    pub page_size: u32,
    pub total_items: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_previous: bool,
}

impl PageInfo {
    pub fn new(window: PaginationWindow, total_items: u64) -> Self {
        let size = u64::from(window.limit());
        let total_pages = if total_items == 0 {
            1
        } else {
            total_items.div_ceil(size)
        };
        Self {
            current_page: window.page(),
            page_size: window.limit(),
            total_items,
            total_pages,
            has_next: u64::from(window.page()) < total_pages,
            has_previous: window.page() > 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: PageInfo,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, window: PaginationWindow, total_items: u64) -> Self {
        Self {
            data,
            pagination: PageInfo::new(window, total_items),
        }
    }
}
