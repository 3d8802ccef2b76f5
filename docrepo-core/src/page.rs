//! Pagination and result types for paged reads.
//!
//! This module provides the [`PagedResult`] returned by faceted aggregation and
//! the [`PageRequest`] callers use to ask for a page.

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::{DocumentStoreError, DocumentStoreResult};

/// A single page of results plus its position in the full result set.
///
/// # Example
///
/// ```ignore
/// use docrepo::page::PagedResult;
///
/// let page = PagedResult::new(vec!["a", "b"], 1, 2, 5)?;
///
/// assert_eq!(page.page_count(), 3);
/// assert!(page.has_next_page());
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PagedResult<T> {
    items: Vec<T>,
    page: u64,
    page_size: u64,
    row_count: u64,
    #[serde(skip)]
    page_count: OnceLock<u64>,
}

impl<T> PagedResult<T> {
    /// Creates a page.
    ///
    /// # Errors
    ///
    /// Fails with [`DocumentStoreError::InvalidArgument`] when `page_size` is zero
    /// or when more than `page_size` items are supplied.
    pub fn new(items: Vec<T>, page: u64, page_size: u64, row_count: u64) -> DocumentStoreResult<Self> {
        if page_size == 0 {
            return Err(DocumentStoreError::invalid_argument("page_size", "must be greater than zero"));
        }
        if items.len() as u64 > page_size {
            return Err(DocumentStoreError::invalid_argument(
                "items",
                format!("{} items exceed the page size of {page_size}", items.len()),
            ));
        }

        Ok(Self { items, page, page_size, row_count, page_count: OnceLock::new() })
    }

    /// An empty first page.
    pub fn empty(page_size: u64) -> DocumentStoreResult<Self> {
        Self::new(Vec::new(), 1, page_size, 0)
    }

    /// Items of this page.
    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    /// Current page number; 1 is the first page.
    pub fn page(&self) -> u64 {
        self.page
    }

    /// Maximum number of items on a page.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of matching rows across all pages.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Number of pages, computed on first access.
    pub fn page_count(&self) -> u64 {
        *self
            .page_count
            .get_or_init(|| self.row_count.div_ceil(self.page_size))
    }

    /// Whether a page follows this one.
    pub fn has_next_page(&self) -> bool {
        self.page < self.page_count()
    }

    /// Whether a page precedes this one.
    pub fn has_previous_page(&self) -> bool {
        self.page > 1
    }

    /// The next page number, if any.
    pub fn next_page(&self) -> Option<u64> {
        self.has_next_page().then(|| self.page + 1)
    }

    /// The previous page number, if any.
    pub fn previous_page(&self) -> Option<u64> {
        self.has_previous_page().then(|| self.page - 1)
    }

    /// Transforms the items, keeping the page position.
    pub fn map<U, F>(self, f: F) -> PagedResult<U>
    where
        F: FnMut(T) -> U,
    {
        PagedResult {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            page_size: self.page_size,
            row_count: self.row_count,
            page_count: self.page_count,
        }
    }
}

/// Which page to read and how large pages are.
///
/// Pages are 1-indexed; page 0 is read as page 1.
///
/// # Example
///
/// ```ignore
/// use docrepo::page::PageRequest;
///
/// let request = PageRequest::new(3, 20);
/// assert_eq!(request.skip(), 40);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// The page number (1-indexed).
    pub page: u64,
    /// Number of items per page.
    pub page_size: u64,
}

impl PageRequest {
    /// Requests page `page` (1-based) of `page_size` items.
    pub fn new(page: u64, page_size: u64) -> Self {
        Self { page, page_size }
    }

    pub fn builder() -> PageRequestBuilder {
        PageRequestBuilder::new()
    }

    /// The page number with page 0 mapped to page 1.
    pub fn normalized_page(&self) -> u64 {
        self.page.max(1)
    }

    /// Number of rows to skip to reach this page.
    pub fn skip(&self) -> u64 {
        (self.normalized_page() - 1).saturating_mul(self.page_size)
    }

    /// Rejects a zero page size.
    pub fn validate(&self) -> DocumentStoreResult<()> {
        if self.page_size == 0 {
            return Err(DocumentStoreError::invalid_argument("page_size", "must be greater than zero"));
        }

        Ok(())
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, page_size: 10 }
    }
}

/// Builder for [`PageRequest`].
#[derive(Debug, Default)]
pub struct PageRequestBuilder {
    page: Option<u64>,
    page_size: Option<u64>,
}

impl PageRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the 1-based page number.
    pub fn with_page(mut self, page: u64) -> Self {
        self.page = Some(page);
        self
    }

    /// Sets the number of items per page.
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Uses page 1 and a page size of 10 for unset values.
    pub fn build(self) -> PageRequest {
        PageRequest {
            page: self.page.unwrap_or(1),
            page_size: self.page_size.unwrap_or(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_count_rounds_up_and_is_memoized() {
        let page = PagedResult::new(vec![1, 2], 1, 2, 5).unwrap();

        assert_eq!(page.page_count(), 3);
        assert_eq!(page.page_count.get(), Some(&3));
        assert_eq!(page.next_page(), Some(2));
        assert_eq!(page.previous_page(), None);
    }

    #[test]
    fn rejects_zero_page_size_and_oversized_pages() {
        assert!(matches!(
            PagedResult::<i32>::new(Vec::new(), 1, 0, 0),
            Err(DocumentStoreError::InvalidArgument { argument, .. }) if argument == "page_size"
        ));
        assert!(PagedResult::new(vec![1, 2, 3], 1, 2, 3).is_err());
        assert!(PageRequest::new(1, 0).validate().is_err());
    }

    #[test]
    fn page_zero_reads_as_first_page() {
        assert_eq!(PageRequest::new(0, 10).skip(), 0);
        assert_eq!(PageRequest::new(0, 10).normalized_page(), 1);
        assert_eq!(PageRequest::builder().with_page(3).with_page_size(20).build().skip(), 40);
    }

    #[test]
    fn map_keeps_position() {
        let page = PagedResult::new(vec![1, 2], 2, 2, 6).unwrap().map(|n| n * 10);

        assert_eq!(page.items(), &[10, 20]);
        assert_eq!(page.page(), 2);
        assert_eq!(page.page_count(), 3);
        assert!(page.has_previous_page());
    }

    #[test]
    fn empty_result_has_no_pages() {
        let page = PagedResult::<u8>::empty(10).unwrap();

        assert_eq!(page.page_count(), 0);
        assert!(!page.has_next_page());
    }
}
