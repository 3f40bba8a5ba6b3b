//! Keyset Pagination
//!
//! Every list response is wrapped in the same envelope. `cursor` is the key
//! of the last item on the page (empty when the page is empty) and is passed
//! back as `after` to fetch the next page.

use serde::{Deserialize, Serialize};

/// Paginated list envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub cursor: String,
    /// Number of items on this page
    pub total: usize,
    /// A full page was returned, so more items may follow
    pub has_more: bool,
    pub data: Vec<T>,
}

impl<T> Paginated<T> {
    /// Wrap one page of items fetched with `limit`
    pub fn from_page<F>(data: Vec<T>, limit: usize, key: F) -> Self
    where
        F: Fn(&T) -> String,
    {
        let cursor = data.last().map(&key).unwrap_or_default();
        Self {
            cursor,
            total: data.len(),
            has_more: data.len() >= limit,
            data,
        }
    }

    pub fn empty() -> Self {
        Self {
            cursor: String::new(),
            total: 0,
            has_more: false,
            data: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn map<U, F>(self, f: F) -> Paginated<U>
    where
        F: FnMut(T) -> U,
    {
        Paginated {
            cursor: self.cursor,
            total: self.total,
            has_more: self.has_more,
            data: self.data.into_iter().map(f).collect(),
        }
    }
}

/// Clamp a requested page size into `1..=max`, using `default` when absent
pub fn clamp_limit(requested: Option<usize>, default: usize, max: usize) -> usize {
    requested.unwrap_or(default).clamp(1, max.max(1))
}
