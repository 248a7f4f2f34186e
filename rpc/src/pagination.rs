//! Cursor-based pagination for list endpoints.

use serde::{Deserialize, Serialize};

/// Default page size when `count` is not specified.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Maximum allowed page size.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Query parameters accepted by list endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaginationParams {
    /// Opaque cursor from a previous response.
    pub cursor: Option<String>,
    /// Items per page (default 100, max 1000).
    pub count: Option<u32>,
}

impl PaginationParams {
    /// Effective page size, clamped to [1, MAX_PAGE_SIZE].
    pub fn effective_count(&self) -> u32 {
        self.count
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    /// Offset the cursor points at. An absent or malformed cursor starts
    /// from the beginning.
    pub fn decode_offset(&self) -> u64 {
        self.cursor.as_deref().and_then(decode_cursor).unwrap_or(0)
    }
}

/// One page of a list response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page; absent on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl<T> Page<T> {
    /// Slice `all` according to `params`.
    pub fn of(all: Vec<T>, params: &PaginationParams) -> Self {
        let offset = params.decode_offset();
        let count = params.effective_count();
        let items: Vec<T> = all
            .into_iter()
            .skip(offset as usize)
            .take(count as usize)
            .collect();
        let cursor = next_cursor(offset, items.len(), count);
        Self { items, cursor }
    }
}

/// Encode an offset as an opaque cursor (hex of its big-endian bytes).
pub fn encode_cursor(offset: u64) -> String {
    hex::encode(offset.to_be_bytes())
}

pub fn decode_cursor(cursor: &str) -> Option<u64> {
    let bytes: [u8; 8] = hex::decode(cursor).ok()?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// The next-page cursor, or `None` once a short page signals the end.
pub fn next_cursor(current_offset: u64, returned: usize, page_size: u32) -> Option<String> {
    if (returned as u32) < page_size {
        None
    } else {
        Some(encode_cursor(current_offset + returned as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_decodes_to_the_encoded_offset() {
        assert_eq!(decode_cursor(&encode_cursor(123_456_789)), Some(123_456_789));
        assert_eq!(decode_cursor("not-hex"), None);
        assert_eq!(decode_cursor("00"), None);
    }

    #[test]
    fn short_page_has_no_next_cursor() {
        assert!(next_cursor(0, 50, 100).is_none());
        assert_eq!(
            next_cursor(0, 100, 100).as_deref().and_then(decode_cursor),
            Some(100)
        );
    }

    #[test]
    fn effective_count_clamps() {
        let p = PaginationParams {
            cursor: None,
            count: Some(5000),
        };
        assert_eq!(p.effective_count(), 1000);
        assert_eq!(PaginationParams::default().effective_count(), 100);
    }

    #[test]
    fn pages_walk_the_whole_list() {
        let all: Vec<u32> = (0..5).collect();
        let mut params = PaginationParams {
            cursor: None,
            count: Some(2),
        };
        let mut seen = Vec::new();
        loop {
            let page = Page::of(all.clone(), &params);
            seen.extend(page.items);
            match page.cursor {
                Some(c) => params.cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(seen, all);
    }
}
