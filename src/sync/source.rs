//! Source site addressing
//!
//! Builds listing URLs from an operator-supplied filter and encodes the
//! page cursor used by checkpoints. The cursor is plain `page=N` text so a
//! resumed task (and a debugging operator) can read it directly.

use serde::{Deserialize, Serialize};

/// Source site endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    pub page_size: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.1688.com".to_string(),
            page_size: 60,
        }
    }
}

/// Operator filter resolving to an initial cursor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceFilter {
    pub category: Option<String>,
    pub keyword: Option<String>,
    /// Inclusive ISO date bounds on source-side updates
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    /// Cap on processed records; 0 means unbounded
    #[serde(default)]
    pub limit: u64,
}

impl SourceFilter {
    pub fn for_category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            ..Default::default()
        }
    }
}

impl SourceConfig {
    /// Listing URL for one page of the filtered view
    pub fn list_url(&self, filter: &SourceFilter, page: u32) -> String {
        if let Some(keyword) = &filter.keyword {
            format!(
                "{}/search/search.html?keywords={}&beginPage={}&pageSize={}",
                self.base_url, keyword, page, self.page_size
            )
        } else if let Some(category) = &filter.category {
            format!("{}/chanpin/{}.html?beginPage={}", self.base_url, category, page)
        } else {
            format!("{}/offer_search/offerlist.html?beginPage={}", self.base_url, page)
        }
    }

    /// Supplier profile URL
    pub fn supplier_url(&self, supplier_source_id: &str) -> String {
        format!("{}/member/{}.html", self.base_url, supplier_source_id)
    }
}

/// Encode the page cursor stored in checkpoints
pub fn encode_cursor(page: u32) -> Vec<u8> {
    format!("page={page}").into_bytes()
}

/// Decode a checkpoint cursor; malformed cursors restart from page 1
pub fn decode_cursor(cursor: &[u8]) -> u32 {
    std::str::from_utf8(cursor)
        .ok()
        .and_then(|s| s.strip_prefix("page="))
        .and_then(|n| n.parse().ok())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_roundtrip() {
        assert_eq!(decode_cursor(&encode_cursor(7)), 7);
        assert_eq!(decode_cursor(b"page=12"), 12);
        assert_eq!(decode_cursor(b"garbage"), 1);
    }

    #[test]
    fn url_shapes() {
        let source = SourceConfig::default();
        let by_keyword = source.list_url(
            &SourceFilter {
                keyword: Some("苹果".to_string()),
                ..Default::default()
            },
            2,
        );
        assert!(by_keyword.contains("keywords=苹果"));
        assert!(by_keyword.contains("beginPage=2"));

        let by_category = source.list_url(&SourceFilter::for_category("shuiguo"), 1);
        assert!(by_category.contains("/chanpin/shuiguo.html"));
    }
}
