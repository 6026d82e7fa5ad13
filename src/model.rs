//! Normalized feed types shared by the fetcher, aggregator and converter.

use chrono::{DateTime, Utc};

pub const UNKNOWN_AUTHOR: &str = "Unknown Author";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: Option<String>,
}

impl Author {
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN_AUTHOR.to_string(),
            email: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub content: Option<String>,
    pub author: Author,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

impl NormalizedItem {
    /// Timestamp used for ordering: published, falling back to updated.
    pub fn sort_key(&self) -> Option<DateTime<Utc>> {
        self.published.or(self.updated)
    }
}

/// A complete feed ready to be rendered: channel metadata plus items.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeedDocument {
    pub title: String,
    pub link: String,
    pub description: String,
    pub author: Option<Author>,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub items: Vec<NormalizedItem>,
}

impl FeedDocument {
    /// The most recent timestamp in the document, used where a format
    /// requires a feed-level "updated" value.
    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.items
            .iter()
            .filter_map(NormalizedItem::sort_key)
            .chain(self.updated)
            .chain(self.created)
            .max()
    }
}

/// Sorts items most recent first. Items without any timestamp go last and
/// keep their relative order.
pub fn sort_newest_first(items: &mut [NormalizedItem]) {
    items.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(title: &str, published: Option<DateTime<Utc>>) -> NormalizedItem {
        NormalizedItem {
            title: title.to_string(),
            link: format!("https://example.com/{}", title),
            description: String::new(),
            content: None,
            author: Author::unknown(),
            published,
            updated: None,
        }
    }

    fn day(d: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_sort_newest_first() {
        let mut items = vec![item("a", day(1)), item("b", day(3)), item("c", day(2))];
        sort_newest_first(&mut items);
        let titles: Vec<_> = items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_undated_items_sort_last_in_source_order() {
        let mut items = vec![
            item("x", None),
            item("a", day(1)),
            item("y", None),
            item("b", day(2)),
        ];
        sort_newest_first(&mut items);
        let titles: Vec<_> = items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["b", "a", "x", "y"]);
    }

    #[test]
    fn test_sort_key_falls_back_to_updated() {
        let mut i = item("a", None);
        i.updated = day(5);
        assert_eq!(i.sort_key(), day(5));
    }

    #[test]
    fn test_latest_timestamp() {
        let doc = FeedDocument {
            items: vec![item("a", day(2)), item("b", day(7))],
            created: day(1),
            ..Default::default()
        };
        assert_eq!(doc.latest_timestamp(), day(7));
        assert_eq!(FeedDocument::default().latest_timestamp(), None);
    }
}
