use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{info, warn};

use crate::fetcher::{FetchError, Fetcher};
use crate::model::{sort_newest_first, FeedDocument, NormalizedItem};

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("failed to fetch {url}: {source}")]
    SourceFetch {
        url: String,
        #[source]
        source: FetchError,
    },
}

#[derive(Debug)]
pub struct SourceFailure {
    pub url: String,
    pub error: FetchError,
}

/// Channel metadata for the feed being built.
#[derive(Debug, Clone, Default)]
pub struct FeedInfo {
    pub id: i64,
    pub title: String,
    pub link: String,
    pub description: String,
}

/// The merged timeline of one feed, plus any sources that could not be
/// fetched this time.
#[derive(Debug)]
pub struct AggregatedFeed {
    pub feed_id: i64,
    pub document: FeedDocument,
    pub failures: Vec<SourceFailure>,
}

impl AggregatedFeed {
    pub fn items(&self) -> &[NormalizedItem] {
        &self.document.items
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turns any source failure into an error for callers that will not
    /// serve partial content.
    pub fn require_complete(mut self) -> Result<Self, AggregateError> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        let first = self.failures.swap_remove(0);
        Err(AggregateError::SourceFetch {
            url: first.url,
            source: first.error,
        })
    }
}

pub struct Aggregator {
    fetcher: Fetcher,
    max_concurrent: usize,
}

impl Aggregator {
    pub fn new(fetcher: Fetcher, max_concurrent: usize) -> Self {
        Self {
            fetcher,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Fetches every source (at most `max_concurrent` at a time), concatenates
    /// their items in source order, and sorts the result newest first.
    ///
    /// No de-duplication is done. Items without timestamps end up last.
    pub async fn aggregate(&self, feed: &FeedInfo, sources: &[String]) -> AggregatedFeed {
        let fetcher = &self.fetcher;
        let results: Vec<(String, Result<FeedDocument, FetchError>)> =
            stream::iter(sources.iter().cloned())
                .map(|url: String| async move {
                    let result = fetcher.fetch(&url).await;
                    (url, result)
                })
                .buffered(self.max_concurrent)
                .collect()
                .await;

        let mut items = Vec::new();
        let mut failures = Vec::new();
        for (url, result) in results {
            match result {
                Ok(doc) => items.extend(doc.items),
                Err(error) => {
                    warn!(feed_id = feed.id, url = %url, error = %error, "Source fetch failed");
                    failures.push(SourceFailure { url, error });
                }
            }
        }

        sort_newest_first(&mut items);

        info!(
            feed_id = feed.id,
            sources = sources.len(),
            failed = failures.len(),
            items = items.len(),
            "Aggregated feed"
        );

        let updated = items.iter().find_map(NormalizedItem::sort_key);
        AggregatedFeed {
            feed_id: feed.id,
            document: FeedDocument {
                title: feed.title.clone(),
                link: feed.link.clone(),
                description: feed.description.clone(),
                author: None,
                created: None,
                updated,
                items,
            },
            failures,
        }
    }
}
