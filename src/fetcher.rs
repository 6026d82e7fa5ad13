use std::time::Duration;

use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Feed, Link, Person};
use feed_rs::parser;
use reqwest::{Client, Url};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::FetchConfig;
use crate::model::{Author, FeedDocument, NormalizedItem};

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid source URL '{0}'")]
    InvalidUrl(String),

    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error: status {0}")]
    HttpStatus(u16),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("response too large")]
    ResponseTooLarge,

    #[error("parse error: {0}")]
    Parse(String),
}

/// Retrieves one remote feed and normalizes it.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            client,
            timeout: config.timeout(),
        })
    }

    /// Downloads `url` and parses it as RSS, Atom or JSON Feed. The whole
    /// request, body included, is bounded by the configured timeout.
    pub async fn fetch(&self, url: &str) -> Result<FeedDocument, FetchError> {
        let url = validate_source_url(url)?;
        debug!(url = %url, "Fetching source");

        let bytes = tokio::time::timeout(self.timeout, self.download(url.clone()))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;

        let document = parse_document(&bytes)?;
        info!(url = %url, items = document.items.len(), "Fetched source");
        Ok(document)
    }

    async fn download(&self, url: Url) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }
        if response.content_length().unwrap_or(0) > MAX_FEED_SIZE as u64 {
            return Err(FetchError::ResponseTooLarge);
        }

        let bytes = response.bytes().await?;
        if bytes.len() > MAX_FEED_SIZE {
            return Err(FetchError::ResponseTooLarge);
        }
        Ok(bytes.to_vec())
    }
}

/// Accepts only absolute http(s) URLs.
pub fn validate_source_url(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url.trim()).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host().is_some() => Ok(parsed),
        _ => Err(FetchError::InvalidUrl(url.to_string())),
    }
}

/// Parses a feed document and normalizes every entry.
///
/// Entry authors fall back to the feed's author, then to
/// [`UNKNOWN_AUTHOR`](crate::model::UNKNOWN_AUTHOR).
pub fn parse_document(bytes: &[u8]) -> Result<FeedDocument, FetchError> {
    let feed = parser::parse(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
    Ok(normalize_feed(feed))
}

pub fn normalize_feed(feed: Feed) -> FeedDocument {
    let feed_author = feed.authors.first().map(to_author);

    let items = feed
        .entries
        .into_iter()
        .map(|entry| normalize_entry(entry, feed_author.as_ref()))
        .collect();

    FeedDocument {
        title: feed.title.map(|t| t.content).unwrap_or_default(),
        link: primary_link(&feed.links).unwrap_or_default(),
        description: feed.description.map(|d| d.content).unwrap_or_default(),
        author: feed_author,
        created: feed.published,
        updated: feed.updated,
        items,
    }
}

pub fn normalize_entry(entry: Entry, feed_author: Option<&Author>) -> NormalizedItem {
    let author = entry
        .authors
        .first()
        .map(to_author)
        .or_else(|| feed_author.cloned())
        .unwrap_or_else(Author::unknown);

    let published: Option<DateTime<Utc>> = entry.published;

    NormalizedItem {
        title: entry
            .title
            .map(|t| t.content)
            .unwrap_or_else(|| "Untitled".to_string()),
        link: primary_link(&entry.links).unwrap_or_default(),
        description: entry.summary.map(|s| s.content).unwrap_or_default(),
        content: entry.content.and_then(|c| c.body),
        author,
        published,
        updated: entry.updated,
    }
}

/// The `alternate` (or unlabelled) link if there is one, else the first link.
fn primary_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |r| r.eq_ignore_ascii_case("alternate")))
        .or_else(|| links.first())
        .map(|l| l.href.clone())
}

fn to_author(person: &Person) -> Author {
    let name = person.name.trim();
    Author {
        name: if name.is_empty() {
            person.email.clone().unwrap_or_default()
        } else {
            name.to_string()
        },
        email: person.email.clone(),
    }
}
