//! Renders a [`FeedDocument`] as RSS 2.0, Atom 1.0 or JSON Feed 1.1.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::Serialize;
use thiserror::Error;

use crate::model::{Author, FeedDocument, NormalizedItem};

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("XML write error: {0}")]
    Xml(String),

    #[error("JSON write error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("output is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Rss,
    Atom,
    Json,
}

impl OutputFormat {
    /// Case-sensitive; anything other than `rss` or `json` selects Atom.
    pub fn from_selector(selector: &str) -> Self {
        match selector {
            "rss" => Self::Rss,
            "json" => Self::Json,
            _ => Self::Atom,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Rss => "application/rss+xml; charset=utf-8",
            Self::Atom => "application/atom+xml; charset=utf-8",
            Self::Json => "application/feed+json; charset=utf-8",
        }
    }
}

pub fn render(feed: &FeedDocument, format: OutputFormat) -> Result<String, FormatError> {
    match format {
        OutputFormat::Rss => to_rss(feed),
        OutputFormat::Atom => to_atom(feed),
        OutputFormat::Json => to_json(feed),
    }
}

pub fn render_selector(feed: &FeedDocument, selector: &str) -> Result<String, FormatError> {
    render(feed, OutputFormat::from_selector(selector))
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn emit(writer: &mut XmlWriter, event: Event<'_>) -> Result<(), FormatError> {
    writer
        .write_event(event)
        .map_err(|e| FormatError::Xml(e.to_string()))
}

fn text_element(writer: &mut XmlWriter, name: &str, text: &str) -> Result<(), FormatError> {
    emit(writer, Event::Start(BytesStart::new(name)))?;
    emit(writer, Event::Text(BytesText::new(text)))?;
    emit(writer, Event::End(BytesEnd::new(name)))
}

fn finish(writer: XmlWriter) -> Result<String, FormatError> {
    Ok(String::from_utf8(writer.into_inner().into_inner())?)
}

fn new_writer() -> Result<XmlWriter, FormatError> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    emit(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
    )?;
    Ok(writer)
}

/// RSS author element: `email (name)`, or just the name without an email.
fn rss_author(author: &Author) -> String {
    match &author.email {
        Some(email) => format!("{} ({})", email, author.name),
        None => author.name.clone(),
    }
}

fn to_rss(feed: &FeedDocument) -> Result<String, FormatError> {
    let mut writer = new_writer()?;

    let mut rss = BytesStart::new("rss");
    rss.push_attribute(("version", "2.0"));
    rss.push_attribute(("xmlns:content", "http://purl.org/rss/1.0/modules/content/"));
    emit(&mut writer, Event::Start(rss))?;
    emit(&mut writer, Event::Start(BytesStart::new("channel")))?;

    text_element(&mut writer, "title", &feed.title)?;
    text_element(&mut writer, "link", &feed.link)?;
    text_element(&mut writer, "description", &feed.description)?;
    // managingEditor must carry an email address.
    if let Some(author) = feed.author.as_ref().filter(|a| a.email.is_some()) {
        text_element(&mut writer, "managingEditor", &rss_author(author))?;
    }
    if let Some(created) = feed.created {
        text_element(&mut writer, "pubDate", &created.to_rfc2822())?;
    }
    if let Some(updated) = feed.updated {
        text_element(&mut writer, "lastBuildDate", &updated.to_rfc2822())?;
    }

    for item in &feed.items {
        emit(&mut writer, Event::Start(BytesStart::new("item")))?;
        text_element(&mut writer, "title", &item.title)?;
        text_element(&mut writer, "link", &item.link)?;
        text_element(&mut writer, "description", &item.description)?;
        if let Some(content) = &item.content {
            text_element(&mut writer, "content:encoded", content)?;
        }
        text_element(&mut writer, "author", &rss_author(&item.author))?;
        if !item.link.is_empty() {
            let mut guid = BytesStart::new("guid");
            guid.push_attribute(("isPermaLink", "false"));
            emit(&mut writer, Event::Start(guid))?;
            emit(&mut writer, Event::Text(BytesText::new(&item.link)))?;
            emit(&mut writer, Event::End(BytesEnd::new("guid")))?;
        }
        if let Some(published) = item.sort_key() {
            text_element(&mut writer, "pubDate", &published.to_rfc2822())?;
        }
        emit(&mut writer, Event::End(BytesEnd::new("item")))?;
    }

    emit(&mut writer, Event::End(BytesEnd::new("channel")))?;
    emit(&mut writer, Event::End(BytesEnd::new("rss")))?;
    finish(writer)
}

fn atom_link(writer: &mut XmlWriter, href: &str) -> Result<(), FormatError> {
    let mut link = BytesStart::new("link");
    link.push_attribute(("href", href));
    link.push_attribute(("rel", "alternate"));
    emit(writer, Event::Empty(link))
}

fn atom_author(writer: &mut XmlWriter, author: &Author) -> Result<(), FormatError> {
    emit(writer, Event::Start(BytesStart::new("author")))?;
    text_element(writer, "name", &author.name)?;
    if let Some(email) = &author.email {
        text_element(writer, "email", email)?;
    }
    emit(writer, Event::End(BytesEnd::new("author")))
}

fn atom_html(writer: &mut XmlWriter, name: &str, html: &str) -> Result<(), FormatError> {
    let mut start = BytesStart::new(name);
    start.push_attribute(("type", "html"));
    emit(writer, Event::Start(start))?;
    emit(writer, Event::Text(BytesText::new(html)))?;
    emit(writer, Event::End(BytesEnd::new(name)))
}

fn rfc3339(ts: Option<DateTime<Utc>>) -> String {
    ts.unwrap_or(DateTime::<Utc>::UNIX_EPOCH).to_rfc3339()
}

fn item_id(item: &NormalizedItem, index: usize) -> String {
    if item.link.is_empty() {
        format!("urn:item:{}", index)
    } else {
        item.link.clone()
    }
}

/// The feed's link, or a `urn:` built from its title when it has none.
fn feed_id(feed: &FeedDocument) -> String {
    if !feed.link.is_empty() {
        return feed.link.clone();
    }
    let slug: String = feed
        .title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    if slug.is_empty() {
        "urn:feed:untitled".to_string()
    } else {
        format!("urn:feed:{}", slug)
    }
}

fn to_atom(feed: &FeedDocument) -> Result<String, FormatError> {
    let mut writer = new_writer()?;

    let mut root = BytesStart::new("feed");
    root.push_attribute(("xmlns", "http://www.w3.org/2005/Atom"));
    emit(&mut writer, Event::Start(root))?;

    text_element(&mut writer, "title", &feed.title)?;
    text_element(&mut writer, "id", &feed_id(feed))?;
    text_element(&mut writer, "updated", &rfc3339(feed.latest_timestamp()))?;
    if !feed.link.is_empty() {
        atom_link(&mut writer, &feed.link)?;
    }
    if !feed.description.is_empty() {
        text_element(&mut writer, "subtitle", &feed.description)?;
    }
    if let Some(author) = &feed.author {
        atom_author(&mut writer, author)?;
    }

    for (index, item) in feed.items.iter().enumerate() {
        emit(&mut writer, Event::Start(BytesStart::new("entry")))?;
        text_element(&mut writer, "title", &item.title)?;
        text_element(&mut writer, "id", &item_id(item, index))?;
        text_element(&mut writer, "updated", &rfc3339(item.updated.or(item.published)))?;
        if let Some(published) = item.published {
            text_element(&mut writer, "published", &published.to_rfc3339())?;
        }
        if !item.link.is_empty() {
            atom_link(&mut writer, &item.link)?;
        }
        atom_html(&mut writer, "summary", &item.description)?;
        if let Some(content) = &item.content {
            atom_html(&mut writer, "content", content)?;
        }
        atom_author(&mut writer, &item.author)?;
        emit(&mut writer, Event::End(BytesEnd::new("entry")))?;
    }

    emit(&mut writer, Event::End(BytesEnd::new("feed")))?;
    finish(writer)
}

const JSON_FEED_VERSION: &str = "https://jsonfeed.org/version/1.1";

#[derive(Serialize)]
struct JsonFeed<'a> {
    version: &'static str,
    title: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    home_page_url: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    description: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    authors: Vec<JsonAuthor<'a>>,
    items: Vec<JsonItem<'a>>,
}

#[derive(Serialize)]
struct JsonAuthor<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
}

#[derive(Serialize)]
struct JsonItem<'a> {
    id: String,
    #[serde(skip_serializing_if = "str::is_empty")]
    url: &'a str,
    title: &'a str,
    summary: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_html: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    date_published: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    date_modified: Option<DateTime<Utc>>,
    authors: Vec<JsonAuthor<'a>>,
}

impl<'a> From<&'a Author> for JsonAuthor<'a> {
    fn from(author: &'a Author) -> Self {
        Self {
            name: &author.name,
            url: author.email.as_ref().map(|e| format!("mailto:{}", e)),
        }
    }
}

fn to_json(feed: &FeedDocument) -> Result<String, FormatError> {
    let items = feed
        .items
        .iter()
        .enumerate()
        .map(|(index, item)| JsonItem {
            id: item_id(item, index),
            url: &item.link,
            title: &item.title,
            summary: &item.description,
            content_html: item.content.as_deref(),
            // Every item needs content; fall back to the description.
            content_text: item.content.is_none().then_some(item.description.as_str()),
            date_published: item.published,
            date_modified: item.updated,
            authors: vec![JsonAuthor::from(&item.author)],
        })
        .collect();

    let json = JsonFeed {
        version: JSON_FEED_VERSION,
        title: &feed.title,
        home_page_url: &feed.link,
        description: &feed.description,
        authors: feed.author.iter().map(JsonAuthor::from).collect(),
        items,
    };

    Ok(serde_json::to_string_pretty(&json)?)
}
