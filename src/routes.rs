use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Form, Path, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use reqwest::Url;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::aggregator::{AggregatedFeed, Aggregator, FeedInfo};
use crate::auth::{AuthError, AuthService};
use crate::convert::{self, OutputFormat};
use crate::db::{Database, Feed};
use crate::fetcher::{validate_source_url, FetchError};
use crate::model::NormalizedItem;

pub const SESSION_COOKIE: &str = "access_token";
pub const RETURN_COOKIE: &str = "return_page";

pub struct Settings {
    pub site_name: String,
    pub cookie_secure: bool,
    pub session_max_age: chrono::Duration,
}

pub struct AppState {
    pub db: Arc<Database>,
    pub auth: Arc<AuthService>,
    pub aggregator: Arc<Aggregator>,
    pub settings: Settings,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/login", get(login_page).post(login))
        .route("/verify", post(verify))
        .route("/logout", post(logout))
        .route("/feeds", get(list_feeds).post(create_feed))
        .route("/feeds/:name", get(show_feed))
        .route("/feeds/:name/subscriptions", post(add_subscription))
        .route("/feeds/:name/:format", get(export_feed))
        .route("/convert/:format/*url", get(convert_source))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Template structs
#[derive(Template)]
#[template(path = "login.html")]
pub struct LoginTemplate {
    pub site_name: String,
}

#[derive(Template)]
#[template(path = "verify.html")]
pub struct VerifyTemplate {
    pub site_name: String,
    pub email: String,
    pub request_id: String,
}

#[derive(Template)]
#[template(path = "feeds.html")]
pub struct FeedsTemplate {
    pub site_name: String,
    pub email: String,
    pub feeds: Vec<FeedLink>,
}

pub struct FeedLink {
    pub name: String,
    pub path: String,
}

#[derive(Template)]
#[template(path = "feed.html")]
pub struct FeedTemplate {
    pub site_name: String,
    pub name: String,
    pub path: String,
    pub sources: Vec<String>,
    pub failures: Vec<FailureView>,
    pub items: Vec<ItemView>,
}

pub struct FailureView {
    pub url: String,
    pub error: String,
}

pub struct ItemView {
    pub title: String,
    pub link: String,
    pub author: String,
    pub published: String,
    pub description: String,
}

impl From<&NormalizedItem> for ItemView {
    fn from(item: &NormalizedItem) -> Self {
        Self {
            title: item.title.clone(),
            // Remote feeds are untrusted; only http(s) links become anchors.
            link: validate_source_url(&item.link)
                .map(|_| item.link.clone())
                .unwrap_or_default(),
            author: item.author.name.clone(),
            published: item
                .sort_key()
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "undated".to_string()),
            description: item.description.clone(),
        }
    }
}

// Wrapper for HTML responses
struct HtmlTemplate<T>(T);

impl<T: Template> IntoResponse for HtmlTemplate<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template: {}", err),
            )
                .into_response(),
        }
    }
}

pub enum AppError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Auth(AuthError),
    Upstream(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Auth(AuthError::AuthenticationFailed) => (
                StatusCode::BAD_REQUEST,
                AuthError::AuthenticationFailed.to_string(),
            ),
            AppError::Auth(AuthError::Mail(e)) => {
                warn!(error = %e, "Validation email could not be sent");
                (
                    StatusCode::BAD_GATEWAY,
                    "Could not send validation email".to_string(),
                )
            }
            AppError::Auth(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)),
        };
        (status, message).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError::Internal(err.into())
    }
}

/// Path of a feed page with the name percent-encoded.
pub fn feed_path(name: &str) -> String {
    let Ok(mut url) = Url::parse("http://localhost/") else {
        return format!("/feeds/{}", name);
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.push("feeds").push(name);
    }
    url.path().to_string()
}

/// Scheme and host the client used to reach us, honouring reverse proxies.
fn public_base(headers: &HeaderMap) -> String {
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    format!("https://{}", host)
}

fn session_token(jar: &CookieJar, headers: &HeaderMap) -> Option<String> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        return Some(cookie.value().to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
}

async fn session_user_id(
    state: &AppState,
    jar: &CookieJar,
    headers: &HeaderMap,
) -> anyhow::Result<Option<i64>> {
    let Some(token) = session_token(jar, headers) else {
        return Ok(None);
    };
    let data = state
        .db
        .get_token_data(&token, state.settings.session_max_age)
        .await?;
    Ok(data.map(|d| d.user_id))
}

/// Remembers where the user was headed and sends them to the login page.
fn login_redirect(jar: CookieJar, uri: &Uri) -> Response {
    let target = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let cookie = Cookie::build((RETURN_COOKIE, target))
        .http_only(true)
        .same_site(SameSite::Strict)
        .path("/")
        .max_age(time::Duration::days(1));

    (jar.add(cookie), Redirect::to("/login")).into_response()
}

/// Only same-site absolute paths are followed after login.
fn safe_return_path(jar: &CookieJar) -> String {
    jar.get(RETURN_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|p| p.starts_with('/') && !p.starts_with("//"))
        .unwrap_or_else(|| "/".to_string())
}

async fn owned_feed(state: &AppState, user_id: i64, name: &str) -> Result<Feed, AppError> {
    state
        .db
        .get_feed(user_id, name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No feed named '{}'", name)))
}

async fn aggregate_feed(
    state: &AppState,
    headers: &HeaderMap,
    feed: &Feed,
) -> Result<(AggregatedFeed, Vec<String>), AppError> {
    let sources = state.db.get_subscription_urls(feed.id).await?;
    let info = FeedInfo {
        id: feed.id,
        title: feed.name.clone(),
        link: format!("{}{}", public_base(headers), feed_path(&feed.name)),
        description: format!("{} on {}", feed.name, state.settings.site_name),
    };
    let aggregated = state.aggregator.aggregate(&info, &sources).await;
    Ok((aggregated, sources))
}

// Route handlers
pub async fn index(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, AppError> {
    match session_user_id(&state, &jar, &headers).await? {
        Some(_) => Ok(Redirect::to("/feeds").into_response()),
        None => Ok(login_redirect(jar, &uri)),
    }
}

pub async fn login_page(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    HtmlTemplate(LoginTemplate {
        site_name: state.settings.site_name.clone(),
    })
}

#[derive(Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub email: String,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Form(form): Form<LoginForm>,
) -> Result<impl IntoResponse, AppError> {
    let email = form.email.trim();
    if email.is_empty() {
        return Err(AppError::BadRequest("email param missing".to_string()));
    }

    let request_id = state
        .auth
        .start_email_validation(email)
        .await
        .map_err(AppError::Auth)?;

    Ok(HtmlTemplate(VerifyTemplate {
        site_name: state.settings.site_name.clone(),
        email: email.to_string(),
        request_id,
    }))
}

#[derive(Deserialize)]
pub struct VerifyForm {
    #[serde(rename = "request-id", default)]
    pub request_id: String,
    #[serde(default)]
    pub code: String,
}

pub async fn verify(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(form): Form<VerifyForm>,
) -> Result<Response, AppError> {
    if form.request_id.is_empty() {
        return Err(AppError::BadRequest("request-id param missing".to_string()));
    }
    if form.code.is_empty() {
        return Err(AppError::BadRequest("code param missing".to_string()));
    }

    let session = state
        .auth
        .complete_email_validation(&form.request_id, form.code.trim())
        .await
        .map_err(AppError::Auth)?;

    let user = state.db.get_or_create_user(&session.email).await?;
    state.db.add_token(user.id, &session.token).await?;
    info!(user_id = user.id, "User logged in");

    let return_to = safe_return_path(&jar);
    let max_age = time::Duration::seconds(state.settings.session_max_age.num_seconds());
    let cookie = Cookie::build((SESSION_COOKIE, session.token))
        .http_only(true)
        .secure(state.settings.cookie_secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(max_age);

    let jar = jar
        .add(cookie)
        .remove(Cookie::build(RETURN_COOKIE).path("/"));

    Ok((jar, Redirect::to(&return_to)).into_response())
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if let Some(token) = session_token(&jar, &headers) {
        state.db.revoke_token(&token).await?;
    }
    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/"));
    Ok((jar, Redirect::to("/login")).into_response())
}

pub async fn list_feeds(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, AppError> {
    let Some(user_id) = session_user_id(&state, &jar, &headers).await? else {
        return Ok(login_redirect(jar, &uri));
    };

    let user = state
        .db
        .get_user_by_id(user_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("session refers to missing user {}", user_id))?;
    let feeds = state.db.get_feeds_by_user_id(user_id).await?;

    Ok(HtmlTemplate(FeedsTemplate {
        site_name: state.settings.site_name.clone(),
        email: user.email,
        feeds: feeds
            .into_iter()
            .map(|f| FeedLink {
                path: feed_path(&f.name),
                name: f.name,
            })
            .collect(),
    })
    .into_response())
}

#[derive(Deserialize)]
pub struct NewFeedForm {
    #[serde(rename = "feed-name", default)]
    pub feed_name: String,
}

pub async fn create_feed(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    uri: Uri,
    Form(form): Form<NewFeedForm>,
) -> Result<Response, AppError> {
    let Some(user_id) = session_user_id(&state, &jar, &headers).await? else {
        return Ok(login_redirect(jar, &uri));
    };

    let name = form.feed_name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("Blank feed-name".to_string()));
    }
    if name.contains('/') {
        return Err(AppError::BadRequest("feed-name may not contain '/'".to_string()));
    }
    if state.db.get_feed(user_id, name).await?.is_some() {
        return Err(AppError::BadRequest("Feed exists".to_string()));
    }

    let feed = state.db.add_feed(user_id, name).await?;
    info!(user_id, feed_id = feed.id, "Feed created");
    Ok(Redirect::to(&feed_path(&feed.name)).into_response())
}

pub async fn show_feed(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    uri: Uri,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let Some(user_id) = session_user_id(&state, &jar, &headers).await? else {
        return Ok(login_redirect(jar, &uri));
    };

    let feed = owned_feed(&state, user_id, &name).await?;
    let (aggregated, sources) = aggregate_feed(&state, &headers, &feed).await?;

    Ok(HtmlTemplate(FeedTemplate {
        site_name: state.settings.site_name.clone(),
        path: feed_path(&feed.name),
        name: feed.name,
        sources,
        failures: aggregated
            .failures
            .iter()
            .map(|f| FailureView {
                url: f.url.clone(),
                error: f.error.to_string(),
            })
            .collect(),
        items: aggregated.items().iter().map(ItemView::from).collect(),
    })
    .into_response())
}

#[derive(Deserialize)]
pub struct SubscriptionForm {
    #[serde(default)]
    pub url: String,
}

pub async fn add_subscription(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    uri: Uri,
    Path(name): Path<String>,
    Form(form): Form<SubscriptionForm>,
) -> Result<Response, AppError> {
    let Some(user_id) = session_user_id(&state, &jar, &headers).await? else {
        return Ok(login_redirect(jar, &uri));
    };

    let feed = owned_feed(&state, user_id, &name).await?;
    let url = validate_source_url(&form.url).map_err(|e| AppError::BadRequest(e.to_string()))?;

    state.db.add_subscription(feed.id, url.as_str()).await?;
    info!(feed_id = feed.id, url = %url, "Subscription added");
    Ok(Redirect::to(&feed_path(&feed.name)).into_response())
}

fn feed_response(body: String, format: OutputFormat, failed_sources: usize) -> Response {
    (
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::HeaderName::from_static("x-failed-sources"),
                failed_sources.to_string(),
            ),
        ],
        body,
    )
        .into_response()
}

pub async fn export_feed(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    Path((name, format)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let user_id = session_user_id(&state, &jar, &headers)
        .await?
        .ok_or(AppError::Unauthorized)?;

    let feed = owned_feed(&state, user_id, &name).await?;
    let (aggregated, _) = aggregate_feed(&state, &headers, &feed).await?;

    let format = OutputFormat::from_selector(&format);
    let body = convert::render(&aggregated.document, format)?;
    Ok(feed_response(body, format, aggregated.failures.len()))
}

/// Splits the `/convert` path into the source URL and output format. A
/// first segment that is not a format name is the source's host.
pub fn convert_source_url(selector: &str, rest: &str) -> (String, OutputFormat) {
    match selector {
        "rss" | "json" | "atom" => (
            format!("https://{}", rest),
            OutputFormat::from_selector(selector),
        ),
        host => (format!("https://{}/{}", host, rest), OutputFormat::Atom),
    }
}

/// Re-emits a single remote feed. `/convert/rss/example.com/feed.xml`
/// fetches `https://example.com/feed.xml` and renders it as RSS. When the
/// first segment is not a known format it is part of the host and the
/// output is Atom.
pub async fn convert_source(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    Path((selector, rest)): Path<(String, String)>,
) -> Result<Response, AppError> {
    session_user_id(&state, &jar, &headers)
        .await?
        .ok_or(AppError::Unauthorized)?;

    let (source, format) = convert_source_url(&selector, &rest);

    let document = state
        .aggregator
        .fetcher()
        .fetch(&source)
        .await
        .map_err(|e| match e {
            FetchError::InvalidUrl(_) => AppError::BadRequest(e.to_string()),
            other => AppError::Upstream(other.to_string()),
        })?;

    let body = convert::render(&document, format)?;
    Ok(feed_response(body, format, 0))
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}
