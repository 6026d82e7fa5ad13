use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};

#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub email: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct TokenData {
    pub token: String,
    pub user_id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct Feed {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Every connection to an in-memory database sees its own empty copy,
        // so there must be exactly one and it must never be recycled.
        let in_memory = database_url.contains(":memory:");

        let mut options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            options = options.idle_timeout(None).max_lifetime(None);
        }
        let pool = options.connect(database_url).await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                email TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                token TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                UNIQUE(user_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id),
                url TEXT NOT NULL,
                UNIQUE(feed_id, url)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tokens_user ON tokens(user_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT id, email FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user_by_id(&self, user_id: i64) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT id, email FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    /// Returns the user for `email`, creating it on first login.
    pub async fn get_or_create_user(&self, email: &str) -> anyhow::Result<User> {
        sqlx::query("INSERT INTO users (email) VALUES (?) ON CONFLICT(email) DO NOTHING")
            .bind(email)
            .execute(&self.pool)
            .await?;

        self.get_user_by_email(email)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user vanished after insert: {}", email))
    }

    pub async fn add_token(&self, user_id: i64, token: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO tokens (token, user_id, created_at) VALUES (?, ?, ?)")
            .bind(token)
            .bind(user_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Looks up a session token. Tokens older than `max_age` are treated as
    /// unknown.
    pub async fn get_token_data(
        &self,
        token: &str,
        max_age: chrono::Duration,
    ) -> anyhow::Result<Option<TokenData>> {
        let data = sqlx::query_as::<_, TokenData>(
            "SELECT token, user_id, created_at FROM tokens WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(data.filter(|d| {
            DateTime::parse_from_rfc3339(&d.created_at)
                .map(|created| Utc::now() - created.with_timezone(&Utc) < max_age)
                .unwrap_or(false)
        }))
    }

    pub async fn revoke_token(&self, token: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM tokens WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Creates a named feed. Fails if the user already has a feed by that name.
    pub async fn add_feed(&self, user_id: i64, name: &str) -> anyhow::Result<Feed> {
        if self.get_feed(user_id, name).await?.is_some() {
            anyhow::bail!("Feed exists");
        }

        let id = sqlx::query("INSERT INTO feeds (user_id, name) VALUES (?, ?)")
            .bind(user_id)
            .bind(name)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();

        Ok(Feed {
            id,
            user_id,
            name: name.to_string(),
        })
    }

    pub async fn get_feed(&self, user_id: i64, name: &str) -> anyhow::Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>(
            "SELECT id, user_id, name FROM feeds WHERE user_id = ? AND name = ?",
        )
        .bind(user_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    pub async fn get_feed_by_id(&self, feed_id: i64) -> anyhow::Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>("SELECT id, user_id, name FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    pub async fn get_feeds_by_user_id(&self, user_id: i64) -> anyhow::Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>(
            "SELECT id, user_id, name FROM feeds WHERE user_id = ? ORDER BY name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// Adds `url` to a feed. Adding the same URL twice is a no-op.
    pub async fn add_subscription(&self, feed_id: i64, url: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (feed_id, url) VALUES (?, ?)
            ON CONFLICT(feed_id, url) DO NOTHING
            "#,
        )
        .bind(feed_id)
        .bind(url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Source URLs of a feed in the order they were added.
    pub async fn get_subscription_urls(&self, feed_id: i64) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT url FROM subscriptions WHERE feed_id = ? ORDER BY id")
                .bind(feed_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(url,)| url).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_db() -> Database {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    fn year() -> chrono::Duration {
        chrono::Duration::days(365)
    }

    // Database initialization tests
    mod initialization_tests {
        use super::*;

        #[tokio::test]
        async fn test_database_creation() {
            let db = Database::new("sqlite::memory:").await;
            assert!(db.is_ok());
        }

        #[tokio::test]
        async fn test_double_initialization_is_safe() {
            let db = create_test_db().await;
            // Initialize again - should not fail due to IF NOT EXISTS
            let result = db.initialize().await;
            assert!(result.is_ok());
        }
    }

    mod user_tests {
        use super::*;

        #[tokio::test]
        async fn test_get_or_create_user_creates_once() {
            let db = create_test_db().await;

            let first = db.get_or_create_user("a@example.com").await.unwrap();
            let second = db.get_or_create_user("a@example.com").await.unwrap();

            assert_eq!(first, second);
            assert_eq!(first.email, "a@example.com");
        }

        #[tokio::test]
        async fn test_distinct_users() {
            let db = create_test_db().await;

            let a = db.get_or_create_user("a@example.com").await.unwrap();
            let b = db.get_or_create_user("b@example.com").await.unwrap();
            assert_ne!(a.id, b.id);
        }

        #[tokio::test]
        async fn test_lookup_missing_user() {
            let db = create_test_db().await;

            assert!(db.get_user_by_email("nobody@example.com").await.unwrap().is_none());
            assert!(db.get_user_by_id(42).await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_lookup_by_id() {
            let db = create_test_db().await;
            let user = db.get_or_create_user("a@example.com").await.unwrap();

            let found = db.get_user_by_id(user.id).await.unwrap();
            assert_eq!(found, Some(user));
        }
    }

    mod token_tests {
        use super::*;

        #[tokio::test]
        async fn test_token_lookup() {
            let db = create_test_db().await;
            let user = db.get_or_create_user("a@example.com").await.unwrap();
            db.add_token(user.id, "tok").await.unwrap();

            let data = db.get_token_data("tok", year()).await.unwrap().unwrap();
            assert_eq!(data.user_id, user.id);
        }

        #[tokio::test]
        async fn test_many_tokens_per_user() {
            let db = create_test_db().await;
            let user = db.get_or_create_user("a@example.com").await.unwrap();
            db.add_token(user.id, "laptop").await.unwrap();
            db.add_token(user.id, "phone").await.unwrap();

            assert!(db.get_token_data("laptop", year()).await.unwrap().is_some());
            assert!(db.get_token_data("phone", year()).await.unwrap().is_some());
        }

        #[tokio::test]
        async fn test_unknown_token() {
            let db = create_test_db().await;
            assert!(db.get_token_data("missing", year()).await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_expired_token() {
            let db = create_test_db().await;
            let user = db.get_or_create_user("a@example.com").await.unwrap();
            db.add_token(user.id, "tok").await.unwrap();

            let data = db.get_token_data("tok", chrono::Duration::zero()).await.unwrap();
            assert!(data.is_none());
        }

        #[tokio::test]
        async fn test_revoke_token() {
            let db = create_test_db().await;
            let user = db.get_or_create_user("a@example.com").await.unwrap();
            db.add_token(user.id, "tok").await.unwrap();

            assert!(db.revoke_token("tok").await.unwrap());
            assert!(!db.revoke_token("tok").await.unwrap());
            assert!(db.get_token_data("tok", year()).await.unwrap().is_none());
        }
    }

    mod feed_tests {
        use super::*;

        #[tokio::test]
        async fn test_add_and_get_feed() {
            let db = create_test_db().await;
            let user = db.get_or_create_user("a@example.com").await.unwrap();

            let feed = db.add_feed(user.id, "tech").await.unwrap();
            assert_eq!(db.get_feed(user.id, "tech").await.unwrap(), Some(feed.clone()));
            assert_eq!(db.get_feed_by_id(feed.id).await.unwrap(), Some(feed));
        }

        #[tokio::test]
        async fn test_duplicate_feed_name_rejected() {
            let db = create_test_db().await;
            let user = db.get_or_create_user("a@example.com").await.unwrap();

            db.add_feed(user.id, "tech").await.unwrap();
            let err = db.add_feed(user.id, "tech").await.unwrap_err();
            assert_eq!(err.to_string(), "Feed exists");
        }

        #[tokio::test]
        async fn test_same_name_different_users() {
            let db = create_test_db().await;
            let a = db.get_or_create_user("a@example.com").await.unwrap();
            let b = db.get_or_create_user("b@example.com").await.unwrap();

            let fa = db.add_feed(a.id, "tech").await.unwrap();
            let fb = db.add_feed(b.id, "tech").await.unwrap();
            assert_ne!(fa.id, fb.id);

            assert_eq!(db.get_feed(b.id, "tech").await.unwrap(), Some(fb));
        }

        #[tokio::test]
        async fn test_feeds_listed_by_user() {
            let db = create_test_db().await;
            let a = db.get_or_create_user("a@example.com").await.unwrap();
            let b = db.get_or_create_user("b@example.com").await.unwrap();
            db.add_feed(a.id, "zeta").await.unwrap();
            db.add_feed(a.id, "alpha").await.unwrap();
            db.add_feed(b.id, "other").await.unwrap();

            let feeds = db.get_feeds_by_user_id(a.id).await.unwrap();
            let names: Vec<_> = feeds.iter().map(|f| f.name.as_str()).collect();
            assert_eq!(names, vec!["alpha", "zeta"]);
        }
    }

    mod subscription_tests {
        use super::*;

        #[tokio::test]
        async fn test_subscriptions_keep_insertion_order() {
            let db = create_test_db().await;
            let user = db.get_or_create_user("a@example.com").await.unwrap();
            let feed = db.add_feed(user.id, "tech").await.unwrap();

            db.add_subscription(feed.id, "https://z.example.com/rss").await.unwrap();
            db.add_subscription(feed.id, "https://a.example.com/rss").await.unwrap();

            let urls = db.get_subscription_urls(feed.id).await.unwrap();
            assert_eq!(
                urls,
                vec!["https://z.example.com/rss", "https://a.example.com/rss"]
            );
        }

        #[tokio::test]
        async fn test_duplicate_subscription_ignored() {
            let db = create_test_db().await;
            let user = db.get_or_create_user("a@example.com").await.unwrap();
            let feed = db.add_feed(user.id, "tech").await.unwrap();

            db.add_subscription(feed.id, "https://a.example.com/rss").await.unwrap();
            db.add_subscription(feed.id, "https://a.example.com/rss").await.unwrap();

            assert_eq!(db.get_subscription_urls(feed.id).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_empty_feed_has_no_subscriptions() {
            let db = create_test_db().await;
            let user = db.get_or_create_user("a@example.com").await.unwrap();
            let feed = db.add_feed(user.id, "tech").await.unwrap();

            assert!(db.get_subscription_urls(feed.id).await.unwrap().is_empty());
        }
    }
}
