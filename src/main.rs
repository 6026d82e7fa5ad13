use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedmerge::aggregator::Aggregator;
use feedmerge::auth::AuthService;
use feedmerge::config::Config;
use feedmerge::db::Database;
use feedmerge::fetcher::Fetcher;
use feedmerge::mailer::{LogMailer, Mailer, SmtpMailer};
use feedmerge::pending::{spawn_expiry_sweeper, PendingRequests};
use feedmerge::routes::{self, AppState, Settings};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedmerge=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path =
        std::env::var("FEEDMERGE_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;
    info!(path = %config_path, site = %config.site_name, "Loaded configuration");

    // Initialize database
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| config.database_url.clone());
    let db = Database::new(&database_url).await?;
    db.initialize().await?;
    info!("Database initialized");

    let mailer: Arc<dyn Mailer> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpMailer::new(smtp)?),
        None => {
            warn!("No [smtp] section configured, validation codes will only be logged");
            Arc::new(LogMailer)
        }
    };

    let pending = Arc::new(PendingRequests::default());
    spawn_expiry_sweeper(pending.clone(), SWEEP_INTERVAL);

    let auth = AuthService::new(config.auth_config(), mailer, pending);
    let fetcher = Fetcher::new(&config.fetch)?;
    let aggregator = Aggregator::new(fetcher, config.fetch.max_concurrent);

    // Create app state
    let state = Arc::new(AppState {
        db: Arc::new(db),
        auth: Arc::new(auth),
        aggregator: Arc::new(aggregator),
        settings: Settings {
            site_name: config.site_name.clone(),
            cookie_secure: config.cookie_secure,
            session_max_age: config.auth.max_age(),
        },
    });

    let app = routes::router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("Server starting on http://{}", config.listen);

    axum::serve(listener, app).await?;

    Ok(())
}
