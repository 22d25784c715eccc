use std::env;

use codemonitor::{
    notify::{
        email::{Email, Mailer},
        Error as NotifyError,
    },
    search::{self, Actor, Content, Match, MatchPreview, Range, Searcher},
    Config, Engine, Metrics, MonitorId,
};
use jiff::Timestamp;
use sqlx::PgPool;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Reports one fresh diff match for every query.
struct CannedSearch;

impl Searcher for CannedSearch {
    async fn search(
        &self,
        actor: Actor,
        query: &str,
        monitor_id: MonitorId,
    ) -> Result<Vec<Match>, search::Error> {
        tracing::info!(user.id = actor.user_id, monitor.id = monitor_id, query, "Searching");

        Ok(vec![Match {
            repository: "github.com/example/repo".to_string(),
            commit: "0123456789abcdef0123456789abcdef01234567".to_string(),
            timestamp: Some(Timestamp::now()),
            preview: MatchPreview::Diff(Content {
                content: "main.go main.go\n@@ -1 +1 @@\n-old\n+TODO\n".to_string(),
                ranges: vec![Range { start: 34, end: 38 }],
            }),
        }])
    }
}

/// Logs emails instead of sending them.
struct LogMailer;

impl Mailer for LogMailer {
    async fn send(&self, email: Email) -> Result<(), NotifyError> {
        tracing::info!(to = ?email.to, subject = %email.subject, "Sending email");
        tracing::debug!(body = %email.text);
        Ok(())
    }
}

async fn seed_monitor(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let (monitor_id,): (i64,) = sqlx::query_as(
        r#"
        insert into codemonitor.monitor (owner_id, owner_name, description, query)
        values (1, 'demo', 'New TODOs', 'TODO type:diff patternType:literal')
        returning id
        "#,
    )
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        insert into codemonitor.email_action (monitor_id, include_results, recipients)
        values ($1, true, array['demo@example.com'])
        "#,
    )
    .bind(monitor_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(monitor_id)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the tracing subscriber.
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "info,codemonitor=debug,sqlx=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    // Set up the database connection pool.
    let database_url = &env::var("DATABASE_URL")?;
    let pool = PgPool::connect(database_url).await?;

    // Run migrations.
    codemonitor::MIGRATOR.run(&pool).await?;

    let monitor_id = seed_monitor(&pool).await?;
    tracing::info!(monitor.id = monitor_id, "Created demo monitor");

    let config: Config = serde_json::from_str(
        r#"{
            "external_url": "https://sourcegraph.example.com",
            "trigger_interval": "PT1M",
            "enqueue_interval": "PT5S"
        }"#,
    )?;
    let metrics = Metrics::register(prometheus::default_registry())?;

    let engine = Engine::with_pool(pool, CannedSearch, LogMailer, config, metrics)?;
    let handle = engine.start()?;

    signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    handle.shutdown().await?;

    let encoder = prometheus::TextEncoder::new();
    println!("{}", encoder.encode_to_string(&prometheus::gather())?);

    Ok(())
}
