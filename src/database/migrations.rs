use crate::error::Result;
use sqlx::SqlitePool;
use tracing::info;

/// Run all schema migrations that have not been applied yet
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    create_migrations_table(pool).await?;

    for (version, name, statements) in MIGRATIONS {
        if !is_migration_applied(pool, *version).await? {
            info!(version, name, "Applying migration");

            for statement in *statements {
                sqlx::query(statement).execute(pool).await?;
            }

            record_migration(pool, *version, name).await?;
        }
    }

    Ok(())
}

/// Create the migrations tracking table
async fn create_migrations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Check if a migration has been applied
async fn is_migration_applied(pool: &SqlitePool, version: i64) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations WHERE version = ?")
            .bind(version)
            .fetch_one(pool)
            .await?;

    Ok(count > 0)
}

/// Record a migration as applied
async fn record_migration(pool: &SqlitePool, version: i64, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO schema_migrations (version, name) VALUES (?, ?)")
        .bind(version)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}

// SQLite executes one statement per prepared query, so each migration is a
// list of single statements rather than one script.
const MIGRATIONS: &[(i64, &str, &[&str])] = &[(
    1,
    "initial_schema",
    &[
        r#"
        CREATE TABLE IF NOT EXISTS proxies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip TEXT NOT NULL,
            port INTEGER NOT NULL,
            protocol TEXT NOT NULL,
            country TEXT,
            province TEXT,
            city TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 100,
            last_checked TEXT,
            UNIQUE (ip, port)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_proxies_priority ON proxies(priority)",
        "CREATE INDEX IF NOT EXISTS idx_proxies_country ON proxies(country)",
    ],
)];
