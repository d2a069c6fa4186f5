use crate::error::{PoolError, Result};
use crate::models::{GeoInfo, UpstreamProxy};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

const PROXY_COLUMNS: &str =
    "id, ip, port, protocol, country, province, city, is_active, priority, last_checked";

/// Priority assigned to every freshly discovered upstream
pub const INITIAL_PRIORITY: i64 = 100;

/// Repository for upstream proxy store operations.
///
/// Priority deltas are relative `UPDATE` statements, so concurrent
/// feedback from many forwarder tasks never loses an update.
#[derive(Clone)]
pub struct ProxyRepository {
    pool: SqlitePool,
    up_delta: i64,
    down_delta: i64,
}

impl ProxyRepository {
    pub fn new(pool: SqlitePool, up_delta: i64, down_delta: i64) -> Self {
        Self {
            pool,
            up_delta,
            down_delta,
        }
    }

    /// Insert a new upstream with the initial priority.
    ///
    /// Callers are expected to check `exists` first; a duplicate
    /// `(ip, port)` is reported as `AlreadyExists`.
    pub async fn insert(&self, ip: &str, port: u16, protocol: &str, geo: &GeoInfo) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO proxies (ip, port, protocol, country, province, city, is_active, priority, last_checked)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(ip)
        .bind(port)
        .bind(protocol)
        .bind(&geo.country)
        .bind(&geo.province)
        .bind(&geo.city)
        .bind(INITIAL_PRIORITY)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(ip, port, protocol, "Stored new upstream proxy");
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.message().contains("UNIQUE") => {
                Err(PoolError::AlreadyExists(format!("{}:{}", ip, port)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check whether an upstream with this identity is stored
    pub async fn exists(&self, ip: &str, port: u16) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM proxies WHERE ip = ? AND port = ?")
            .bind(ip)
            .bind(port)
            .fetch_one(&self.pool)
            .await?;

        Ok(count > 0)
    }

    /// Update location data of an existing upstream, preserving priority
    pub async fn update_geo(&self, ip: &str, port: u16, geo: &GeoInfo) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE proxies
            SET country = ?, province = ?, city = ?, last_checked = ?
            WHERE ip = ? AND port = ?
            "#,
        )
        .bind(&geo.country)
        .bind(&geo.province)
        .bind(&geo.city)
        .bind(Utc::now())
        .bind(ip)
        .bind(port)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Raise the priority of an upstream by the configured delta
    pub async fn increase_priority(&self, ip: &str, port: u16) -> Result<()> {
        self.apply_priority_delta(ip, port, self.up_delta).await
    }

    /// Lower the priority of an upstream by the configured delta
    pub async fn decrease_priority(&self, ip: &str, port: u16) -> Result<()> {
        self.apply_priority_delta(ip, port, -self.down_delta).await
    }

    async fn apply_priority_delta(&self, ip: &str, port: u16, delta: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE proxies
            SET priority = priority + ?, last_checked = ?
            WHERE ip = ? AND port = ?
            "#,
        )
        .bind(delta)
        .bind(Utc::now())
        .bind(ip)
        .bind(port)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete every upstream whose priority has dropped below zero
    pub async fn delete_low_priority(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM proxies WHERE priority < 0")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// All active upstreams, best first. Rows that have gone negative
    /// since the last eviction are not listed.
    pub async fn list_active_by_priority(&self) -> Result<Vec<UpstreamProxy>> {
        let proxies = sqlx::query_as::<_, UpstreamProxy>(&format!(
            r#"
            SELECT {PROXY_COLUMNS}
            FROM proxies
            WHERE is_active = 1 AND priority >= 0
            ORDER BY priority DESC
            "#,
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(proxies)
    }

    /// Up to `limit` active upstream URLs ordered by priority, optionally
    /// restricted to one country
    pub async fn list_active_urls_by_priority(
        &self,
        limit: u32,
        country: Option<&str>,
    ) -> Result<Vec<String>> {
        self.list_urls("priority DESC", limit, country).await
    }

    /// Up to `limit` active upstream URLs in random order, optionally
    /// restricted to one country
    pub async fn list_random_active_urls(
        &self,
        limit: u32,
        country: Option<&str>,
    ) -> Result<Vec<String>> {
        self.list_urls("RANDOM()", limit, country).await
    }

    async fn list_urls(&self, order: &str, limit: u32, country: Option<&str>) -> Result<Vec<String>> {
        let proxies = match country {
            Some(country) => {
                sqlx::query_as::<_, UpstreamProxy>(&format!(
                    r#"
                    SELECT {PROXY_COLUMNS}
                    FROM proxies
                    WHERE is_active = 1 AND priority >= 0 AND country = ?
                    ORDER BY {order}
                    LIMIT ?
                    "#,
                ))
                .bind(country)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, UpstreamProxy>(&format!(
                    r#"
                    SELECT {PROXY_COLUMNS}
                    FROM proxies
                    WHERE is_active = 1 AND priority >= 0
                    ORDER BY {order}
                    LIMIT ?
                    "#,
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(proxies.iter().map(UpstreamProxy::url).collect())
    }

    /// Total number of stored upstreams
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM proxies")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Number of upstreams located in China vs everywhere else
    pub async fn country_stats(&self) -> Result<(i64, i64)> {
        let (china, other): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN country = '中国' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN country IS NULL OR country != '中国' THEN 1 ELSE 0 END), 0)
            FROM proxies
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((china, other))
    }
}
