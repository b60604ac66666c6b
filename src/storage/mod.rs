//! SQLite persistence.
//!
//! History only: sessions at shutdown, bans as they are applied and hourly
//! statistics. Nothing here is load-bearing for live enforcement; a lost
//! database produces a forgetful daemon, not a broken one.

pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::enforcer::types::BanRecord;
use crate::monitor::types::Session;

/// One hourly statistics row for a port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortStatistics {
    pub hour: DateTime<Utc>,
    pub unique_ips: u32,
    pub total_bans: u32,
    pub avg_sessions: f64,
    pub max_sessions: u32,
}

pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the database and run the schema statements.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create database directory {}", dir.display()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database {}", path.display()))?;

        for statement in schema::ALL_STATEMENTS {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("failed to create database schema")?;
        }

        tracing::info!("database ready: {}", path.display());

        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub async fn close(&self) {
        tracing::info!("closing database");
        self.pool.close().await;
    }

    pub async fn record_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (port, ip, first_seen_at, last_seen_at, connection_num, total_bytes)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(session.port)
        .bind(session.ip.to_string())
        .bind(session.first_seen_at)
        .bind(session.last_seen_at)
        .bind(session.connection_num as i64)
        .bind(session.total_bytes as i64)
        .execute(&self.pool)
        .await
        .context("failed to record session")?;

        Ok(())
    }

    pub async fn record_ban(&self, record: &BanRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO ban_history (port, ip, banned_at, expire_at, duration, strategy, reason)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.port)
        .bind(record.ip.to_string())
        .bind(record.banned_at)
        .bind(record.expire_at)
        .bind(record.duration as i64)
        .bind(&record.strategy)
        .bind(&record.reason)
        .execute(&self.pool)
        .await
        .context("failed to record ban")?;

        Ok(())
    }

    /// Most recent bans for a port, newest first.
    pub async fn ban_history(&self, port: u16, limit: u32) -> Result<Vec<BanRecord>> {
        let rows = sqlx::query(
            "SELECT ip, port, banned_at, expire_at, duration, strategy, reason
             FROM ban_history
             WHERE port = ?
             ORDER BY banned_at DESC
             LIMIT ?",
        )
        .bind(port)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to query ban history")?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let ip_text: String = row.try_get("ip")?;
            let ip: IpAddr = ip_text
                .parse()
                .with_context(|| format!("invalid IP in ban_history: {ip_text}"))?;

            records.push(BanRecord {
                ip,
                port: row.try_get::<i64, _>("port")? as u16,
                banned_at: row.try_get("banned_at")?,
                expire_at: row.try_get("expire_at")?,
                duration: row.try_get::<i64, _>("duration")? as u64,
                strategy: row.try_get("strategy")?,
                reason: row.try_get::<Option<String>, _>("reason")?.unwrap_or_default(),
            });
        }

        Ok(records)
    }

    /// Upsert the statistics row for (port, hour).
    pub async fn record_statistics(&self, port: u16, stats: &PortStatistics) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO statistics
             (port, hour, unique_ips, total_bans, avg_sessions, max_sessions)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(port)
        .bind(stats.hour)
        .bind(stats.unique_ips)
        .bind(stats.total_bans)
        .bind(stats.avg_sessions)
        .bind(stats.max_sessions)
        .execute(&self.pool)
        .await
        .context("failed to record statistics")?;

        Ok(())
    }

    /// Statistics rows for a port covering the last `hours` hours.
    pub async fn statistics(&self, port: u16, hours: u32) -> Result<Vec<PortStatistics>> {
        let cutoff = Utc::now() - ChronoDuration::hours(hours as i64);

        let rows = sqlx::query(
            "SELECT hour, unique_ips, total_bans, avg_sessions, max_sessions
             FROM statistics
             WHERE port = ? AND hour >= ?
             ORDER BY hour DESC",
        )
        .bind(port)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("failed to query statistics")?;

        let mut stats = Vec::with_capacity(rows.len());
        for row in rows {
            stats.push(PortStatistics {
                hour: row.try_get("hour")?,
                unique_ips: row.try_get::<i64, _>("unique_ips")? as u32,
                total_bans: row.try_get::<i64, _>("total_bans")? as u32,
                avg_sessions: row.try_get("avg_sessions")?,
                max_sessions: row.try_get::<i64, _>("max_sessions")? as u32,
            });
        }

        Ok(stats)
    }

    /// Prune rows older than the retention window, then compact.
    pub async fn cleanup(&self, days_to_keep: u32) -> Result<()> {
        tracing::info!("pruning history older than {days_to_keep} days");

        for table in schema::TABLES {
            let query = format!(
                "DELETE FROM {table} WHERE created_at < datetime('now', '-' || ? || ' days')"
            );

            let result = sqlx::query(&query)
                .bind(days_to_keep)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to prune {table}"))?;

            tracing::info!("pruned {} rows from {table}", result.rows_affected());
        }

        if let Err(err) = sqlx::query("VACUUM").execute(&self.pool).await {
            tracing::warn!("vacuum failed: {err}");
        }

        Ok(())
    }

    /// On-disk size of the database file.
    pub fn size(&self) -> Result<u64> {
        let meta = std::fs::metadata(&self.path)
            .with_context(|| format!("failed to stat {}", self.path.display()))?;
        Ok(meta.len())
    }
}
