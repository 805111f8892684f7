use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Row, params};

use pulsemeter_domain::{MetricKey, MetricsSnapshot, TimeRange};
use pulsemeter_ports::DurableStore;

const COLUMNS: &str = "service_name, endpoint, window_end_ms, qps, avg_latency_ms, \
    p95_latency_ms, p99_latency_ms, error_rate, total_requests, total_errors";

/// Snapshot history in SQLite (WAL mode), one row per key and window end.
/// A later snapshot for the same window replaces the earlier row.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA busy_timeout=5000;",
            )
        });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .with_context(|| format!("failed to open sqlite store at {}", path.display()))?;
        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    /// Private in-memory database; a single pooled connection keeps it alive.
    pub fn in_memory() -> Result<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())
            .context("failed to open in-memory sqlite store")?;
        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().context("sqlite pool exhausted")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metric_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service_name TEXT NOT NULL,
                endpoint TEXT,
                window_end_ms INTEGER NOT NULL,
                qps REAL NOT NULL,
                avg_latency_ms REAL NOT NULL,
                p95_latency_ms REAL NOT NULL,
                p99_latency_ms REAL NOT NULL,
                error_rate REAL NOT NULL,
                total_requests INTEGER NOT NULL,
                total_errors INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_key_time
                ON metric_snapshots(service_name, endpoint, window_end_ms);
            CREATE INDEX IF NOT EXISTS idx_snapshots_time
                ON metric_snapshots(window_end_ms);",
        )
        .context("failed to create sqlite schema")?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("sqlite pool exhausted")?;
            op(&mut conn)
        })
        .await
        .context("sqlite worker panicked")?
    }

    pub async fn row_count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM metric_snapshots", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }
}

fn read_snapshot(row: &Row<'_>) -> rusqlite::Result<MetricsSnapshot> {
    let window_end_ms: i64 = row.get(2)?;
    let total_requests: i64 = row.get(8)?;
    let total_errors: i64 = row.get(9)?;
    Ok(MetricsSnapshot {
        key: MetricKey {
            service_name: row.get(0)?,
            endpoint: row.get(1)?,
        },
        window_end: DateTime::from_timestamp_millis(window_end_ms).unwrap_or(DateTime::<Utc>::MIN_UTC),
        qps: row.get(3)?,
        avg_latency_ms: row.get(4)?,
        p95_latency_ms: row.get(5)?,
        p99_latency_ms: row.get(6)?,
        error_rate: row.get(7)?,
        total_requests: total_requests.max(0) as u64,
        total_errors: total_errors.max(0) as u64,
    })
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn write_batch(&self, batch: &[MetricsSnapshot]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let batch = batch.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut replace = tx.prepare_cached(
                    "DELETE FROM metric_snapshots \
                     WHERE service_name = ?1 AND endpoint IS ?2 AND window_end_ms = ?3",
                )?;
                let mut insert = tx.prepare_cached(&format!(
                    "INSERT INTO metric_snapshots ({COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ))?;
                for snapshot in &batch {
                    replace.execute(params![
                        snapshot.key.service_name,
                        snapshot.key.endpoint,
                        snapshot.window_end.timestamp_millis(),
                    ])?;
                    insert.execute(params![
                        snapshot.key.service_name,
                        snapshot.key.endpoint,
                        snapshot.window_end.timestamp_millis(),
                        snapshot.qps,
                        snapshot.avg_latency_ms,
                        snapshot.p95_latency_ms,
                        snapshot.p99_latency_ms,
                        snapshot.error_rate,
                        snapshot.total_requests as i64,
                        snapshot.total_errors as i64,
                    ])?;
                }
            }
            tx.commit().context("failed to commit snapshot batch")?;
            Ok(())
        })
        .await
    }

    async fn history(
        &self,
        key: &MetricKey,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<MetricsSnapshot>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            // Newest `limit` rows in range, returned oldest first.
            let mut query = conn.prepare_cached(&format!(
                "SELECT {COLUMNS} FROM (
                    SELECT id, {COLUMNS} FROM metric_snapshots
                    WHERE service_name = ?1 AND endpoint IS ?2
                      AND window_end_ms BETWEEN ?3 AND ?4
                    ORDER BY window_end_ms DESC, id DESC
                    LIMIT ?5
                 ) ORDER BY window_end_ms ASC, id ASC"
            ))?;
            let rows = query.query_map(
                params![
                    key.service_name,
                    key.endpoint,
                    range.start.timestamp_millis(),
                    range.end.timestamp_millis(),
                    limit as i64,
                ],
                read_snapshot,
            )?;
            let mut snapshots = Vec::new();
            for row in rows {
                snapshots.push(row?);
            }
            Ok(snapshots)
        })
        .await
        .context("failed to query snapshot history")
    }

    async fn latest(&self, key: &MetricKey) -> Result<Option<MetricsSnapshot>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let snapshot = conn
                .query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM metric_snapshots
                         WHERE service_name = ?1 AND endpoint IS ?2
                         ORDER BY window_end_ms DESC, id DESC LIMIT 1"
                    ),
                    params![key.service_name, key.endpoint],
                    read_snapshot,
                )
                .optional()?;
            Ok(snapshot)
        })
        .await
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM metric_snapshots WHERE window_end_ms < ?1",
                params![cutoff.timestamp_millis()],
            )?;
            Ok(removed as u64)
        })
        .await
    }
}
