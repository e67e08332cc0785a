use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::ResultsStoreConfig;
use crate::error::AppError;
use crate::models::SavedResult;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const ID_LEN: usize = 8;
const MAX_ID_ATTEMPTS: u32 = 5;
const MAX_BUSY_RETRIES: u32 = 3;

/// Durable small-keyed store over an embedded SQL engine (spec §4.7).
pub struct ResultsStore {
    pool: SqlitePool,
    config: ResultsStoreConfig,
    stop: tokio::sync::Notify,
    stopped: AtomicBool,
    sweep_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Uniform rejection sampling over the 62-symbol alphabet to avoid modulo
/// bias (spec §4.7, §8 properties 7-8).
fn generate_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LEN)
        .map(|_| {
            loop {
                let byte: u8 = rng.random();
                // 256 / 62 = 4 remainder 8; reject the last partial block
                // (indices 248..256) to keep every symbol equiprobable.
                if byte < 248 {
                    return ID_ALPHABET[(byte % 62) as usize] as char;
                }
            }
        })
        .collect()
}

/// SQLITE_BUSY (5) / SQLITE_LOCKED (6) — transient contention worth a retry.
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("5") | Some("6"))
        }
        _ => false,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

impl ResultsStore {
    pub async fn open(config: ResultsStoreConfig) -> Result<Self, AppError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| AppError::StoreInternal(format!("creating data dir: {e}")))?;

        let db_path = format!("{}/results.db", config.data_dir.trim_end_matches('/'));
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
            .map_err(|e| AppError::StoreInternal(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(AppError::from)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS results (
                id TEXT PRIMARY KEY,
                download_mbps REAL NOT NULL,
                upload_mbps REAL NOT NULL,
                latency_ms REAL NOT NULL,
                jitter_ms REAL NOT NULL,
                loaded_latency_ms REAL NOT NULL,
                bufferbloat_grade TEXT NOT NULL,
                ipv4 TEXT,
                ipv6 TEXT,
                server_name TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(AppError::from)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_results_created_at ON results (created_at DESC, id DESC)")
            .execute(&pool)
            .await
            .map_err(AppError::from)?;

        let store = Self {
            pool,
            config,
            stop: tokio::sync::Notify::new(),
            stopped: AtomicBool::new(false),
            sweep_task: tokio::sync::Mutex::new(None),
        };

        store.run_retention_sweep().await?;
        Ok(store)
    }

    pub fn start_sweeper(self: &std::sync::Arc<Self>) {
        let store = std::sync::Arc::clone(self);
        let interval = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate tick; open() already swept.
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.run_retention_sweep().await {
                            tracing::warn!(error = %e, "results store sweep failed");
                        }
                    }
                    _ = store.stop.notified() => break,
                }
            }
        });
        if let Ok(mut guard) = self.sweep_task.try_lock() {
            *guard = Some(handle);
        }
    }

    pub async fn save(&self, result: &SavedResultInput) -> Result<String, AppError> {
        let mut id_attempt = 0u32;
        let mut busy_attempt = 0u32;
        loop {
            let id = generate_id();

            let insert = sqlx::query(
                "INSERT INTO results
                 (id, download_mbps, upload_mbps, latency_ms, jitter_ms, loaded_latency_ms,
                  bufferbloat_grade, ipv4, ipv6, server_name, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(result.download_mbps)
            .bind(result.upload_mbps)
            .bind(result.latency_ms)
            .bind(result.jitter_ms)
            .bind(result.loaded_latency_ms)
            .bind(&result.bufferbloat_grade)
            .bind(&result.ipv4)
            .bind(&result.ipv6)
            .bind(&result.server_name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await;

            match insert {
                Ok(_) => return Ok(id),
                Err(e) if is_unique_violation(&e) => {
                    // id collision — regenerate and retry, up to
                    // MAX_ID_ATTEMPTS total id attempts for this save().
                    id_attempt += 1;
                    if id_attempt >= MAX_ID_ATTEMPTS {
                        return Err(AppError::StoreInternal(
                            "exhausted id generation attempts".to_string(),
                        ));
                    }
                    continue;
                }
                Err(e) if is_busy(&e) => {
                    busy_attempt += 1;
                    if busy_attempt > MAX_BUSY_RETRIES {
                        return Err(AppError::StoreRetryable);
                    }
                    tokio::time::sleep(Duration::from_millis(25 * busy_attempt as u64)).await;
                    continue;
                }
                Err(e) => return Err(AppError::from(e)),
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<SavedResult>, AppError> {
        let row = sqlx::query(
            "SELECT id, download_mbps, upload_mbps, latency_ms, jitter_ms, loaded_latency_ms,
                    bufferbloat_grade, ipv4, ipv6, server_name, created_at
             FROM results WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let created_at_raw: String = row.try_get("created_at").map_err(AppError::from)?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&created_at_raw)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .map_err(|e| AppError::StoreInternal(format!("corrupt created_at: {e}")))?;

        Ok(Some(SavedResult {
            id: row.try_get("id").map_err(AppError::from)?,
            download_mbps: row.try_get("download_mbps").map_err(AppError::from)?,
            upload_mbps: row.try_get("upload_mbps").map_err(AppError::from)?,
            latency_ms: row.try_get("latency_ms").map_err(AppError::from)?,
            jitter_ms: row.try_get("jitter_ms").map_err(AppError::from)?,
            loaded_latency_ms: row.try_get("loaded_latency_ms").map_err(AppError::from)?,
            bufferbloat_grade: row.try_get("bufferbloat_grade").map_err(AppError::from)?,
            ipv4: row.try_get("ipv4").map_err(AppError::from)?,
            ipv6: row.try_get("ipv6").map_err(AppError::from)?,
            server_name: row.try_get("server_name").map_err(AppError::from)?,
            created_at,
        }))
    }

    /// Deletes rows older than the retention window, then — if a max-stored
    /// cap is configured — trims to the newest `max` rows ordered by
    /// `(created_at DESC, id DESC)`, the secondary key making the trim
    /// deterministic when timestamps tie (spec §4.7).
    pub async fn run_retention_sweep(&self) -> Result<(), AppError> {
        let cutoff = (chrono::Utc::now() - self.config.retention).to_rfc3339();
        sqlx::query("DELETE FROM results WHERE created_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await
            .map_err(AppError::from)?;

        if let Some(max) = self.config.max_stored {
            sqlx::query(
                "DELETE FROM results WHERE id NOT IN (
                    SELECT id FROM results ORDER BY created_at DESC, id DESC LIMIT ?
                )",
            )
            .bind(max as i64)
            .execute(&self.pool)
            .await
            .map_err(AppError::from)?;
        }

        Ok(())
    }

    pub async fn close(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.notify_waiters();
        if let Some(handle) = self.sweep_task.lock().await.take() {
            let _ = handle.await;
        }
        self.pool.close().await;
    }
}

/// Input to [`ResultsStore::save`] — decoupled from the request DTO so the
/// store has no axum/serde dependency beyond what `SavedResult` needs.
pub struct SavedResultInput {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loaded_latency_ms: f64,
    pub bufferbloat_grade: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub server_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_matches_alphabet_and_length() {
        for _ in 0..200 {
            let id = generate_id();
            assert_eq!(id.len(), ID_LEN);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    // Spec §8 property 8: over N >= 2000 ids, all 62 symbols appear.
    #[test]
    fn id_distribution_covers_full_alphabet() {
        use std::collections::HashSet;
        let mut seen: HashSet<char> = HashSet::new();
        for _ in 0..4000 {
            seen.extend(generate_id().chars());
        }
        assert_eq!(seen.len(), 62, "expected all 62 alphabet symbols to appear");
    }

    #[tokio::test]
    async fn save_and_get_round_trip() {
        let dir = tempdir();
        let store = ResultsStore::open(ResultsStoreConfig {
            data_dir: dir.clone(),
            retention: Duration::from_secs(90 * 86400),
            max_stored: None,
            sweep_interval: Duration::from_secs(3600),
        })
        .await
        .unwrap();

        let id = store
            .save(&SavedResultInput {
                download_mbps: 500.5,
                upload_mbps: 100.2,
                latency_ms: 8.1,
                jitter_ms: 0.5,
                loaded_latency_ms: 15.3,
                bufferbloat_grade: "B".to_string(),
                ipv4: Some("203.0.113.1".to_string()),
                ipv6: None,
                server_name: "Test".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(id.len(), ID_LEN);
        let fetched = store.get(&id).await.unwrap().unwrap();
        assert_eq!(fetched.download_mbps, 500.5);
        assert_eq!(fetched.server_name, "Test");

        store.close().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn missing_id_returns_none() {
        let dir = tempdir();
        let store = ResultsStore::open(ResultsStoreConfig {
            data_dir: dir.clone(),
            retention: Duration::from_secs(90 * 86400),
            max_stored: None,
            sweep_interval: Duration::from_secs(3600),
        })
        .await
        .unwrap();
        assert!(store.get("nosuchid0").await.unwrap().is_none());
        store.close().await;
        let _ = std::fs::remove_dir_all(dir);
    }

    fn tempdir() -> String {
        let dir = std::env::temp_dir().join(format!(
            "results_store_test_{}",
            rand::rng().random::<u64>()
        ));
        dir.to_string_lossy().to_string()
    }
}
