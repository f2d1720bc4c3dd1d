use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};

use crate::verifier::Verdict;

const DATABASE_NAME: &str = "sqlcheck.sqlite3";

/// Default location of the history database in the user data directory
pub fn get_db_path() -> std::io::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "sqlcheck").ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "unable to find user directory")
    })?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir)?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display());
    let db_pool = SqlitePoolOptions::new()
        .max_connections(2)
        .min_connections(0)
        .connect(&db_url)
        .await?;

    // PRAGMAs cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS attempts (
            id            INTEGER  PRIMARY KEY AUTOINCREMENT,
            problem_id    INTEGER  NOT NULL,
            user_id       INTEGER,
            status        TEXT     NOT NULL CHECK (status IN ('Completed', 'Failed')),
            diagnostic    TEXT     NOT NULL DEFAULT '',
            created_time  TEXT     NOT NULL
        );",
        "CREATE INDEX IF NOT EXISTS attempts_by_problem ON attempts (problem_id);",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized history database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

/// Deletes the history database along with its WAL and SHM files
pub fn remove_db(db_path: impl AsRef<Path>) {
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// Stored status of an attempt, derived from its verdict
pub fn status_of(verdict: &Verdict) -> &'static str {
    if verdict.is_correct { "Completed" } else { "Failed" }
}

#[derive(sqlx::FromRow, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub id: i64,
    pub problem_id: u32,
    pub user_id: Option<u32>,
    pub status: String,
    pub diagnostic: String,
    pub created_time: String,
}

/// Stores one judged submission and returns its id
pub async fn record_attempt(
    pool: &SqlitePool,
    problem_id: u32,
    user_id: Option<u32>,
    verdict: &Verdict,
) -> sqlx::Result<i64> {
    let now = crate::create_timestamp();

    let result = sqlx::query(
        r"
        INSERT INTO attempts (problem_id, user_id, status, diagnostic, created_time)
        VALUES (?, ?, ?, ?, ?)
        ",
    )
    .bind(problem_id)
    .bind(user_id)
    .bind(status_of(verdict))
    .bind(&verdict.diagnostic)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Attempts on a problem in submission order, optionally narrowed to one user
pub async fn fetch_attempts(
    pool: &SqlitePool,
    problem_id: u32,
    user_id: Option<u32>,
) -> sqlx::Result<Vec<AttemptRecord>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, problem_id, user_id, status, diagnostic, created_time \
         FROM attempts WHERE problem_id = ",
    );
    qb.push_bind(problem_id);
    if let Some(user_id) = user_id {
        qb.push(" AND user_id = ").push_bind(user_id);
    }
    qb.push(" ORDER BY created_time, id");

    qb.build_query_as::<AttemptRecord>().fetch_all(pool).await
}

/// Share of correct attempts on a problem in percent, two decimals
///
/// A problem nobody attempted yet has a rate of 0.
pub async fn acceptance_rate(pool: &SqlitePool, problem_id: u32) -> sqlx::Result<f64> {
    let (total, completed): (i64, i64) = sqlx::query_as(
        r"
        SELECT COUNT(*), COALESCE(SUM(status = 'Completed'), 0)
        FROM attempts
        WHERE problem_id = ?
        ",
    )
    .bind(problem_id)
    .fetch_one(pool)
    .await?;

    if total == 0 {
        return Ok(0.0);
    }
    let rate = completed as f64 / total as f64 * 100.0;
    Ok((rate * 100.0).round() / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::Rejection;

    async fn pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().join(DATABASE_NAME)).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn test_record_and_fetch() {
        let (_dir, pool) = pool().await;
        let wrong = Verdict::rejected(Rejection::ComparisonMismatch);

        record_attempt(&pool, 1, Some(7), &wrong).await.unwrap();
        record_attempt(&pool, 1, Some(7), &Verdict::correct()).await.unwrap();
        record_attempt(&pool, 1, None, &Verdict::correct()).await.unwrap();
        record_attempt(&pool, 2, Some(7), &wrong).await.unwrap();

        let attempts = fetch_attempts(&pool, 1, None).await.unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].status, "Failed");
        assert_eq!(attempts[0].diagnostic, "output does not match expected result");
        assert_eq!(attempts[1].status, "Completed");
        assert_eq!(attempts[2].user_id, None);

        let mine = fetch_attempts(&pool, 1, Some(7)).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|a| a.user_id == Some(7) && a.problem_id == 1));
    }

    #[tokio::test]
    async fn test_acceptance_rate() {
        let (_dir, pool) = pool().await;
        assert_eq!(acceptance_rate(&pool, 4).await.unwrap(), 0.0);

        let wrong = Verdict::rejected(Rejection::ForbiddenOperation);
        record_attempt(&pool, 4, None, &Verdict::correct()).await.unwrap();
        record_attempt(&pool, 4, None, &wrong).await.unwrap();
        record_attempt(&pool, 4, None, &wrong).await.unwrap();

        assert_eq!(acceptance_rate(&pool, 4).await.unwrap(), 33.33);
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DATABASE_NAME);
        let pool = init_db(&path).await.unwrap();
        record_attempt(&pool, 1, None, &Verdict::correct()).await.unwrap();
        pool.close().await;

        let pool = init_db(&path).await.unwrap();
        assert_eq!(fetch_attempts(&pool, 1, None).await.unwrap().len(), 1);
        pool.close().await;

        remove_db(&path);
        assert!(!path.exists());

        // A flushed history starts over empty
        let pool = init_db(&path).await.unwrap();
        assert!(fetch_attempts(&pool, 1, None).await.unwrap().is_empty());
    }
}
