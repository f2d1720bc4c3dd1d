use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, Connection, Executor, Row as _, TypeInfo, ValueRef};

use crate::rows::{Number, Row, RowSet, Scalar};

use super::{Rollback, SandboxBackend, SandboxConnection, refuse_statements};

const DATABASE_EXTENSION: &str = "sqlite3";

/// Statements that reach files outside the sandbox or end the transaction
/// its checkpoint lives in
const FORBIDDEN_STATEMENTS: &[&str] = &[
    "attach", "detach", "vacuum", "pragma", "begin", "commit", "end", "rollback", "savepoint",
    "release",
];

const CHECKPOINT: &str = "seeded";

/// Virtual machine instructions between two checks of the interrupt flag
const PROGRESS_HANDLER_OPS: i32 = 1_000;

/// Sandboxes backed by throwaway SQLite database files
///
/// Each namespace is its own file in the scratch directory, so nothing is
/// shared between two sandboxes except the directory itself.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    scratch_dir: PathBuf,
}

impl SqliteBackend {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let scratch_dir = scratch_dir.into();
        std::fs::create_dir_all(&scratch_dir)?;
        log::info!("SQLite sandboxes live in {}", scratch_dir.display());
        Ok(Self { scratch_dir })
    }

    /// `<cache dir>/sandboxes` of the current user
    pub fn default_scratch_dir() -> std::io::Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "sqlcheck")
            .ok_or_else(|| std::io::Error::other("Unable to find user directory"))?;
        Ok(proj_dirs.cache_dir().join("sandboxes"))
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn database_path(&self, schema: &str) -> PathBuf {
        self.scratch_dir
            .join(format!("{schema}.{DATABASE_EXTENSION}"))
    }
}

/// Raises the interrupt flag when the sandbox connection goes away, so a
/// statement still running on the worker thread stops at its next check
struct InterruptOnDrop(Arc<AtomicBool>);

impl InterruptOnDrop {
    fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        self.trigger();
    }
}

pub struct SqliteSandboxConnection {
    conn: SqliteConnection,
    interrupt: InterruptOnDrop,
}

impl SandboxConnection for SqliteSandboxConnection {
    async fn execute(&mut self, sql: &str) -> sqlx::Result<()> {
        refuse_statements(sql, FORBIDDEN_STATEMENTS)?;
        Executor::execute(&mut self.conn, sql).await?;
        Ok(())
    }

    async fn fetch(&mut self, sql: &str) -> sqlx::Result<RowSet> {
        refuse_statements(sql, FORBIDDEN_STATEMENTS)?;
        let rows = Executor::fetch_all(&mut self.conn, sql).await?;
        rows.iter().map(row_from_sqlite).collect()
    }

    async fn checkpoint(&mut self) -> sqlx::Result<()> {
        let savepoint = format!("SAVEPOINT {CHECKPOINT}");
        Executor::execute(&mut self.conn, savepoint.as_str()).await?;
        Ok(())
    }

    /// The TEMP database is part of the transaction, so temporary tables
    /// created after the checkpoint are gone as well
    async fn rollback_to_checkpoint(&mut self) -> sqlx::Result<Rollback> {
        for sql in [
            format!("ROLLBACK TO {CHECKPOINT}"),
            format!("RELEASE {CHECKPOINT}"),
        ] {
            Executor::execute(&mut self.conn, sql.as_str()).await?;
        }
        Ok(Rollback::Restored)
    }
}

impl SandboxBackend for SqliteBackend {
    type Connection = SqliteSandboxConnection;

    fn forbidden_statements(&self) -> &'static [&'static str] {
        FORBIDDEN_STATEMENTS
    }

    async fn create(&self, schema: &str) -> sqlx::Result<Self::Connection> {
        let path = self.database_path(schema);

        // create_new makes a name collision fail instead of reusing the file
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .foreign_keys(true);
        let mut conn = match SqliteConnection::connect_with(&options).await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        };

        let flag = Arc::new(AtomicBool::new(false));
        let handler_flag = Arc::clone(&flag);
        conn.lock_handle()
            .await?
            .set_progress_handler(PROGRESS_HANDLER_OPS, move || {
                !handler_flag.load(Ordering::Relaxed)
            });

        Ok(SqliteSandboxConnection {
            conn,
            interrupt: InterruptOnDrop(flag),
        })
    }

    async fn interrupt(&self, conn: &Self::Connection) -> sqlx::Result<()> {
        conn.interrupt.trigger();
        Ok(())
    }

    async fn destroy(&self, conn: Self::Connection, schema: &str) -> sqlx::Result<()> {
        let SqliteSandboxConnection { conn, interrupt } = conn;
        if let Err(e) = conn.close().await {
            log::warn!("Failed to close connection of sandbox {schema}: {e}");
        }
        drop(interrupt);
        self.drop_namespace(schema).await
    }

    async fn drop_namespace(&self, schema: &str) -> sqlx::Result<()> {
        let path = self.database_path(schema);

        // Remove journal, WAL and SHM files (ignore errors as they might not exist)
        for suffix in ["-journal", "-wal", "-shm"] {
            let mut sibling = path.clone().into_os_string();
            sibling.push(suffix);
            let _ = tokio::fs::remove_file(sibling).await;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_namespaces(&self, prefix: &str) -> sqlx::Result<Vec<String>> {
        let suffix = format!(".{DATABASE_EXTENSION}");
        let mut entries = tokio::fs::read_dir(&self.scratch_dir).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(schema) = file_name.strip_suffix(&suffix)
                && schema.starts_with(prefix)
            {
                names.push(schema.to_string());
            }
        }

        names.sort();
        Ok(names)
    }
}

fn row_from_sqlite(row: &SqliteRow) -> sqlx::Result<Row> {
    let mut out = Row::new();
    for column in row.columns() {
        out.push(column.name(), scalar_from_sqlite(row, column.ordinal())?);
    }
    Ok(out)
}

/// Maps the storage class of a value, not the declared column type, since
/// expressions such as `SELECT 1` carry no declared type at all
fn scalar_from_sqlite(row: &SqliteRow, idx: usize) -> sqlx::Result<Scalar> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Scalar::Null);
    }

    let scalar = match raw.type_info().name() {
        "INTEGER" => Scalar::Number(Number::Int(row.try_get_unchecked::<i64, _>(idx)?)),
        "REAL" => Scalar::Number(Number::Float(row.try_get_unchecked::<f64, _>(idx)?)),
        "BOOLEAN" => Scalar::Bool(row.try_get_unchecked::<bool, _>(idx)?),
        "BLOB" => {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(idx)?;
            Scalar::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => Scalar::Text(row.try_get_unchecked::<String, _>(idx)?),
    };
    Ok(scalar)
}
