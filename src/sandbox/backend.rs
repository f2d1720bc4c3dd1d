use std::future::Future;

use crate::filter::first_forbidden_statement;
use crate::rows::RowSet;

/// State a sandbox is left in after [`SandboxConnection::rollback_to_checkpoint`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollback {
    /// Every change made since the checkpoint was undone
    Restored,
    /// The namespace was recreated empty and has to be seeded again
    Emptied,
}

/// A connection switched into exactly one sandbox namespace
pub trait SandboxConnection: Send {
    /// Runs a statement and discards anything it returns
    fn execute(&mut self, sql: &str) -> impl Future<Output = sqlx::Result<()>> + Send;

    /// Runs a statement and materializes its rows in column order
    fn fetch(&mut self, sql: &str) -> impl Future<Output = sqlx::Result<RowSet>> + Send;

    /// Marks the current state as the one the next rollback returns to
    fn checkpoint(&mut self) -> impl Future<Output = sqlx::Result<()>> + Send;

    /// Discards every change made since the last checkpoint, temporary
    /// objects included
    fn rollback_to_checkpoint(&mut self) -> impl Future<Output = sqlx::Result<Rollback>> + Send;
}

/// Engine-specific handling of disposable namespaces
///
/// A backend handle is shared by every concurrent verification, so it must be
/// cheap to clone. Connections are never shared: `create` opens a fresh one
/// for each sandbox and `destroy` consumes it.
pub trait SandboxBackend: Clone + Send + Sync + 'static {
    type Connection: SandboxConnection;

    /// Leading keywords of statements a sandbox connection refuses to run
    ///
    /// Submissions starting a statement with one of them are rejected before
    /// a sandbox is opened.
    fn forbidden_statements(&self) -> &'static [&'static str] {
        &[]
    }

    /// Creates the namespace and returns a connection already switched into it
    fn create(&self, schema: &str) -> impl Future<Output = sqlx::Result<Self::Connection>> + Send;

    /// Aborts the statement currently running on `conn`, if any
    fn interrupt(&self, conn: &Self::Connection) -> impl Future<Output = sqlx::Result<()>> + Send;

    /// Drops the namespace, then closes the connection
    fn destroy(
        &self,
        conn: Self::Connection,
        schema: &str,
    ) -> impl Future<Output = sqlx::Result<()>> + Send;

    /// Drops a namespace by name without a session connection
    fn drop_namespace(&self, schema: &str) -> impl Future<Output = sqlx::Result<()>> + Send;

    /// Names of every existing namespace starting with `prefix`
    fn list_namespaces(
        &self,
        prefix: &str,
    ) -> impl Future<Output = sqlx::Result<Vec<String>>> + Send;
}

/// Fails if any statement in `sql` starts with one of the `forbidden` keywords
pub(crate) fn refuse_statements(sql: &str, forbidden: &[&str]) -> sqlx::Result<()> {
    match first_forbidden_statement(sql, forbidden) {
        Some(keyword) => Err(sqlx::Error::Protocol(format!(
            "{} is not allowed in a sandbox",
            keyword.to_uppercase()
        ))),
        None => Ok(()),
    }
}
