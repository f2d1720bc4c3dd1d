mod backend;
mod janitor;
mod mysql_backend;
mod sqlite_backend;

pub use backend::{Rollback, SandboxBackend, SandboxConnection};
use backend::refuse_statements;
pub use janitor::Janitor;
pub use mysql_backend::{MySqlBackend, MySqlSandboxConnection};
pub use sqlite_backend::{SqliteBackend, SqliteSandboxConnection};

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

/// Future returned by the body of [`SchemaManager::with_sandbox`]
pub type SandboxFuture<'c, T> = Pin<Box<dyn Future<Output = T> + Send + 'c>>;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create sandbox {schema}: {source}")]
    Unavailable {
        schema: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("sandbox {schema} exceeded its deadline")]
    Timeout { schema: String },
    #[error("failed to drop sandbox {schema}: {source}")]
    CleanupFailed {
        schema: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Names of namespaces whose drop failed and still need to be removed
#[derive(Debug, Clone, Default)]
pub struct OrphanRegistry(Arc<Mutex<BTreeSet<String>>>);

impl OrphanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, schema: impl Into<String>) {
        self.0.lock().insert(schema.into());
    }

    pub fn contains(&self, schema: &str) -> bool {
        self.0.lock().contains(schema)
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Removes and returns every recorded name
    pub fn take_all(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock()).into_iter().collect()
    }
}

/// `<prefix>` followed by 16 hex digits of a random 64-bit value
pub fn generate_schema_name(prefix: &str) -> String {
    format!("{prefix}{:016x}", rand::random::<u64>())
}

/// Drops the namespace if the surrounding future is cancelled before the
/// regular cleanup ran
struct DropGuard<B: SandboxBackend> {
    backend: Option<B>,
    schema: String,
    orphans: OrphanRegistry,
}

impl<B: SandboxBackend> DropGuard<B> {
    fn arm(backend: B, schema: String, orphans: OrphanRegistry) -> Self {
        Self {
            backend: Some(backend),
            schema,
            orphans,
        }
    }

    fn disarm(mut self) {
        self.backend = None;
    }
}

impl<B: SandboxBackend> Drop for DropGuard<B> {
    fn drop(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        let schema = std::mem::take(&mut self.schema);
        let orphans = self.orphans.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!("Sandbox {schema} abandoned mid-run, dropping it in the background");
                handle.spawn(async move {
                    if let Err(e) = backend.drop_namespace(&schema).await {
                        log::error!("Failed to drop abandoned sandbox {schema}: {e}");
                        orphans.record(schema);
                    }
                });
            }
            Err(_) => {
                log::error!("Sandbox {schema} abandoned outside a runtime, marked as orphan");
                orphans.record(schema);
            }
        }
    }
}

/// Hands out disposable namespaces and guarantees they are dropped
#[derive(Debug, Clone)]
pub struct SchemaManager<B> {
    backend: B,
    prefix: String,
    orphans: OrphanRegistry,
}

impl<B: SandboxBackend> SchemaManager<B> {
    pub fn new(backend: B, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            orphans: OrphanRegistry::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn orphans(&self) -> &OrphanRegistry {
        &self.orphans
    }

    /// Runs `body` inside a freshly created namespace
    ///
    /// The namespace is dropped on every path out of this function: normal
    /// return, an error value produced by `body`, or the deadline passing, in
    /// which case the running statement is interrupted first. If the returned
    /// future is itself dropped early, a guard schedules the drop instead.
    ///
    /// A failed drop is logged and recorded in the orphan registry; it never
    /// replaces the value produced by `body`.
    pub async fn with_sandbox<T, F>(
        &self,
        deadline: Option<Instant>,
        body: F,
    ) -> Result<T, SandboxError>
    where
        F: for<'c> FnOnce(&'c mut B::Connection, &'c str) -> SandboxFuture<'c, T>,
    {
        let schema = generate_schema_name(&self.prefix);
        let created_at = Utc::now();

        let mut conn = self
            .backend
            .create(&schema)
            .await
            .map_err(|source| SandboxError::Unavailable {
                schema: schema.clone(),
                source,
            })?;
        let guard = DropGuard::arm(self.backend.clone(), schema.clone(), self.orphans.clone());
        log::debug!("Sandbox {schema} created");

        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, body(&mut conn, &schema))
                .await
                .ok(),
            None => Some(body(&mut conn, &schema).await),
        };

        if outcome.is_none() {
            log::warn!("Sandbox {schema} hit its deadline, interrupting the running statement");
            if let Err(e) = self.backend.interrupt(&conn).await {
                log::error!("Failed to interrupt sandbox {schema}: {e}");
            }
        }

        match self.backend.destroy(conn, &schema).await {
            Ok(()) => {
                let lifetime = Utc::now() - created_at;
                log::debug!(
                    "Sandbox {schema} dropped after {} ms",
                    lifetime.num_milliseconds()
                );
            }
            Err(e) => {
                log::error!("Failed to drop sandbox {schema}, marked as orphan: {e}");
                self.orphans.record(schema.clone());
            }
        }
        guard.disarm();

        outcome.ok_or(SandboxError::Timeout { schema })
    }
}
