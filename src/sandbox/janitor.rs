use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{SandboxBackend, SandboxError, SchemaManager};

/// Removes namespaces that outlived their verification
pub struct Janitor<B> {
    manager: SchemaManager<B>,
}

impl<B: SandboxBackend> Janitor<B> {
    pub fn new(manager: SchemaManager<B>) -> Self {
        Self { manager }
    }

    /// Retries the drop of every recorded orphan
    ///
    /// Names that still cannot be dropped go back into the registry and are
    /// returned as errors.
    pub async fn sweep_registered(&self) -> Vec<SandboxError> {
        let orphans = self.manager.orphans();
        let mut failures = Vec::new();

        for schema in orphans.take_all() {
            match self.manager.backend().drop_namespace(&schema).await {
                Ok(()) => log::info!("Dropped orphaned sandbox {schema}"),
                Err(source) => {
                    orphans.record(schema.clone());
                    failures.push(SandboxError::CleanupFailed { schema, source });
                }
            }
        }

        failures
    }

    /// Drops every namespace carrying the sandbox prefix
    ///
    /// Live sandboxes carry the same prefix, so this is only safe while no
    /// verification is running, i.e. at startup.
    pub async fn sweep_all(&self) -> sqlx::Result<usize> {
        let backend = self.manager.backend();
        let names = backend.list_namespaces(self.manager.prefix()).await?;
        let mut dropped = 0;

        for schema in names {
            match backend.drop_namespace(&schema).await {
                Ok(()) => dropped += 1,
                Err(e) => {
                    log::error!("Failed to drop leftover sandbox {schema}: {e}");
                    self.manager.orphans().record(schema);
                }
            }
        }

        Ok(dropped)
    }

    /// Calls [`Self::sweep_registered`] every `interval` until `token` is cancelled
    pub async fn run(self, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    log::info!("Janitor received shutdown signal, stopping");
                    break;
                }

                _ = ticker.tick() => {
                    if self.manager.orphans().is_empty() {
                        continue;
                    }
                    for failure in self.sweep_registered().await {
                        log::error!("Janitor could not clean up: {failure}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SqliteBackend;

    #[tokio::test]
    async fn test_sweep_registered_drops_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path()).unwrap();
        let manager = SchemaManager::new(backend.clone(), "sandbox_");

        let conn = backend.create("sandbox_orphan").await.unwrap();
        drop(conn);
        manager.orphans().record("sandbox_orphan");

        let janitor = Janitor::new(manager.clone());
        assert!(janitor.sweep_registered().await.is_empty());
        assert!(manager.orphans().is_empty());
        assert!(!backend.database_path("sandbox_orphan").exists());
    }

    #[tokio::test]
    async fn test_sweep_all_only_touches_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(dir.path()).unwrap();
        drop(backend.create("sandbox_one").await.unwrap());
        drop(backend.create("sandbox_two").await.unwrap());
        drop(backend.create("keepme_three").await.unwrap());

        let janitor = Janitor::new(SchemaManager::new(backend.clone(), "sandbox_"));
        assert_eq!(janitor.sweep_all().await.unwrap(), 2);
        assert_eq!(
            backend.list_namespaces("").await.unwrap(),
            vec!["keepme_three".to_string()]
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SchemaManager::new(SqliteBackend::new(dir.path()).unwrap(), "sandbox_");
        let token = CancellationToken::new();
        let task = tokio::spawn(Janitor::new(manager).run(Duration::from_millis(10), token.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        task.await.unwrap();
    }
}
