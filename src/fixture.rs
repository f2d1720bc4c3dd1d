use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FixtureConfig;

/// Schema and seed data for a problem
pub const SETUP_SCRIPT: &str = "problem.sql";
/// The canonical query
pub const SOLUTION_SCRIPT: &str = "solution.sql";
/// Ordering policy and table descriptions
pub const METADATA: &str = "metadata.json";

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("{artifact} not found locally or remotely for problem {problem_id}")]
    NotFound { problem_id: u32, artifact: String },
    #[error("{artifact} of problem {problem_id} is malformed: {source}")]
    Malformed {
        problem_id: u32,
        artifact: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to read {artifact} of problem {problem_id}: {message}")]
    Unavailable {
        problem_id: u32,
        artifact: String,
        message: String,
    },
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type", default)]
    pub data_type: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table_name: String,
    #[serde(default)]
    pub columns: Vec<ColumnSchema>,
}

/// Contents of `metadata.json`; unknown fields are ignored
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ProblemMetadata {
    #[serde(default)]
    pub requires_order: bool,
    #[serde(default)]
    pub tables: Vec<TableSchema>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub difficulty_level: Option<String>,
    pub topic_id: Option<u32>,
    #[serde(default)]
    pub hints: Vec<String>,
}

/// Everything a single verification needs about a problem
#[derive(Debug, Clone, PartialEq)]
pub struct ProblemFixture {
    pub problem_id: u32,
    pub setup_script: String,
    pub solution_script: String,
    pub requires_order: bool,
    pub tables: Vec<TableSchema>,
}

/// Object store reached over HTTP, laid out like the local catalog
#[derive(Debug, Clone)]
pub struct RemoteStore {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    /// Returns `None` when the store has no object under `key`
    async fn fetch(&self, key: &str) -> reqwest::Result<Option<String>> {
        let url = format!("{}/{key}", self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.error_for_status()?.text().await?;
        Ok(Some(body))
    }
}

/// Resolves problem artifacts, local catalog first, remote store second
///
/// Nothing is cached: every call reads the artifact again. Published fixtures
/// are never rewritten, so repeated reads see the same bytes.
#[derive(Debug, Clone)]
pub struct FixtureLoader {
    local_root: PathBuf,
    remote: Option<RemoteStore>,
}

impl FixtureLoader {
    pub fn new(local_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: RemoteStore) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn from_config(config: &FixtureConfig) -> reqwest::Result<Self> {
        let loader = Self::new(&config.local_root);
        match &config.remote_base_url {
            Some(url) => Ok(loader.with_remote(RemoteStore::new(url, config.remote_timeout.into())?)),
            None => Ok(loader),
        }
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Directory name of a problem, e.g. `007`
    fn folder(problem_id: u32) -> String {
        format!("{problem_id:03}")
    }

    pub async fn load(&self, problem_id: u32, artifact: &str) -> Result<String, FixtureError> {
        let not_found = || FixtureError::NotFound {
            problem_id,
            artifact: artifact.to_string(),
        };
        let unavailable = |message: String| FixtureError::Unavailable {
            problem_id,
            artifact: artifact.to_string(),
            message,
        };

        if problem_id == 0 || artifact.contains(['/', '\\']) || artifact.starts_with('.') {
            return Err(not_found());
        }

        let folder = Self::folder(problem_id);
        let local_path = self.local_root.join(&folder).join(artifact);

        match tokio::fs::read_to_string(&local_path).await {
            Ok(content) => {
                log::debug!("Loaded {} from local catalog", local_path.display());
                return Ok(content);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(unavailable(e.to_string())),
        }

        let Some(remote) = &self.remote else {
            return Err(not_found());
        };

        let key = format!("problems/{folder}/{artifact}");
        match remote.fetch(&key).await {
            Ok(Some(content)) => {
                log::debug!("Loaded {key} from remote store");
                Ok(content)
            }
            Ok(None) => Err(not_found()),
            Err(e) => {
                log::error!("Failed to fetch {key} from remote store: {e}");
                Err(unavailable(e.to_string()))
            }
        }
    }

    pub async fn load_parsed<T: DeserializeOwned>(
        &self,
        problem_id: u32,
        artifact: &str,
    ) -> Result<T, FixtureError> {
        let content = self.load(problem_id, artifact).await?;
        serde_json::from_str(&content).map_err(|source| FixtureError::Malformed {
            problem_id,
            artifact: artifact.to_string(),
            source,
        })
    }

    /// Loads the scripts and the ordering policy of a problem
    ///
    /// A missing or unreadable metadata file only costs the ordering policy,
    /// which then defaults to order-insensitive.
    pub async fn load_fixture(&self, problem_id: u32) -> Result<ProblemFixture, FixtureError> {
        let setup_script = self.load(problem_id, SETUP_SCRIPT).await?;
        let solution_script = self.load(problem_id, SOLUTION_SCRIPT).await?;

        let metadata = match self.load_parsed::<ProblemMetadata>(problem_id, METADATA).await {
            Ok(metadata) => metadata,
            Err(e) => {
                log::warn!("Using default ordering policy for problem {problem_id}: {e}");
                ProblemMetadata::default()
            }
        };

        Ok(ProblemFixture {
            problem_id,
            setup_script,
            solution_script,
            requires_order: metadata.requires_order,
            tables: metadata.tables,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_problem(root: &Path, problem_id: u32, files: &[(&str, &str)]) {
        let dir = root.join(format!("{problem_id:03}"));
        std::fs::create_dir_all(&dir).unwrap();
        for (name, content) in files {
            std::fs::write(dir.join(name), content).unwrap();
        }
    }

    #[tokio::test]
    async fn test_load_from_local_catalog() {
        let root = tempfile::tempdir().unwrap();
        write_problem(root.path(), 7, &[(SOLUTION_SCRIPT, "SELECT 1;")]);
        let loader = FixtureLoader::new(root.path());

        let first = loader.load(7, SOLUTION_SCRIPT).await.unwrap();
        let second = loader.load(7, SOLUTION_SCRIPT).await.unwrap();
        assert_eq!(first, "SELECT 1;");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let loader = FixtureLoader::new(root.path());
        let err = loader.load(3, SETUP_SCRIPT).await.unwrap_err();
        assert!(matches!(err, FixtureError::NotFound { problem_id: 3, .. }));

        let err = loader.load(0, SETUP_SCRIPT).await.unwrap_err();
        assert!(matches!(err, FixtureError::NotFound { problem_id: 0, .. }));
    }

    #[tokio::test]
    async fn test_malformed_metadata() {
        let root = tempfile::tempdir().unwrap();
        write_problem(root.path(), 1, &[(METADATA, "{ not json")]);
        let loader = FixtureLoader::new(root.path());
        let err = loader
            .load_parsed::<ProblemMetadata>(1, METADATA)
            .await
            .unwrap_err();
        assert!(matches!(err, FixtureError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_fixture_without_metadata_defaults_to_unordered() {
        let root = tempfile::tempdir().unwrap();
        write_problem(
            root.path(),
            12,
            &[(SETUP_SCRIPT, "CREATE TABLE t (x INT);"), (SOLUTION_SCRIPT, "SELECT x FROM t")],
        );
        let fixture = FixtureLoader::new(root.path()).load_fixture(12).await.unwrap();
        assert_eq!(fixture.problem_id, 12);
        assert!(!fixture.requires_order);
        assert!(fixture.tables.is_empty());
    }

    #[tokio::test]
    async fn test_fixture_reads_metadata() {
        let root = tempfile::tempdir().unwrap();
        write_problem(
            root.path(),
            2,
            &[
                (SETUP_SCRIPT, "CREATE TABLE t (x INT);"),
                (SOLUTION_SCRIPT, "SELECT x FROM t ORDER BY x"),
                (
                    METADATA,
                    r#"{
                        "title": "Sorted",
                        "requires_order": true,
                        "tables": [{ "table_name": "t", "columns": [{ "name": "x", "type": "INT" }] }],
                        "input_data": {}
                    }"#,
                ),
            ],
        );
        let fixture = FixtureLoader::new(root.path()).load_fixture(2).await.unwrap();
        assert!(fixture.requires_order);
        assert_eq!(fixture.tables[0].table_name, "t");
        assert_eq!(fixture.tables[0].columns[0].data_type, "INT");
    }

    #[tokio::test]
    async fn test_missing_solution_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        write_problem(root.path(), 5, &[(SETUP_SCRIPT, "CREATE TABLE t (x INT);")]);
        let err = FixtureLoader::new(root.path()).load_fixture(5).await.unwrap_err();
        match err {
            FixtureError::NotFound { artifact, .. } => assert_eq!(artifact, SOLUTION_SCRIPT),
            other => panic!("unexpected error: {other}"),
        }
    }
}
