use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::compare;
use crate::config::SandboxConfig;
use crate::executor::{self, ExecError, split_statements};
use crate::filter::{SafetyFilter, first_forbidden_statement};
use crate::fixture::{FixtureError, FixtureLoader, ProblemFixture};
use crate::rows::RowSet;
use crate::sandbox::{Rollback, SandboxBackend, SandboxConnection, SandboxError, SchemaManager};

/// Outcome of one submission as reported to the learner
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub is_correct: bool,
    pub diagnostic: String,
}

impl Verdict {
    pub fn correct() -> Self {
        Self {
            is_correct: true,
            diagnostic: String::new(),
        }
    }

    pub fn rejected(reason: Rejection) -> Self {
        Self {
            is_correct: false,
            diagnostic: reason.to_string(),
        }
    }
}

/// Reasons a submission is marked wrong; all of them are the learner's to fix
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("forbidden operation")]
    ForbiddenOperation,
    #[error("no valid SQL statement provided")]
    EmptyQuery,
    #[error("query exceeds maximum length of {0} characters")]
    QueryTooLong(usize),
    #[error("error in query execution: {0}")]
    ExecutionFailed(String),
    #[error("no SELECT result found from user query")]
    NoResultProduced,
    #[error("output does not match expected result")]
    ComparisonMismatch,
}

/// Platform-side failures, kept apart from wrong answers
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("fixture {artifact} not found for problem {problem_id}")]
    FixtureNotFound { problem_id: u32, artifact: String },
    #[error("malformed fixture {artifact} for problem {problem_id}: {message}")]
    MalformedFixture {
        problem_id: u32,
        artifact: String,
        message: String,
    },
    #[error("fixture {artifact} for problem {problem_id} is unavailable: {message}")]
    FixtureUnavailable {
        problem_id: u32,
        artifact: String,
        message: String,
    },
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),
    #[error("setup script of problem {problem_id} failed: {message}")]
    SetupFailed { problem_id: u32, message: String },
    #[error("solution script of problem {problem_id} failed: {message}")]
    SolutionFailed { problem_id: u32, message: String },
    #[error("verification of problem {problem_id} timed out")]
    Timeout { problem_id: u32 },
    #[error("problem {problem_id} failed its self-check: {reason}")]
    InvalidFixture { problem_id: u32, reason: String },
}

impl From<FixtureError> for VerifyError {
    fn from(error: FixtureError) -> Self {
        match error {
            FixtureError::NotFound {
                problem_id,
                artifact,
            } => Self::FixtureNotFound {
                problem_id,
                artifact,
            },
            FixtureError::Malformed {
                problem_id,
                artifact,
                source,
            } => Self::MalformedFixture {
                problem_id,
                artifact,
                message: source.to_string(),
            },
            FixtureError::Unavailable {
                problem_id,
                artifact,
                message,
            } => Self::FixtureUnavailable {
                problem_id,
                artifact,
                message,
            },
        }
    }
}

impl VerifyError {
    fn from_sandbox(error: SandboxError, problem_id: u32) -> Self {
        match error {
            SandboxError::Timeout { .. } => Self::Timeout { problem_id },
            SandboxError::Unavailable { source, .. } => Self::SandboxUnavailable(source.to_string()),
            // Failed drops are left to the janitor and never reach a caller
            error @ SandboxError::CleanupFailed { .. } => {
                Self::SandboxUnavailable(error.to_string())
            }
        }
    }
}

/// Patterns a published fixture must not contain, matched on lowercased text
/// with whitespace runs collapsed
const FORBIDDEN_IN_SETUP: [&str; 2] = ["drop database", "drop schema"];
const FORBIDDEN_IN_SOLUTION: [&str; 3] = ["drop table", "drop database", "drop schema"];

/// Judges submissions against the problem catalog
pub struct Verifier<B> {
    sandboxes: SchemaManager<B>,
    fixtures: FixtureLoader,
    filter: SafetyFilter,
    timeout: Option<Duration>,
    max_query_length: usize,
}

impl<B: SandboxBackend> Verifier<B> {
    /// A verifier with the default keyword list, prefix, length limit and deadline
    pub fn new(backend: B, fixtures: FixtureLoader) -> Self {
        Self::from_config(backend, fixtures, &SandboxConfig::default())
    }

    pub fn from_config(backend: B, fixtures: FixtureLoader, config: &SandboxConfig) -> Self {
        Self {
            sandboxes: SchemaManager::new(backend, &config.schema_prefix),
            fixtures,
            filter: SafetyFilter::new(&config.forbidden_keywords),
            timeout: Some(config.timeout.into()),
            max_query_length: config.max_query_length,
        }
    }

    pub fn with_filter(mut self, filter: SafetyFilter) -> Self {
        self.filter = filter;
        self
    }

    /// `None` disables the deadline
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn schema_manager(&self) -> &SchemaManager<B> {
        &self.sandboxes
    }

    pub fn fixtures(&self) -> &FixtureLoader {
        &self.fixtures
    }

    /// Checks that need no sandbox: keyword filter, statements the backend
    /// refuses, emptiness and length
    pub fn screen(&self, learner_query: &str) -> Option<Rejection> {
        if let Some(keyword) = self.filter.first_violation(learner_query) {
            log::info!("Rejected query containing forbidden keyword {keyword:?}");
            return Some(Rejection::ForbiddenOperation);
        }
        let forbidden = self.sandboxes.backend().forbidden_statements();
        if let Some(keyword) = first_forbidden_statement(learner_query, forbidden) {
            log::info!("Rejected query with a {keyword} statement");
            return Some(Rejection::ForbiddenOperation);
        }
        if split_statements(learner_query).is_empty() {
            return Some(Rejection::EmptyQuery);
        }
        if learner_query.chars().count() > self.max_query_length {
            return Some(Rejection::QueryTooLong(self.max_query_length));
        }
        None
    }

    /// Runs a learner's query against a problem and judges its output
    pub async fn verify(&self, problem_id: u32, learner_query: &str) -> Result<Verdict, VerifyError> {
        if let Some(rejection) = self.screen(learner_query) {
            return Ok(Verdict::rejected(rejection));
        }

        let started = Instant::now();
        let deadline = self.timeout.map(|timeout| started + timeout);
        let fixture = self.load_fixture(problem_id, deadline).await?;
        let query = learner_query.to_string();

        let verdict = self
            .sandboxes
            .with_sandbox(deadline, move |conn, schema| {
                Box::pin(async move {
                    log::debug!("Judging problem {problem_id} in sandbox {schema}");
                    judge(conn, &fixture, &query).await
                })
            })
            .await
            .map_err(|e| VerifyError::from_sandbox(e, problem_id))??;

        log::info!(
            "Problem {problem_id} judged in {} ms: {}",
            started.elapsed().as_millis(),
            if verdict.is_correct { "correct" } else { verdict.diagnostic.as_str() }
        );
        Ok(verdict)
    }

    /// Rows the canonical solution produces on the problem's seed data
    pub async fn expected_output(&self, problem_id: u32) -> Result<RowSet, VerifyError> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let fixture = self.load_fixture(problem_id, deadline).await?;

        self.sandboxes
            .with_sandbox(deadline, move |conn, _| {
                Box::pin(async move {
                    seed(conn, &fixture).await?;
                    solve(conn, &fixture).await
                })
            })
            .await
            .map_err(|e| VerifyError::from_sandbox(e, problem_id))?
    }

    /// Checks a published fixture: no destructive statements in its scripts,
    /// and its own solution accepted when submitted as a learner query
    pub async fn self_check(&self, problem_id: u32) -> Result<(), VerifyError> {
        let fixture = self.fixtures.load_fixture(problem_id).await?;
        let invalid = |reason: String| VerifyError::InvalidFixture { problem_id, reason };

        let setup = normalize_script(&fixture.setup_script);
        if let Some(pattern) = FORBIDDEN_IN_SETUP.iter().find(|p| setup.contains(*p)) {
            return Err(invalid(format!("setup script contains {pattern:?}")));
        }
        let solution = normalize_script(&fixture.solution_script);
        if let Some(pattern) = FORBIDDEN_IN_SOLUTION.iter().find(|p| solution.contains(*p)) {
            return Err(invalid(format!("solution script contains {pattern:?}")));
        }

        let verdict = self.verify(problem_id, &fixture.solution_script).await?;
        if !verdict.is_correct {
            return Err(invalid(verdict.diagnostic));
        }
        Ok(())
    }

    async fn load_fixture(
        &self,
        problem_id: u32,
        deadline: Option<Instant>,
    ) -> Result<ProblemFixture, VerifyError> {
        let load = self.fixtures.load_fixture(problem_id);
        let fixture = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, load)
                .await
                .map_err(|_| VerifyError::Timeout { problem_id })??,
            None => load.await?,
        };
        Ok(fixture)
    }
}

async fn seed<C: SandboxConnection>(conn: &mut C, fixture: &ProblemFixture) -> Result<(), VerifyError> {
    executor::run_setup(conn, &fixture.setup_script)
        .await
        .map(|_| ())
        .map_err(|e| VerifyError::SetupFailed {
            problem_id: fixture.problem_id,
            message: e.to_string(),
        })
}

/// The solution goes through the same path as a learner query
async fn solve<C: SandboxConnection>(conn: &mut C, fixture: &ProblemFixture) -> Result<RowSet, VerifyError> {
    executor::run_query(conn, &fixture.solution_script)
        .await
        .map_err(|e| VerifyError::SolutionFailed {
            problem_id: fixture.problem_id,
            message: e.to_string(),
        })
}

/// Seed, learner query, solution query, comparison, strictly in that order
///
/// Whatever the learner query changed is rolled back before the solution runs,
/// so the expected rows always come from the seed data.
async fn judge<C: SandboxConnection>(
    conn: &mut C,
    fixture: &ProblemFixture,
    learner_query: &str,
) -> Result<Verdict, VerifyError> {
    let actual = match executor::setup_and_run(conn, fixture, learner_query).await {
        Ok(rows) => rows,
        Err(ExecError::ExecutionFailed(message)) => {
            return Ok(Verdict::rejected(Rejection::ExecutionFailed(message)));
        }
        Err(ExecError::NoResultProduced) => {
            return Ok(Verdict::rejected(Rejection::NoResultProduced));
        }
        Err(ExecError::SetupFailed(message)) => {
            return Err(VerifyError::SetupFailed {
                problem_id: fixture.problem_id,
                message,
            });
        }
    };

    let restored = conn
        .rollback_to_checkpoint()
        .await
        .map_err(|e| VerifyError::SandboxUnavailable(e.to_string()))?;
    if restored == Rollback::Emptied {
        seed(conn, fixture).await?;
    }
    let expected = solve(conn, fixture).await?;

    if compare::equal(&expected, &actual, fixture.requires_order) {
        Ok(Verdict::correct())
    } else {
        log::debug!(
            "Problem {} mismatch: expected {} rows, got {}",
            fixture.problem_id,
            expected.len(),
            actual.len()
        );
        Ok(Verdict::rejected(Rejection::ComparisonMismatch))
    }
}

fn normalize_script(script: &str) -> String {
    script
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SqliteBackend;

    fn verifier(dir: &std::path::Path) -> Verifier<SqliteBackend> {
        Verifier::new(
            SqliteBackend::new(dir.join("scratch")).unwrap(),
            FixtureLoader::new("data/problems"),
        )
    }

    #[test]
    fn test_rejection_messages() {
        assert_eq!(
            Verdict::rejected(Rejection::ForbiddenOperation).diagnostic,
            "forbidden operation"
        );
        assert_eq!(
            Verdict::rejected(Rejection::ExecutionFailed("no such table: x".into())).diagnostic,
            "error in query execution: no such table: x"
        );
        assert_eq!(
            Verdict::rejected(Rejection::ComparisonMismatch).diagnostic,
            "output does not match expected result"
        );
        assert_eq!(Verdict::correct().diagnostic, "");
    }

    #[test]
    fn test_screen() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = verifier(dir.path());
        assert_eq!(verifier.screen("SELECT 1"), None);
        assert_eq!(
            verifier.screen("DROP TABLE Employees"),
            Some(Rejection::ForbiddenOperation)
        );
        assert_eq!(verifier.screen(" ;; \n"), Some(Rejection::EmptyQuery));
        let long = format!("SELECT {}", "1 + ".repeat(2000) + "1");
        assert_eq!(verifier.screen(&long), Some(Rejection::QueryTooLong(5000)));
    }

    #[test]
    fn test_screen_refuses_backend_statements() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = verifier(dir.path());
        for query in [
            "ATTACH DATABASE '/tmp/other.db' AS other",
            "SELECT 1; VACUUM INTO '/tmp/copy.db'",
            "/* hi */ pragma writable_schema = 1",
            "BEGIN; SELECT 1",
        ] {
            assert_eq!(
                verifier.screen(query),
                Some(Rejection::ForbiddenOperation),
                "{query}"
            );
        }
    }

    #[test]
    fn test_cleanup_failure_maps_to_unavailable() {
        let error = SandboxError::CleanupFailed {
            schema: "sandbox_x".to_string(),
            source: sqlx::Error::PoolClosed,
        };
        let mapped = VerifyError::from_sandbox(error, 1);
        assert!(matches!(mapped, VerifyError::SandboxUnavailable(_)));
        assert!(mapped.to_string().contains("sandbox_x"), "{mapped}");
    }

    #[test]
    fn test_normalize_script() {
        assert_eq!(normalize_script("DROP\n   DATABASE x"), "drop database x");
    }

    #[tokio::test]
    async fn test_expected_output_of_sample_problem() {
        let dir = tempfile::tempdir().unwrap();
        let rows = verifier(dir.path()).expected_output(1).await.unwrap();
        let json = serde_json::to_string(&rows).unwrap();
        assert_eq!(json, r#"[{"id":2}]"#);
    }

    #[tokio::test]
    async fn test_sample_problems_pass_self_check() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = verifier(dir.path());
        verifier.self_check(1).await.unwrap();
        verifier.self_check(2).await.unwrap();
    }
}
