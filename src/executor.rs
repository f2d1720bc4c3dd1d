use thiserror::Error;

use crate::fixture::ProblemFixture;
use crate::rows::RowSet;
use crate::sandbox::SandboxConnection;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecError {
    /// The fixture's own setup script failed, not the learner's fault
    #[error("setup script failed: {0}")]
    SetupFailed(String),
    #[error("{0}")]
    ExecutionFailed(String),
    #[error("no SELECT result found from user query")]
    NoResultProduced,
}

/// Splits a script on `;` and drops empty statements
///
/// There is no lexer behind this: a `;` inside a string literal or a
/// procedural block splits the statement in two.
pub fn split_statements(script: &str) -> Vec<&str> {
    script
        .split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty())
        .collect()
}

/// Whether a statement's rows are captured: it starts with SELECT or WITH
pub fn returns_rows(statement: &str) -> bool {
    let lowered = statement.trim_start().to_lowercase();
    lowered.starts_with("select") || lowered.starts_with("with")
}

/// Runs every statement of a setup script in source order
///
/// Returns the number of statements executed.
pub async fn run_setup<C: SandboxConnection>(conn: &mut C, script: &str) -> Result<usize, ExecError> {
    let statements = split_statements(script);
    for stmt in &statements {
        conn.execute(stmt)
            .await
            .map_err(|e| ExecError::SetupFailed(e.to_string()))?;
    }
    Ok(statements.len())
}

/// Runs every statement of `query` and keeps the rows of the last SELECT/WITH
///
/// Earlier result-producing statements still run; their rows are discarded.
/// The first failing statement aborts the whole query.
pub async fn run_query<C: SandboxConnection>(conn: &mut C, query: &str) -> Result<RowSet, ExecError> {
    let mut captured = None;

    for stmt in split_statements(query) {
        if returns_rows(stmt) {
            let rows = conn
                .fetch(stmt)
                .await
                .map_err(|e| ExecError::ExecutionFailed(e.to_string()))?;
            captured = Some(rows);
        } else {
            conn.execute(stmt)
                .await
                .map_err(|e| ExecError::ExecutionFailed(e.to_string()))?;
        }
    }

    captured.ok_or(ExecError::NoResultProduced)
}

/// Seeds the sandbox with the fixture data, checkpoints it, then runs the
/// learner's query
pub async fn setup_and_run<C: SandboxConnection>(
    conn: &mut C,
    fixture: &ProblemFixture,
    learner_query: &str,
) -> Result<RowSet, ExecError> {
    let executed = run_setup(conn, &fixture.setup_script).await?;
    conn.checkpoint()
        .await
        .map_err(|e| ExecError::SetupFailed(e.to_string()))?;
    log::debug!(
        "Seeded problem {} with {executed} statements",
        fixture.problem_id
    );
    run_query(conn, learner_query).await
}
