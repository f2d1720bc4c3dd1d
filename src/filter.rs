/// Keywords rejected when no explicit list is configured
pub const DEFAULT_FORBIDDEN_KEYWORDS: [&str; 5] = ["insert", "delete", "update", "drop", "alter"];

/// Coarse keyword screen applied to learner input before anything executes
///
/// This is a substring scan, not a parser: a column called `update_time` or a
/// string literal containing `drop` is rejected as well. Isolation of each run
/// in its own namespace is what actually contains a query.
#[derive(Debug, Clone)]
pub struct SafetyFilter {
    keywords: Vec<String>,
}

impl SafetyFilter {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keywords }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn is_safe(&self, query: &str) -> bool {
        self.first_violation(query).is_none()
    }

    /// Returns the first configured keyword found in `query`
    pub fn first_violation(&self, query: &str) -> Option<&str> {
        let lowered = query.to_lowercase();
        self.keywords
            .iter()
            .find(|k| lowered.contains(k.as_str()))
            .map(String::as_str)
    }
}

impl Default for SafetyFilter {
    fn default() -> Self {
        Self::new(DEFAULT_FORBIDDEN_KEYWORDS)
    }
}

/// Lowercased keyword a statement starts with
///
/// Leading comments are skipped, and so is an `EXPLAIN` or `EXPLAIN QUERY
/// PLAN` prefix, since SQLite still runs the statement behind it.
pub fn leading_keyword(statement: &str) -> Option<String> {
    let mut rest = statement;
    loop {
        rest = skip_comments(rest);
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        let word = rest[..end].to_ascii_lowercase();
        match word.as_str() {
            "explain" | "query" | "plan" => rest = &rest[end..],
            _ => return Some(word),
        }
    }
}

fn skip_comments(mut text: &str) -> &str {
    loop {
        text = text.trim_start();
        if let Some(tail) = text.strip_prefix("--") {
            text = tail.split_once('\n').map_or("", |(_, next)| next);
        } else if let Some(tail) = text.strip_prefix("/*") {
            text = tail.split_once("*/").map_or("", |(_, next)| next);
        } else {
            return text;
        }
    }
}

/// First statement of `script` whose leading keyword is in `forbidden`
///
/// Splits on every `;`, like the executor does, so no statement that reaches
/// the engine escapes the check.
pub fn first_forbidden_statement(script: &str, forbidden: &[&str]) -> Option<String> {
    script
        .split(';')
        .filter_map(leading_keyword)
        .find(|keyword| forbidden.contains(&keyword.as_str()))
}
