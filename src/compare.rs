use std::cmp::Ordering;

use crate::rows::{Row, RowSet, Scalar};

/// Decides whether the learner's rows match the expected rows
///
/// With `requires_order` unset both sides are sorted before comparison, using
/// the values of each row taken in the expected result's column order. Rows
/// are otherwise compared positionally.
pub fn equal(expected: &RowSet, actual: &RowSet, requires_order: bool) -> bool {
    if expected.len() != actual.len() {
        return false;
    }

    if requires_order {
        return expected.rows() == actual.rows();
    }

    let columns = expected.columns();
    let expected = sorted_rows(expected, &columns);
    let actual = sorted_rows(actual, &columns);
    expected == actual
}

fn sorted_rows<'a>(rows: &'a RowSet, columns: &[&str]) -> Vec<&'a Row> {
    let mut sorted: Vec<&Row> = rows.rows().iter().collect();
    sorted.sort_by(|a, b| compare_rows(a, b, columns));
    sorted
}

/// Lexicographic order over the row's values in the given column order,
/// followed by any columns of the row outside that list
fn compare_rows(a: &Row, b: &Row, columns: &[&str]) -> Ordering {
    sort_key(a, columns).cmp(&sort_key(b, columns))
}

fn sort_key<'r>(row: &'r Row, columns: &[&str]) -> Vec<Option<&'r Scalar>> {
    let mut key: Vec<Option<&Scalar>> = columns.iter().map(|c| row.get(c)).collect();
    key.extend(
        row.columns()
            .filter(|c| !columns.contains(c))
            .map(|c| row.get(c)),
    );
    key
}
