use std::sync::LazyLock;

use regex::Regex;

static RE_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Build a column reference for the formula sublanguage.
///
/// Column ids that are valid bare identifiers render as `alias.column`;
/// anything else (spaces, punctuation) is bracketed with the id JSON-quoted
/// so the downstream formula parser cannot misread it as operators:
/// `alias["net revenue"]`. The quoting must be exact; a wrong choice here
/// corrupts the formula silently instead of erroring.
pub fn column_ref(alias: &str, column_id: &str) -> String {
    if RE_IDENT.is_match(column_id) {
        format!("{alias}.{column_id}")
    } else {
        // serde_json string encoding handles embedded quotes and escapes.
        let quoted = serde_json::to_string(column_id).unwrap_or_else(|_| format!("{column_id:?}"));
        format!("{alias}[{quoted}]")
    }
}

/// A `SUM(...)` aggregate over one column reference.
pub fn sum_ref(alias: &str, column_id: &str) -> String {
    format!("SUM({})", column_ref(alias, column_id))
}
