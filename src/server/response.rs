//! Response rendering: JSON envelope, CSV serialization, pagination link
//! assembly.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

/// `next` link for a paginated read: the current query string with
/// `offset` advanced by `limit` and every other parameter untouched.
/// Empty when the result set is exhausted.
pub fn next_url(
    path: &str,
    query: &BTreeMap<String, String>,
    offset: i64,
    limit: i64,
    total_count: i64,
) -> String {
    if offset + limit >= total_count {
        return String::new();
    }

    let mut next_query = query.clone();
    next_query.insert("offset".to_string(), (offset + limit).to_string());
    if !next_query.contains_key("limit") {
        next_query.insert("limit".to_string(), limit.to_string());
    }

    let serialized = next_query
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{path}?{serialized}")
}

/// Standard envelope for paginated reads.
pub fn json_envelope(rows: Vec<Map<String, Value>>, next: &str, total_count: i64) -> Value {
    json!({
        "data": rows,
        "next": next,
        "total_count": total_count,
    })
}

/// Render rows as CSV: header from the first record's keys in insertion
/// order, one line per record.
pub fn rows_to_csv(rows: &[Map<String, Value>]) -> String {
    let Some(first) = rows.first() else {
        return String::new();
    };

    let columns: Vec<&String> = first.keys().collect();
    let mut out = String::new();

    out.push_str(
        &columns
            .iter()
            .map(|c| escape_csv(c))
            .collect::<Vec<_>>()
            .join(","),
    );
    out.push('\n');

    for row in rows {
        let line = columns
            .iter()
            .map(|column| escape_csv(&value_to_csv(row.get(*column))))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push('\n');
    }

    out
}

fn value_to_csv(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Quote fields containing a comma, quote or newline; inner quotes are
/// doubled.
fn escape_csv(field: &str) -> String {
    if !field.contains([',', '"', '\n']) {
        return field.to_string();
    }
    let mut out = String::with_capacity(field.len() + 2);
    out.push('"');
    for c in field.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}
