//! Row-level merge helpers for JSON row payloads.

use serde_json::{Map, Value};

/// Merge a remote row payload onto a local one.
///
/// Without a column list the remote row replaces the local row. With one,
/// only the listed columns present in `remote` are copied over. Non-object
/// inputs are treated as full replacements.
pub fn merge_row(local: &Value, remote: &Value, columns: Option<&[String]>) -> Value {
    let (Some(columns), Some(local_map), Some(remote_map)) =
        (columns, local.as_object(), remote.as_object())
    else {
        return remote.clone();
    };

    let mut merged = local_map.clone();
    for column in columns {
        if let Some(value) = remote_map.get(column) {
            merged.insert(column.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

/// Column/value pairs an update writes.
///
/// With a column list, only those columns present in the row are returned;
/// otherwise every column except `skip` (the key column).
pub fn changed_values<'a>(
    row: &'a Map<String, Value>,
    columns: Option<&'a [String]>,
    skip: &str,
) -> Vec<(&'a str, &'a Value)> {
    match columns {
        Some(columns) => columns
            .iter()
            .filter(|c| c.as_str() != skip)
            .filter_map(|c| row.get(c).map(|v| (c.as_str(), v)))
            .collect(),
        None => row
            .iter()
            .filter(|(c, _)| c.as_str() != skip)
            .map(|(c, v)| (c.as_str(), v))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_replace_without_columns() {
        let local = json!({"id": "r1", "name": "a", "n": 1});
        let remote = json!({"id": "r1", "name": "b"});
        assert_eq!(merge_row(&local, &remote, None), remote);
    }

    #[test]
    fn test_partial_merge_copies_listed_columns() {
        let local = json!({"id": "r1", "name": "a", "n": 1});
        let remote = json!({"id": "r1", "name": "b", "n": 2});
        let columns = vec!["name".to_string(), "missing".to_string()];

        let merged = merge_row(&local, &remote, Some(&columns));
        assert_eq!(merged, json!({"id": "r1", "name": "b", "n": 1}));
    }

    #[test]
    fn test_changed_values_skips_key() {
        let row = json!({"id": "r1", "name": "b", "n": 2});
        let row = row.as_object().unwrap();

        let all = changed_values(row, None, "id");
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|(c, _)| *c != "id"));

        let columns = vec!["n".to_string(), "id".to_string(), "gone".to_string()];
        let some = changed_values(row, Some(&columns), "id");
        assert_eq!(some, vec![("n", &json!(2))]);
    }
}
