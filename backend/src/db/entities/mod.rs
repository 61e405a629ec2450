//! SeaORM entities backing the persistence port.
//!
//! `records` and `records_long_term` share one shape; the long-term table only
//! ever receives compacted rows.

pub mod client;
pub mod load_notification;
pub mod offline_notification;
pub mod ping_record;
pub mod ping_task;
pub mod record;
pub mod record_long_term;
pub mod task;
pub mod task_result;

use sea_orm::entity::prelude::Json;

/// Decodes a JSON array of client uuids stored in a `clients` column.
/// Anything that is not an array of strings yields an empty list.
pub fn client_list(value: &Json) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

pub fn client_list_json(clients: &[String]) -> Json {
    Json::Array(clients.iter().cloned().map(Json::String).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_list_ignores_non_string_entries() {
        let value = json!(["a", 1, "b", null]);
        assert_eq!(client_list(&value), vec!["a".to_string(), "b".to_string()]);
        assert!(client_list(&json!({"a": 1})).is_empty());
    }

    #[test]
    fn client_list_json_keeps_order() {
        let clients = vec!["u2".to_string(), "u1".to_string()];
        assert_eq!(client_list(&client_list_json(&clients)), clients);
    }
}
