#![allow(dead_code)]

use architect_orm::{from_json, InMemoryExecutor, Model, QueryContext, QueryOptions, TrackingBehavior, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const BLOGGING: &str = r#"{
    "entities": [
        { "name": "Blog", "table": "Blogs", "primary_key": "Id",
          "properties": [
            { "name": "Id", "type": "int" },
            { "name": "Name", "type": "string" },
            { "name": "Hidden", "type": "string?" }
          ] },
        { "name": "Post", "table": "Posts", "primary_key": "Id",
          "properties": [
            { "name": "Id", "type": "int" },
            { "name": "Title", "type": "string" },
            { "name": "BlogId", "type": "int" }
          ] }
    ],
    "relationships": [
        { "dependent": "Post", "properties": "BlogId", "principal": "Blog",
          "navigation": "Blog", "inverse": "Posts", "required": true }
    ]
}"#;

pub fn blogging() -> Model {
    from_json(BLOGGING).unwrap()
}

pub fn context(executor: &InMemoryExecutor, tracking: TrackingBehavior) -> QueryContext {
    QueryContext::new(
        blogging(),
        QueryOptions::default().with_tracking(tracking),
        Arc::new(executor.clone()),
    )
}

/// Orders `values` (keyed by rendered column, e.g. `"b"."Id"`) by the select list of `sql`.
/// Columns not given are null.
pub fn row(sql: &str, values: &[(&str, Value)]) -> Vec<Value> {
    let values: HashMap<&str, &Value> = values.iter().map(|(c, v)| (*c, v)).collect();
    select_list(sql)
        .into_iter()
        .map(|column| values.get(column.as_str()).map(|v| (*v).clone()).unwrap_or(Value::Null))
        .collect()
}

pub fn select_list(sql: &str) -> Vec<String> {
    let list = sql
        .strip_prefix("SELECT ")
        .and_then(|s| s.split("\nFROM").next())
        .unwrap_or_default();
    list.split(", ")
        .map(|item| item.split(" AS ").next().unwrap_or(item).to_string())
        .collect()
}
