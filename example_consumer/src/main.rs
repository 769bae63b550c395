//! Example consumer: compiles a few queries against a small blogging model and runs them.
//!
//! Without `DATABASE_URL` the queries run against scripted in-memory results. With it, they run
//! on PostgreSQL (the `Blogs` and `Posts` tables must exist).
//!
//! Run from repo root: `cargo run -p example-consumer`

use architect_orm::query::{lambda, new_object, param, var};
use architect_orm::{
    from_json, ClrType, CommandExecutor, Dialect, InMemoryExecutor, PgCommandExecutor, Query, QueryContext,
    QueryOptions, QueryParameters, Value,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const MODEL: &str = r#"{
    "entities": [
        { "name": "Blog", "table": "Blogs", "primary_key": "Id",
          "properties": [
            { "name": "Id", "type": "int" },
            { "name": "Name", "type": "string" },
            { "name": "Rating", "type": "int?" }
          ] },
        { "name": "Post", "table": "Posts", "primary_key": "Id",
          "properties": [
            { "name": "Id", "type": "int" },
            { "name": "Title", "type": "string" },
            { "name": "Score", "type": "int" },
            { "name": "BlogId", "type": "int" }
          ] }
    ],
    "relationships": [
        { "dependent": "Post", "properties": "BlogId", "principal": "Blog",
          "navigation": "Blog", "inverse": "Posts", "required": true }
    ]
}"#;

fn scripted() -> InMemoryExecutor {
    let executor = InMemoryExecutor::new();
    executor.on_sql(
        "LEFT JOIN",
        vec![
            vec![Value::Int(1), Value::Text("Rust".into()), Value::Int(5), Value::Int(10), Value::Text("Ownership".into()), Value::Int(9), Value::Int(1)],
            vec![Value::Int(1), Value::Text("Rust".into()), Value::Int(5), Value::Int(11), Value::Text("Traits".into()), Value::Int(7), Value::Int(1)],
            vec![Value::Int(2), Value::Text("Go".into()), Value::Int(4), Value::Null, Value::Null, Value::Null, Value::Null],
        ],
    );
    executor.on_sql("COUNT(*)", vec![vec![Value::Int(2)]]);
    executor.push_result(vec![
        vec![Value::Int(1), Value::Text("Rust".into())],
        vec![Value::Int(2), Value::Text("Go".into())],
    ]);
    executor
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("architect_orm=info")),
        )
        .init();

    let mut options = QueryOptions::from_env()?;
    let executor: Arc<dyn CommandExecutor> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            options.dialect = Dialect::Postgres;
            Arc::new(PgCommandExecutor::connect(&url, 5).await?)
        }
        Err(_) => Arc::new(scripted()),
    };
    let cx = QueryContext::new(from_json(MODEL)?, options, executor);
    let cancel = CancellationToken::new();

    let min_rating = QueryParameters::new().with("min", 3);
    let rated = Query::from("Blog").filter(lambda(
        &["b"],
        var("b").member("Rating").gt(param("min", ClrType::Int32)),
    ));
    let count = cx.count_async(&rated, &min_rating, &cancel).await?;
    tracing::info!(count, "blogs rated above 3");

    let names = rated.clone().select(lambda(
        &["b"],
        new_object(vec![("Id", var("b").member("Id")), ("Name", var("b").member("Name"))]),
    ));
    for blog in cx.to_list_async(&names, &min_rating, &cancel).await? {
        tracing::info!(blog = %blog.to_json(true), "blog");
    }

    let with_posts = Query::from("Blog").include("Posts");
    for blog in cx.to_list_async(&with_posts, &QueryParameters::new(), &cancel).await? {
        tracing::info!(blog = %blog.to_json(true), "blog with posts");
    }
    tracing::info!(tracked = cx.tracked_entries().len(), "tracked entities");
    Ok(())
}
