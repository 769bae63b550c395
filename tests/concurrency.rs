mod common;

use architect_orm::{InMemoryExecutor, Query, QueryError, QueryParameters, TrackingBehavior, Value};
use common::{context, row};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn slow_blogs() -> InMemoryExecutor {
    let executor = InMemoryExecutor::new().with_row_delay(Duration::from_millis(20));
    executor.on_sql("COUNT(*)", vec![vec![Value::Int(3)]]);
    executor.push_result(
        (1..=3)
            .map(|id| vec![Value::Int(id), Value::Text(format!("blog {}", id)), Value::Null])
            .collect(),
    );
    executor
}

fn assert_concurrent(result: Result<impl std::fmt::Debug, QueryError>, expected_active: &str, expected_attempted: &str) {
    match result {
        Err(QueryError::ConcurrentAccess { active, attempted }) => {
            assert_eq!(active, expected_active);
            assert_eq!(attempted, expected_attempted);
        }
        other => panic!("expected concurrent access, got {:?}", other),
    }
}

#[tokio::test]
async fn async_operation_rejects_a_second_async_operation() {
    let executor = slow_blogs();
    let cx = context(&executor, TrackingBehavior::NoTracking);
    let cancel = CancellationToken::new();
    let params = QueryParameters::new();
    let q = Query::from("Blog");

    let (listed, counted) = tokio::join!(cx.to_list_async(&q, &params, &cancel), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        cx.count_async(&q, &params, &cancel).await
    });
    assert_eq!(listed.unwrap().len(), 3);
    assert_concurrent(counted, "ToList", "Count");

    assert_eq!(cx.count_async(&q, &params, &cancel).await.unwrap(), 3);
}

#[tokio::test]
async fn async_operation_rejects_a_sync_operation() {
    let executor = slow_blogs();
    let cx = context(&executor, TrackingBehavior::NoTracking);
    let cancel = CancellationToken::new();
    let params = QueryParameters::new();
    let q = Query::from("Blog");

    let (listed, any) = tokio::join!(cx.to_list_async(&q, &params, &cancel), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        cx.any(&q, &params)
    });
    assert!(listed.is_ok());
    assert_concurrent(any, "ToList", "Any");
    assert_eq!(cx.count(&q, &params).unwrap(), 3);
}

#[tokio::test]
async fn cancellation_stops_shaping_and_frees_the_context() {
    let executor = slow_blogs();
    let cx = context(&executor, TrackingBehavior::NoTracking);
    let cancel = CancellationToken::new();
    let params = QueryParameters::new();
    let q = Query::from("Blog");

    let (listed, _) = tokio::join!(cx.to_list_async(&q, &params, &cancel), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    });
    assert!(matches!(listed, Err(QueryError::Cancelled)));

    let fresh = CancellationToken::new();
    assert_eq!(cx.count_async(&q, &params, &fresh).await.unwrap(), 3);
}

#[tokio::test]
async fn dropping_an_unfinished_operation_frees_the_context() {
    let executor = slow_blogs();
    let cx = context(&executor, TrackingBehavior::NoTracking);
    let cancel = CancellationToken::new();
    let params = QueryParameters::new();
    let q = Query::from("Blog");

    let timed_out = tokio::time::timeout(Duration::from_millis(5), cx.to_list_async(&q, &params, &cancel)).await;
    assert!(timed_out.is_err());
    assert_eq!(cx.count(&q, &params).unwrap(), 3);
}

fn blog_with_post(sql: &str, blog: i64, post: i64) -> Vec<Value> {
    row(
        sql,
        &[
            ("\"b\".\"Id\"", Value::Int(blog)),
            ("\"b\".\"Name\"", Value::Text(format!("blog {}", blog))),
            ("\"p\".\"Id\"", Value::Int(post)),
            ("\"p\".\"Title\"", Value::Text(format!("post {}", post))),
            ("\"p\".\"BlogId\"", Value::Int(blog)),
        ],
    )
}

/// Two blogs with two posts each, one row every 30ms.
fn slow_blogs_with_posts(sql: &str) -> InMemoryExecutor {
    let executor = InMemoryExecutor::new().with_row_delay(Duration::from_millis(30));
    executor.push_result(vec![
        blog_with_post(sql, 1, 10),
        blog_with_post(sql, 1, 11),
        blog_with_post(sql, 2, 12),
        blog_with_post(sql, 2, 13),
    ]);
    executor
}

async fn cancel_tracked_include_after(millis: u64) -> Vec<(String, Value)> {
    let q = Query::from("Blog").include("Posts");
    let sql = context(&InMemoryExecutor::new(), TrackingBehavior::TrackAll).compile(&q).unwrap().command.sql.clone();
    let executor = slow_blogs_with_posts(&sql);
    let cx = context(&executor, TrackingBehavior::TrackAll);
    let cancel = CancellationToken::new();
    let params = QueryParameters::new();

    let (listed, _) = tokio::join!(cx.to_list_async(&q, &params, &cancel), async {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        cancel.cancel();
    });
    assert!(matches!(listed, Err(QueryError::Cancelled)));
    let mut tracked: Vec<(String, Value)> = cx
        .tracked_entries()
        .into_iter()
        .map(|e| (e.instance.type_name().to_string(), e.key.values[0].clone()))
        .collect();
    tracked.sort_by_key(|(name, key)| (name.clone(), format!("{:?}", key)));
    tracked
}

#[tokio::test]
async fn cancelling_inside_a_collection_tracks_nothing_unfinished() {
    // The second post of blog 1 has been read; its group is still open.
    assert!(cancel_tracked_include_after(75).await.is_empty());
}

#[tokio::test]
async fn cancelling_after_a_finished_group_tracks_only_that_group() {
    // Blog 2's first row closed blog 1's group.
    let tracked = cancel_tracked_include_after(105).await;
    assert_eq!(
        tracked,
        vec![
            ("Blog".to_string(), Value::Int(1)),
            ("Post".to_string(), Value::Int(10)),
            ("Post".to_string(), Value::Int(11)),
        ]
    );
}
