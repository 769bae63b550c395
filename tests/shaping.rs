mod common;

use architect_orm::query::{lambda, new_object, var, ClientFunction, DeclaringType};
use architect_orm::shaper::Shaper;
use architect_orm::{
    ClientFunctions, InMemoryExecutor, Query, QueryParameters, ShapedValue, TrackingBehavior, Value,
};
use common::{context, row, select_list};
use std::sync::Arc;

fn blog(sql: &str, id: i64, name: &str) -> Vec<Value> {
    row(sql, &[("\"b\".\"Id\"", Value::Int(id)), ("\"b\".\"Name\"", Value::Text(name.into()))])
}

fn blog_with_post(sql: &str, blog: i64, post: i64, title: &str) -> Vec<Value> {
    row(
        sql,
        &[
            ("\"b\".\"Id\"", Value::Int(blog)),
            ("\"b\".\"Name\"", Value::Text(format!("blog {}", blog))),
            ("\"p\".\"Id\"", Value::Int(post)),
            ("\"p\".\"Title\"", Value::Text(title.into())),
            ("\"p\".\"BlogId\"", Value::Int(blog)),
        ],
    )
}

fn id(value: &ShapedValue) -> Option<&Value> {
    value.as_entity()?.get("Id")
}

fn post_titles(value: &ShapedValue) -> Vec<String> {
    let posts = value.as_entity().and_then(|b| b.navigation("Posts")).unwrap();
    posts
        .as_collection()
        .unwrap()
        .iter()
        .map(|p| match p.as_entity().and_then(|p| p.get("Title")) {
            Some(Value::Text(t)) => t.clone(),
            other => panic!("unexpected title {:?}", other),
        })
        .collect()
}

#[test]
fn tracked_queries_share_instances_by_key() {
    let executor = InMemoryExecutor::new();
    let cx = context(&executor, TrackingBehavior::TrackAll);
    let q = Query::from("Blog");
    let sql = cx.compile(&q).unwrap().command.sql.clone();
    executor.push_result(vec![blog(&sql, 1, "a"), blog(&sql, 2, "b")]);
    executor.push_result(vec![blog(&sql, 2, "b"), blog(&sql, 1, "a")]);

    let first = cx.to_list(&q, &QueryParameters::new()).unwrap();
    let second = cx.to_list(&q, &QueryParameters::new()).unwrap();
    let (a1, b1) = (first[0].as_entity().unwrap(), first[1].as_entity().unwrap());
    let (b2, a2) = (second[0].as_entity().unwrap(), second[1].as_entity().unwrap());
    assert!(Arc::ptr_eq(a1, a2));
    assert!(Arc::ptr_eq(b1, b2));
    assert!(!Arc::ptr_eq(a1, b1));
    assert_eq!(cx.tracked_entries().len(), 2);
    let entry = &cx.tracked_entries()[0];
    assert_eq!(entry.original_value("Name"), Some(&Value::Text("a".into())));
}

#[test]
fn untracked_queries_never_reuse_instances() {
    let executor = InMemoryExecutor::new();
    let cx = context(&executor, TrackingBehavior::NoTracking);
    let q = Query::from("Blog");
    let sql = cx.compile(&q).unwrap().command.sql.clone();
    executor.push_result(vec![blog(&sql, 1, "a"), blog(&sql, 1, "a")]);
    executor.push_result(vec![blog(&sql, 1, "a")]);

    let first = cx.to_list(&q, &QueryParameters::new()).unwrap();
    let second = cx.to_list(&q, &QueryParameters::new()).unwrap();
    assert!(!Arc::ptr_eq(first[0].as_entity().unwrap(), first[1].as_entity().unwrap()));
    assert!(!Arc::ptr_eq(first[0].as_entity().unwrap(), second[0].as_entity().unwrap()));
    assert!(cx.tracked_entries().is_empty());
}

#[test]
fn identity_resolution_without_tracking_is_per_query() {
    let executor = InMemoryExecutor::new();
    let cx = context(&executor, TrackingBehavior::NoTrackingWithIdentityResolution);
    let q = Query::from("Blog");
    let sql = cx.compile(&q).unwrap().command.sql.clone();
    executor.push_result(vec![blog(&sql, 1, "a"), blog(&sql, 1, "a")]);
    executor.push_result(vec![blog(&sql, 1, "a")]);

    let first = cx.to_list(&q, &QueryParameters::new()).unwrap();
    let second = cx.to_list(&q, &QueryParameters::new()).unwrap();
    assert!(Arc::ptr_eq(first[0].as_entity().unwrap(), first[1].as_entity().unwrap()));
    assert!(!Arc::ptr_eq(first[0].as_entity().unwrap(), second[0].as_entity().unwrap()));
    assert!(cx.tracked_entries().is_empty());
}

#[test]
fn ordered_rows_group_collections_by_parent() {
    let executor = InMemoryExecutor::new();
    let cx = context(&executor, TrackingBehavior::NoTracking);
    let q = Query::from("Blog").include("Posts");
    let sql = cx.compile(&q).unwrap().command.sql.clone();
    executor.push_result(vec![
        blog_with_post(&sql, 1, 10, "a"),
        blog_with_post(&sql, 1, 11, "b"),
        blog_with_post(&sql, 2, 12, "c"),
    ]);

    let blogs = cx.to_list(&q, &QueryParameters::new()).unwrap();
    assert_eq!(blogs.len(), 2);
    assert_eq!(post_titles(&blogs[0]), vec!["a", "b"]);
    assert_eq!(post_titles(&blogs[1]), vec!["c"]);
}

#[test]
fn unordered_rows_split_a_group() {
    let executor = InMemoryExecutor::new();
    let cx = context(&executor, TrackingBehavior::NoTracking);
    let q = Query::from("Blog").include("Posts");
    let sql = cx.compile(&q).unwrap().command.sql.clone();
    executor.push_result(vec![
        blog_with_post(&sql, 1, 10, "a"),
        blog_with_post(&sql, 2, 12, "c"),
        blog_with_post(&sql, 1, 11, "b"),
    ]);

    let blogs = cx.to_list(&q, &QueryParameters::new()).unwrap();
    assert_eq!(blogs.len(), 3);
    assert_eq!(id(&blogs[0]), id(&blogs[2]));
    assert_eq!(post_titles(&blogs[0]), vec!["a"]);
    assert_eq!(post_titles(&blogs[2]), vec!["b"]);
}

#[test]
fn blog_without_posts_has_an_empty_collection() {
    let executor = InMemoryExecutor::new();
    let cx = context(&executor, TrackingBehavior::NoTracking);
    let q = Query::from("Blog").include("Posts");
    let sql = cx.compile(&q).unwrap().command.sql.clone();
    executor.push_result(vec![blog(&sql, 3, "empty")]);

    let blogs = cx.to_list(&q, &QueryParameters::new()).unwrap();
    assert_eq!(blogs.len(), 1);
    assert!(post_titles(&blogs[0]).is_empty());
}

#[test]
fn projection_reads_only_requested_members() {
    let executor = InMemoryExecutor::new();
    let cx = context(&executor, TrackingBehavior::NoTracking);
    let q = Query::from("Blog").select(lambda(
        &["b"],
        new_object(vec![("Id", var("b").member("Id")), ("Name", var("b").member("Name"))]),
    ));
    let compiled = cx.compile(&q).unwrap();
    let sql = compiled.command.sql.clone();
    assert_eq!(select_list(&sql), vec!["\"b\".\"Id\"", "\"b\".\"Name\""]);
    assert!(!sql.contains("Hidden"));
    let Shaper::Object(members) = &compiled.shaper else {
        panic!("expected an object shaper, got {:?}", compiled.shaper);
    };
    assert_eq!(members.len(), 2);
    assert!(members.iter().all(|(_, s)| matches!(s, Shaper::Scalar(_))));

    executor.push_result(vec![vec![Value::Int(1), Value::Text("a".into())]]);
    let results = cx.to_list(&q, &QueryParameters::new()).unwrap();
    assert_eq!(results[0].to_json(false), serde_json::json!({ "Id": 1, "Name": "a" }));
    assert!(results[0].field("Hidden").is_none());
}

#[test]
fn group_counts_materialize_with_their_key() {
    let executor = InMemoryExecutor::new();
    let cx = context(&executor, TrackingBehavior::NoTracking);
    let q = Query::from("Post")
        .group_by(lambda(&["p"], var("p").member("BlogId")))
        .select(lambda(
            &["g"],
            new_object(vec![
                ("BlogId", var("g").member("Key")),
                ("Posts", var("g").seq("Count", vec![])),
            ]),
        ));
    let sql = cx.compile(&q).unwrap().command.sql.clone();
    assert!(sql.contains("GROUP BY \"p\".\"BlogId\""), "{}", sql);
    executor.push_result(vec![
        vec![Value::Int(1), Value::Int(2)],
        vec![Value::Int(2), Value::Int(1)],
    ]);

    let groups = cx.to_list(&q, &QueryParameters::new()).unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].to_json(true), serde_json::json!({ "blogId": 1, "posts": 2 }));
}

#[test]
fn untranslatable_projection_calls_the_client_function() {
    let executor = InMemoryExecutor::new();
    let mut functions = ClientFunctions::default();
    let shout: ClientFunction = Arc::new(|args: &[ShapedValue]| match args.first() {
        Some(ShapedValue::Scalar(Value::Text(s))) => Ok(ShapedValue::Scalar(Value::Text(s.to_uppercase()))),
        _ => Ok(ShapedValue::Null),
    });
    functions.register(&DeclaringType::Custom("Text".into()), "Shout", shout);
    let cx = context(&executor, TrackingBehavior::NoTracking).with_client_functions(functions);

    let q = Query::from("Blog").select(lambda(
        &["b"],
        var("b").member("Name").call(DeclaringType::Custom("Text".into()), "Shout", vec![]),
    ));
    let sql = cx.compile(&q).unwrap().command.sql.clone();
    executor.push_result(vec![blog(&sql, 1, "quiet")]);

    let results = cx.to_list(&q, &QueryParameters::new()).unwrap();
    assert_eq!(results, vec![ShapedValue::Scalar(Value::Text("QUIET".into()))]);
}
