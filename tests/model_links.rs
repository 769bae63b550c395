mod common;

use architect_orm::from_json;

const SPLIT: &str = r#"{
    "entities": [
        { "name": "Order", "table": "Orders", "primary_key": "Id",
          "properties": [ { "name": "Id", "type": "int" }, { "name": "Total", "type": "double" } ] },
        { "name": "OrderDetails", "table": "Orders", "primary_key": "Id",
          "properties": [ { "name": "Id", "type": "int" }, { "name": "Status", "type": "string" } ] }
    ],
    "relationships": [
        { "dependent": "OrderDetails", "properties": "Id", "principal": "Order", "unique": true,
          "navigation": "Order", "inverse": "Details" }
    ]
}"#;

#[test]
fn shared_table_link_is_the_primary_key_foreign_key() {
    let model = from_json(SPLIT).unwrap();
    let order = model.find_entity_type("Order").unwrap();
    let details = model.find_entity_type("OrderDetails").unwrap();
    let link = model.find_shared_table_link(details).unwrap();
    assert_eq!(model.foreign_key(link).principal_type, order);
    assert!(model.find_shared_table_link(order).is_none());
}

#[test]
fn distinct_tables_have_no_shared_table_link() {
    let model = common::blogging();
    let post = model.find_entity_type("Post").unwrap();
    let blog = model.find_entity_type("Blog").unwrap();
    assert!(model.find_shared_table_link(post).is_none());
    assert!(model.find_shared_table_link(blog).is_none());
}

#[test]
fn same_columns_on_another_schema_are_not_linked() {
    let json = SPLIT.replacen(r#""table": "Orders", "primary_key""#, r#""table": "Orders", "schema": "archive", "primary_key""#, 1);
    let model = from_json(&json).unwrap();
    let details = model.find_entity_type("OrderDetails").unwrap();
    assert!(model.find_shared_table_link(details).is_none());
}
