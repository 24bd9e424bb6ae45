mod common;

use std::collections::HashSet;

use common::open_users_database;
use tidemark_engine::{Hlc, Query, Row, Value, Where};

fn parse_hlc(row: &Row, column: &str) -> Hlc {
    Hlc::parse(
        row.get(column)
            .and_then(Value::as_text)
            .unwrap_or_else(|| panic!("column {column} missing")),
    )
    .expect("stored HLCs parse")
}

#[tokio::test]
async fn system_version_never_precedes_creation() {
    let db = open_users_database().await;
    let system_id = db
        .insert("users", Row::new().with("name", Value::text("Ada")))
        .await
        .expect("insert");

    let row = db
        .get_by_system_id("users", &system_id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(
        parse_hlc(&row, "system_version"),
        parse_hlc(&row, "system_created_at"),
        "a fresh row carries one stamp for both"
    );

    for age in 1..4 {
        db.update_by_system_id("users", &system_id, Row::new().with("age", Value::Integer(age)))
            .await
            .expect("update");
        let row = db
            .get_by_system_id("users", &system_id)
            .await
            .expect("get")
            .expect("row");
        assert!(parse_hlc(&row, "system_version") >= parse_hlc(&row, "system_created_at"));
    }
}

#[tokio::test]
async fn lww_shadow_is_monotonically_nondecreasing() {
    let db = open_users_database().await;
    let system_id = db
        .insert("users", Row::new().with("name", Value::text("v0")))
        .await
        .expect("insert");

    let mut previous: Option<Hlc> = None;
    for revision in 1..5 {
        db.update_by_system_id(
            "users",
            &system_id,
            Row::new().with("name", Value::text(format!("v{revision}"))),
        )
        .await
        .expect("update");
        let row = db
            .get_by_system_id("users", &system_id)
            .await
            .expect("get")
            .expect("row");
        let shadow = parse_hlc(&row, "name__hlc");
        if let Some(previous) = &previous {
            assert!(shadow >= *previous);
        }
        previous = Some(shadow);
    }
}

#[tokio::test]
async fn inserted_system_ids_are_unique() {
    let db = open_users_database().await;
    let mut seen = HashSet::new();
    for index in 0..32 {
        let system_id = db
            .insert(
                "users",
                Row::new().with("name", Value::text(format!("u{index}"))),
            )
            .await
            .expect("insert");
        assert!(seen.insert(system_id), "system_id must be unique per table");
    }
}

#[tokio::test]
async fn every_mutation_journals_exactly_one_entry_per_row() {
    let db = open_users_database().await;
    let system_id = db
        .insert("users", Row::new().with("name", Value::text("Ada")))
        .await
        .expect("insert");
    assert_eq!(db.dirty_rows().await.expect("journal").len(), 1);

    db.update_by_system_id("users", &system_id, Row::new().with("age", Value::Integer(1)))
        .await
        .expect("update");
    assert_eq!(db.dirty_rows().await.expect("journal").len(), 2);

    db.delete_by_system_id("users", &system_id)
        .await
        .expect("delete");
    let entries = db.dirty_rows().await.expect("journal");
    assert_eq!(entries.len(), 3);
    assert!(entries
        .iter()
        .all(|entry| entry.row_id == system_id && entry.table == "users"));
}

#[tokio::test]
async fn queries_after_commit_see_the_write() {
    let db = open_users_database().await;
    db.insert(
        "users",
        Row::new()
            .with("name", Value::text("Ada"))
            .with("status", Value::text("active")),
    )
    .await
    .expect("insert");

    let result = db
        .query(
            &Query::from("users")
                .select("name")
                .filter(Where::eq("status", Value::text("active"))),
        )
        .await
        .expect("query");
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get("name"), Some(&Value::text("Ada")));
}

#[tokio::test]
async fn failed_writes_leave_no_journal_entry_or_row() {
    let db = open_users_database().await;
    db.insert(
        "users",
        Row::new()
            .with("id", Value::Guid("dup".to_string()))
            .with("name", Value::text("first")),
    )
    .await
    .expect("first insert");

    // Unique key on users.id: the duplicate must fail and roll back.
    let err = db
        .insert(
            "users",
            Row::new()
                .with("id", Value::Guid("dup".to_string()))
                .with("name", Value::text("second")),
        )
        .await
        .expect_err("duplicate unique key");
    assert!(matches!(err, tidemark_engine::DbError::Create { .. }));

    assert_eq!(db.dirty_rows().await.expect("journal").len(), 1);
    let result = db
        .query(&Query::from("users").select("name"))
        .await
        .expect("query");
    assert_eq!(result.rows.len(), 1);
}
