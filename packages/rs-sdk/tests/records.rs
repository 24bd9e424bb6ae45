mod common;

use common::users_schema;
use tidemark_engine::{DbError, Query, Row, UpdateFailureKind, Value, Where};
use tidemark_rs_sdk::{open_database, OpenDatabaseConfig};

#[derive(Debug)]
struct User {
    record: tidemark_engine::Record,
}

impl User {
    fn name(&self) -> String {
        self.record
            .get_text("name")
            .expect("name is a text column")
            .unwrap_or_default()
            .to_string()
    }

    fn age(&self) -> Option<i64> {
        self.record.get_integer("age").expect("age is an integer")
    }
}

async fn open_with_user_factory() -> tidemark_rs_sdk::Database {
    let mut config = OpenDatabaseConfig::new(users_schema());
    config.factories.register(|record| User { record });
    open_database(config).await.expect("open")
}

#[tokio::test]
async fn typed_queries_require_a_registered_factory() {
    let db = open_database(OpenDatabaseConfig::new(users_schema()))
        .await
        .expect("open");
    let err = db
        .query_records::<User>(&Query::from("users"))
        .await
        .expect_err("no factory registered");
    assert!(matches!(err, DbError::Read { .. }));
}

#[tokio::test]
async fn typed_records_project_rows_through_the_factory() {
    let db = open_with_user_factory().await;
    db.insert(
        "users",
        Row::new()
            .with("name", Value::text("Ada"))
            .with("age", Value::Integer(36)),
    )
    .await
    .expect("insert");

    let users: Vec<User> = db
        .query_records(&Query::from("users"))
        .await
        .expect("typed query");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].name(), "Ada");
    assert_eq!(users[0].age(), Some(36));
}

#[tokio::test]
async fn record_save_reload_delete_round_trip() {
    let db = open_with_user_factory().await;
    let system_id = db
        .insert("users", Row::new().with("name", Value::text("Ada")))
        .await
        .expect("insert");

    let mut records = db
        .query_record_rows(&Query::from("users"))
        .await
        .expect("records");
    let record = &mut records[0];
    assert!(record.is_writable());
    assert_eq!(record.system_id(), Some(system_id.as_str()));

    record.set("name", Value::text("Grace")).expect("set");
    record.set("age", Value::Integer(40)).expect("set");
    assert_eq!(record.dirty_columns().len(), 2);
    record.save(&db).await.expect("save");
    assert!(!record.is_dirty());

    // Another writer changes the row; reload picks it up and drops staged
    // state.
    db.update_by_system_id("users", &system_id, Row::new().with("age", Value::Integer(41)))
        .await
        .expect("update");
    record.set("age", Value::Integer(99)).expect("stage");
    record.reload(&db).await.expect("reload");
    assert_eq!(record.get_integer("age").expect("age"), Some(41));
    assert!(!record.is_dirty());

    let record = records.remove(0);
    record.delete(&db).await.expect("delete");
    assert!(db
        .get_by_system_id("users", &system_id)
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn watch_records_re_emits_typed_snapshots() {
    let db = open_with_user_factory().await;
    db.insert(
        "users",
        Row::new()
            .with("name", Value::text("Ada"))
            .with("status", Value::text("active")),
    )
    .await
    .expect("insert");

    let mut watch = db
        .watch_records::<User>(Query::from("users").select("system_id").select("name"))
        .expect("watch");

    let initial = watch.next().await.expect("next").expect("snapshot");
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].name(), "Ada");

    let users: Vec<User> = db
        .query_records(&Query::from("users"))
        .await
        .expect("typed query");
    let system_id = users[0].record.system_id().expect("id").to_string();
    db.update_by_system_id("users", &system_id, Row::new().with("name", Value::text("Grace")))
        .await
        .expect("update");

    let next = watch.next().await.expect("next").expect("snapshot");
    assert_eq!(next[0].name(), "Grace");
}

#[tokio::test]
async fn expecting_win_reports_concurrency_conflict() {
    let db = open_with_user_factory().await;
    let system_id = db
        .insert("users", Row::new().with("name", Value::text("Ada")))
        .await
        .expect("insert");

    // A stamp far in the past loses to the insert's shadow clock.
    let stale = common::hlc(1, 0, common::NODE_2);
    let err = db
        .update_expecting_win(
            "users",
            Row::new().with("name", Value::text("stale")),
            Where::eq("system_id", Value::text(&system_id)),
            Some(stale),
        )
        .await
        .expect_err("stale writer expected to win");
    match err {
        DbError::Update { kind, .. } => assert_eq!(kind, UpdateFailureKind::ConcurrencyConflict),
        other => panic!("expected update failure, got {other:?}"),
    }

    // The row is untouched.
    let row = db
        .get_by_system_id("users", &system_id)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(row.get("name"), Some(&Value::text("Ada")));
}
