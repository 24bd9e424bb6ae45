mod common;

use std::sync::Arc;

use common::open_users_database;
use futures_util::FutureExt;
use tidemark_engine::{Query, Row, Value, Where};

fn active_names_query() -> Query {
    Query::from("users")
        .select("name")
        .filter(Where::eq("status", Value::text("active")))
}

async fn seed_active_user(db: &tidemark_rs_sdk::Database, name: &str) -> String {
    db.insert(
        "users",
        Row::new()
            .with("name", Value::text(name))
            .with("status", Value::text("active")),
    )
    .await
    .expect("insert")
}

#[tokio::test]
async fn multiple_commits_coalesce_into_one_reexecution() {
    let db = open_users_database().await;
    let system_id = seed_active_user(&db, "v0").await;

    let mut watch = db.watch(active_names_query()).expect("watch");
    watch.next().await.expect("initial");

    // Two commits land before the watch is polled again.
    db.update_by_system_id("users", &system_id, Row::new().with("name", Value::text("v1")))
        .await
        .expect("update");
    db.update_by_system_id("users", &system_id, Row::new().with("name", Value::text("v2")))
        .await
        .expect("update");

    let event = watch.next().await.expect("next").expect("snapshot");
    assert_eq!(event.rows.rows[0].get("name"), Some(&Value::text("v2")));
    assert!(
        watch.next().now_or_never().is_none(),
        "queued batches coalesce into one re-execution"
    );
}

#[tokio::test]
async fn identical_snapshots_are_suppressed() {
    let db = open_users_database().await;
    let system_id = seed_active_user(&db, "Ada").await;

    let mut watch = db.watch(active_names_query()).expect("watch");
    watch.next().await.expect("initial");

    // The commit touches a referenced column but leaves the result
    // unchanged, so nothing is emitted.
    db.update_by_system_id(
        "users",
        &system_id,
        Row::new().with("status", Value::text("active")),
    )
    .await
    .expect("same-value update");
    assert!(watch.next().now_or_never().is_none());
}

#[tokio::test]
async fn deletes_reexecute_watches_on_the_table() {
    let db = open_users_database().await;
    let keep = seed_active_user(&db, "keep").await;
    let drop_id = seed_active_user(&db, "drop").await;

    let mut watch = db.watch(active_names_query()).expect("watch");
    let initial = watch.next().await.expect("initial").expect("snapshot");
    assert_eq!(initial.rows.rows.len(), 2);

    db.delete_by_system_id("users", &drop_id).await.expect("delete");

    let event = watch.next().await.expect("next").expect("snapshot");
    assert_eq!(event.rows.rows.len(), 1);
    assert_eq!(event.rows.rows[0].get("name"), Some(&Value::text("keep")));
    drop(watch);

    // Watches do not outlive close: a fresh one still sees current state.
    let mut fresh = db.watch(active_names_query()).expect("watch");
    let snapshot = fresh.next().await.expect("initial").expect("snapshot");
    assert_eq!(snapshot.rows.rows.len(), 1);
    let _ = keep;
}

#[tokio::test]
async fn closed_watches_stop_emitting() {
    let db = open_users_database().await;
    let system_id = seed_active_user(&db, "Ada").await;

    let mut watch = db.watch(active_names_query()).expect("watch");
    watch.next().await.expect("initial");
    watch.close();

    db.update_by_system_id("users", &system_id, Row::new().with("name", Value::text("Grace")))
        .await
        .expect("update");
    assert_eq!(watch.next().await.expect("closed"), None);
}

#[tokio::test]
async fn owned_watches_share_the_database_by_arc() {
    let db = Arc::new(open_users_database().await);
    seed_active_user(&db, "Ada").await;

    let mut watch = db.watch_owned(active_names_query()).expect("watch");
    let initial = watch.next().await.expect("initial").expect("snapshot");
    assert_eq!(initial.rows.rows.len(), 1);
    watch.close();
}
