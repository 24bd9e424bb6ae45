use tidemark_engine::{Hlc, Query, Schema, SchemaBuilder, Where};
use tidemark_rs_sdk::{open_database, Database, OpenDatabaseConfig};

pub const NODE_1: &str = "00000000-0000-4000-8000-000000000001";
pub const NODE_2: &str = "00000000-0000-4000-8000-000000000002";

pub fn hlc(physical_ms: u64, counter: u32, node_id: &str) -> Hlc {
    Hlc::new(physical_ms, counter, node_id)
}

/// users(id guid, name text lww, age integer, status text) plus an
/// `active_users` view.
pub fn users_schema() -> Schema {
    SchemaBuilder::new()
        .version(1)
        .table("users", |t| {
            t.guid("id");
            t.text("name").lww();
            t.integer("age");
            t.text("status");
            t.key(&["id"]).unique();
        })
        .view(
            "active_users",
            Query::from("users")
                .select("system_id")
                .select("name")
                .filter(Where::eq("status", tidemark_engine::Value::text("active"))),
        )
        .build()
        .expect("users schema should build")
}

pub async fn open_users_database() -> Database {
    let mut config = OpenDatabaseConfig::new(users_schema());
    config.node_id = Some(NODE_1.to_string());
    open_database(config).await.expect("database should open")
}
