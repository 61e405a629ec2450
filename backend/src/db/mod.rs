pub mod entities;
pub mod services;
pub mod tasks;

use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, EntityTrait, Schema,
};
use tracing::info;

use entities::{
    client, load_notification, offline_notification, ping_record, ping_task, record,
    record_long_term, task, task_result,
};

/// Opens the relational store and makes sure every table exists.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(database_url.to_owned());
    opt.max_connections(10).sqlx_logging(false);
    let db = Database::connect(opt).await?;
    create_tables(&db).await?;
    Ok(db)
}

/// A private in-memory SQLite database. Only one pooled connection is kept
/// because every SQLite memory connection is its own database.
pub async fn connect_in_memory() -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new("sqlite::memory:".to_owned());
    opt.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(opt).await?;
    create_tables(&db).await?;
    Ok(db)
}

pub async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    let schema = Schema::new(db.get_database_backend());
    create_table(db, &schema, client::Entity).await?;
    create_table(db, &schema, record::Entity).await?;
    create_table(db, &schema, record_long_term::Entity).await?;
    create_table(db, &schema, ping_task::Entity).await?;
    create_table(db, &schema, ping_record::Entity).await?;
    create_table(db, &schema, load_notification::Entity).await?;
    create_table(db, &schema, offline_notification::Entity).await?;
    create_table(db, &schema, task::Entity).await?;
    create_table(db, &schema, task_result::Entity).await?;
    info!("Database schema is up to date.");
    Ok(())
}

async fn create_table<E: EntityTrait>(
    db: &DatabaseConnection,
    schema: &Schema,
    entity: E,
) -> Result<(), DbErr> {
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    db.execute(db.get_database_backend().build(&stmt)).await?;
    Ok(())
}
