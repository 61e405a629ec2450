use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::OnConflict, ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection,
    DbErr, EntityTrait, NotSet, QueryFilter, QueryOrder,
};
use serde::Deserialize;

use crate::db::entities::{client_list_json, ping_record, ping_task};

pub const PING_TYPES: [&str; 3] = ["icmp", "tcp", "http"];

#[derive(Debug, Clone, Deserialize)]
pub struct NewPingTask {
    pub name: String,
    #[serde(default)]
    pub clients: Vec<String>,
    pub ping_type: String,
    pub target: String,
    pub interval: i32,
}

impl NewPingTask {
    pub fn validate(&self) -> Result<(), String> {
        if !PING_TYPES.contains(&self.ping_type.as_str()) {
            return Err(format!("unsupported ping type: {}", self.ping_type));
        }
        if self.interval <= 0 {
            return Err("interval must be positive".to_owned());
        }
        if self.target.trim().is_empty() {
            return Err("target must not be empty".to_owned());
        }
        Ok(())
    }
}

pub async fn list_ping_tasks(db: &DatabaseConnection) -> Result<Vec<ping_task::Model>, DbErr> {
    ping_task::Entity::find()
        .order_by_asc(ping_task::Column::Id)
        .all(db)
        .await
}

pub async fn add_ping_task(
    db: &DatabaseConnection,
    task: NewPingTask,
) -> Result<ping_task::Model, DbErr> {
    ping_task::ActiveModel {
        id: NotSet,
        name: Set(task.name),
        clients: Set(client_list_json(&task.clients)),
        ping_type: Set(task.ping_type),
        target: Set(task.target),
        interval: Set(task.interval),
    }
    .insert(db)
    .await
}

/// Deletes a probe task with its records.
pub async fn delete_ping_task(db: &DatabaseConnection, id: i32) -> Result<bool, DbErr> {
    let res = ping_task::Entity::delete_by_id(id).exec(db).await?;
    ping_record::Entity::delete_many()
        .filter(ping_record::Column::TaskId.eq(id))
        .exec(db)
        .await?;
    Ok(res.rows_affected > 0)
}

/// Stores a probe result; a repeated `(client, task, time)` overwrites.
pub async fn insert_ping_record(
    db: &DatabaseConnection,
    client: &str,
    task_id: i32,
    time: DateTime<Utc>,
    value: i32,
) -> Result<(), DbErr> {
    ping_record::Entity::insert(ping_record::ActiveModel {
        client: Set(client.to_owned()),
        task_id: Set(task_id),
        time: Set(time),
        value: Set(value),
    })
    .on_conflict(
        OnConflict::columns([
            ping_record::Column::Client,
            ping_record::Column::TaskId,
            ping_record::Column::Time,
        ])
        .update_column(ping_record::Column::Value)
        .to_owned(),
    )
    .exec(db)
    .await?;
    Ok(())
}

pub async fn get_ping_records(
    db: &DatabaseConnection,
    client: &str,
    task_id: Option<i32>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<ping_record::Model>, DbErr> {
    let mut query = ping_record::Entity::find()
        .filter(ping_record::Column::Client.eq(client))
        .filter(ping_record::Column::Time.gte(start))
        .filter(ping_record::Column::Time.lte(end));
    if let Some(task_id) = task_id {
        query = query.filter(ping_record::Column::TaskId.eq(task_id));
    }
    query.order_by_asc(ping_record::Column::Time).all(db).await
}

pub async fn delete_ping_records_before(
    db: &DatabaseConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let res = ping_record::Entity::delete_many()
        .filter(ping_record::Column::Time.lt(cutoff))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use chrono::Duration;

    fn task(interval: i32) -> NewPingTask {
        NewPingTask {
            name: "gw".into(),
            clients: vec!["u1".into()],
            ping_type: "tcp".into(),
            target: "1.1.1.1:443".into(),
            interval,
        }
    }

    #[test]
    fn validate_rejects_unknown_type_and_bad_interval() {
        assert!(task(10).validate().is_ok());
        assert!(task(0).validate().is_err());
        let mut bad = task(10);
        bad.ping_type = "udp".into();
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn probe_results_upsert_and_filter_by_task() {
        let db = connect_in_memory().await.unwrap();
        let t = add_ping_task(&db, task(10)).await.unwrap();
        let now = Utc::now();

        insert_ping_record(&db, "u1", t.id, now, 12).await.unwrap();
        insert_ping_record(&db, "u1", t.id, now, -1).await.unwrap();
        insert_ping_record(&db, "u1", t.id + 1, now, 5).await.unwrap();

        let rows = get_ping_records(&db, "u1", Some(t.id), now - Duration::minutes(1), now)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, -1);

        let all = get_ping_records(&db, "u1", None, now - Duration::minutes(1), now)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        assert!(delete_ping_task(&db, t.id).await.unwrap());
        let left = get_ping_records(&db, "u1", None, now - Duration::minutes(1), now)
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
    }
}
