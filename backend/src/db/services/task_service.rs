use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, TransactionTrait,
};

use crate::db::entities::{client_list_json, task, task_result};

/// Persists an exec task and one empty result row per targeted client in a
/// single transaction.
pub async fn create_task(
    db: &DatabaseConnection,
    task_id: &str,
    command: &str,
    clients: &[String],
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    let txn = db.begin().await?;
    task::ActiveModel {
        task_id: Set(task_id.to_owned()),
        clients: Set(client_list_json(clients)),
        command: Set(command.to_owned()),
        created_at: Set(now),
    }
    .insert(&txn)
    .await?;

    for client in clients {
        task_result::ActiveModel {
            task_id: Set(task_id.to_owned()),
            client: Set(client.clone()),
            result: Set(String::new()),
            exit_code: Set(None),
            finished_at: Set(None),
            created_at: Set(now),
        }
        .insert(&txn)
        .await?;
    }
    txn.commit().await
}

/// Fills in the result row an agent reports back. Returns false when no row
/// matched, which happens for tasks purged by retention or never dispatched
/// to this client.
pub async fn save_task_result(
    db: &DatabaseConnection,
    task_id: &str,
    client: &str,
    result: String,
    exit_code: i32,
    finished_at: DateTime<Utc>,
) -> Result<bool, DbErr> {
    let Some(row) = task_result::Entity::find_by_id((task_id.to_owned(), client.to_owned()))
        .one(db)
        .await?
    else {
        return Ok(false);
    };
    let mut active: task_result::ActiveModel = row.into();
    active.result = Set(result);
    active.exit_code = Set(Some(exit_code));
    active.finished_at = Set(Some(finished_at));
    active.update(db).await?;
    Ok(true)
}

pub async fn get_task(db: &DatabaseConnection, task_id: &str) -> Result<Option<task::Model>, DbErr> {
    task::Entity::find_by_id(task_id.to_owned()).one(db).await
}

pub async fn get_task_results(
    db: &DatabaseConnection,
    task_id: &str,
) -> Result<Vec<task_result::Model>, DbErr> {
    task_result::Entity::find()
        .filter(task_result::Column::TaskId.eq(task_id))
        .order_by_asc(task_result::Column::Client)
        .all(db)
        .await
}

/// Purges tasks created before `cutoff` along with their results.
pub async fn delete_tasks_before(
    db: &DatabaseConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let results = task_result::Entity::delete_many()
        .filter(task_result::Column::CreatedAt.lt(cutoff))
        .exec(db)
        .await?;
    task::Entity::delete_many()
        .filter(task::Column::CreatedAt.lt(cutoff))
        .exec(db)
        .await?;
    Ok(results.rows_affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use chrono::Duration;

    #[tokio::test]
    async fn results_start_empty_and_update_in_place() {
        let db = connect_in_memory().await.unwrap();
        let clients = vec!["u1".to_string(), "u2".to_string()];
        let now = Utc::now();
        create_task(&db, "abcdefghijklmnop", "uptime", &clients, now).await.unwrap();

        let rows = get_task_results(&db, "abcdefghijklmnop").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.exit_code.is_none() && r.result.is_empty()));

        assert!(save_task_result(&db, "abcdefghijklmnop", "u1", "up 3 days".into(), 0, now)
            .await
            .unwrap());
        assert!(!save_task_result(&db, "abcdefghijklmnop", "u9", "x".into(), 0, now)
            .await
            .unwrap());

        let rows = get_task_results(&db, "abcdefghijklmnop").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].exit_code, Some(0));
        assert_eq!(rows[0].result, "up 3 days");
        assert_eq!(rows[1].exit_code, None);
    }

    #[tokio::test]
    async fn retention_removes_old_tasks() {
        let db = connect_in_memory().await.unwrap();
        let now = Utc::now();
        let clients = vec!["u1".to_string()];
        create_task(&db, "old", "ls", &clients, now - Duration::days(10)).await.unwrap();
        create_task(&db, "new", "ls", &clients, now).await.unwrap();

        assert_eq!(delete_tasks_before(&db, now - Duration::days(1)).await.unwrap(), 1);
        assert!(get_task(&db, "old").await.unwrap().is_none());
        assert!(get_task(&db, "new").await.unwrap().is_some());
    }
}
