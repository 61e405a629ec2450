use chrono::{DateTime, Utc};
use sea_orm::{
    prelude::Expr, sea_query::OnConflict, ActiveModelTrait, ActiveValue::Set, ColumnTrait,
    DatabaseConnection, DbErr, EntityTrait, NotSet, QueryFilter, QueryOrder,
};
use serde::Deserialize;

use crate::db::entities::{client_list_json, load_notification, offline_notification};

/// Metrics a load rule may watch. The first three are evaluated as a
/// percentage of the client's static totals.
pub const LOAD_METRICS: [&str; 10] = [
    "ram", "swap", "disk", "cpu", "gpu", "load", "temp", "process", "connections", "connections_udp",
];

pub const DEFAULT_GRACE_PERIOD_SECS: i32 = 300;

// --- Load rules ---

#[derive(Debug, Clone, Deserialize)]
pub struct NewLoadRule {
    pub name: String,
    #[serde(default)]
    pub clients: Vec<String>,
    pub metric: String,
    pub threshold: f64,
    pub ratio: f64,
    pub interval: i32,
}

impl NewLoadRule {
    pub fn validate(&self) -> Result<(), String> {
        if !LOAD_METRICS.contains(&self.metric.as_str()) {
            return Err(format!("unsupported metric: {}", self.metric));
        }
        if !(self.ratio > 0.0 && self.ratio <= 1.0) {
            return Err("ratio must be in (0, 1]".to_owned());
        }
        if self.interval <= 0 {
            return Err("interval must be positive".to_owned());
        }
        Ok(())
    }
}

pub async fn list_load_rules(
    db: &DatabaseConnection,
) -> Result<Vec<load_notification::Model>, DbErr> {
    load_notification::Entity::find()
        .order_by_asc(load_notification::Column::Id)
        .all(db)
        .await
}

pub async fn add_load_rule(
    db: &DatabaseConnection,
    rule: NewLoadRule,
) -> Result<load_notification::Model, DbErr> {
    load_notification::ActiveModel {
        id: NotSet,
        name: Set(rule.name),
        clients: Set(client_list_json(&rule.clients)),
        metric: Set(rule.metric),
        threshold: Set(rule.threshold),
        ratio: Set(rule.ratio),
        interval: Set(rule.interval),
        last_notified: Set(None),
    }
    .insert(db)
    .await
}

pub async fn delete_load_rule(db: &DatabaseConnection, id: i32) -> Result<bool, DbErr> {
    let res = load_notification::Entity::delete_by_id(id).exec(db).await?;
    Ok(res.rows_affected > 0)
}

pub async fn get_load_rule(
    db: &DatabaseConnection,
    id: i32,
) -> Result<Option<load_notification::Model>, DbErr> {
    load_notification::Entity::find_by_id(id).one(db).await
}

pub async fn mark_load_rule_notified(
    db: &DatabaseConnection,
    id: i32,
    at: DateTime<Utc>,
) -> Result<(), DbErr> {
    load_notification::Entity::update_many()
        .col_expr(load_notification::Column::LastNotified, Expr::value(at))
        .filter(load_notification::Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(())
}

// --- Offline rules ---

pub async fn list_offline_rules(
    db: &DatabaseConnection,
) -> Result<Vec<offline_notification::Model>, DbErr> {
    offline_notification::Entity::find().all(db).await
}

/// Inserts or replaces the offline rule for a client. A non-positive grace
/// period falls back to the default.
pub async fn set_offline_rule(
    db: &DatabaseConnection,
    client: &str,
    enable: bool,
    grace_period: i32,
) -> Result<offline_notification::Model, DbErr> {
    let grace_period = if grace_period > 0 {
        grace_period
    } else {
        DEFAULT_GRACE_PERIOD_SECS
    };
    offline_notification::Entity::insert(offline_notification::ActiveModel {
        client: Set(client.to_owned()),
        enable: Set(enable),
        grace_period: Set(grace_period),
        last_notified: Set(None),
    })
    .on_conflict(
        OnConflict::column(offline_notification::Column::Client)
            .update_columns([
                offline_notification::Column::Enable,
                offline_notification::Column::GracePeriod,
            ])
            .to_owned(),
    )
    .exec(db)
    .await?;

    offline_notification::Entity::find_by_id(client.to_owned())
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("offline rule {client}")))
}

pub async fn mark_offline_notified(
    db: &DatabaseConnection,
    client: &str,
    at: DateTime<Utc>,
) -> Result<(), DbErr> {
    let Some(rule) = offline_notification::Entity::find_by_id(client.to_owned())
        .one(db)
        .await?
    else {
        return Ok(());
    };
    let mut active: offline_notification::ActiveModel = rule.into();
    active.last_notified = Set(Some(at));
    active.update(db).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::db::entities::client_list;

    #[test]
    fn load_rule_validation() {
        let mut rule = NewLoadRule {
            name: "cpu".into(),
            clients: vec![],
            metric: "cpu".into(),
            threshold: 80.0,
            ratio: 0.8,
            interval: 5,
        };
        assert!(rule.validate().is_ok());
        rule.ratio = 0.0;
        assert!(rule.validate().is_err());
        rule.ratio = 1.0;
        rule.metric = "bogus".into();
        assert!(rule.validate().is_err());
    }

    #[tokio::test]
    async fn load_rule_roundtrip_and_cooldown_stamp() {
        let db = connect_in_memory().await.unwrap();
        let rule = add_load_rule(
            &db,
            NewLoadRule {
                name: "ram".into(),
                clients: vec!["u1".into()],
                metric: "ram".into(),
                threshold: 90.0,
                ratio: 0.5,
                interval: 10,
            },
        )
        .await
        .unwrap();
        assert_eq!(client_list(&rule.clients), vec!["u1".to_string()]);
        assert!(rule.last_notified.is_none());

        let at = Utc::now();
        mark_load_rule_notified(&db, rule.id, at).await.unwrap();
        let stored = get_load_rule(&db, rule.id).await.unwrap().unwrap();
        assert!(stored.last_notified.is_some());

        assert!(delete_load_rule(&db, rule.id).await.unwrap());
        assert!(list_load_rules(&db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_rule_upsert_defaults_grace_period() {
        let db = connect_in_memory().await.unwrap();
        let rule = set_offline_rule(&db, "u1", true, 0).await.unwrap();
        assert_eq!(rule.grace_period, DEFAULT_GRACE_PERIOD_SECS);

        let rule = set_offline_rule(&db, "u1", false, 60).await.unwrap();
        assert!(!rule.enable);
        assert_eq!(rule.grace_period, 60);
        assert_eq!(list_offline_rules(&db).await.unwrap().len(), 1);
    }
}
