use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rand::{distr::Alphanumeric, Rng};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::entities::{
    client, client_list, client_list_json, load_notification, offline_notification, ping_record,
    ping_task, record, record_long_term, task_result,
};

const TOKEN_LENGTH: usize = 32;

/// Static host attributes reported by an agent after it connects.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BasicInfo {
    pub cpu_name: String,
    pub cpu_cores: i32,
    pub mem_total: i64,
    pub swap_total: i64,
    pub disk_total: i64,
    pub os: String,
    pub kernel_version: String,
    pub virtualization: String,
    pub arch: String,
    pub gpu_name: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub version: String,
}

/// Admin-editable attributes. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientUpdate {
    pub name: Option<String>,
    pub weight: Option<i32>,
    pub hidden: Option<bool>,
    pub expired_at: Option<DateTime<Utc>>,
    pub billing_cycle: Option<i32>,
    pub auto_renewal: Option<bool>,
    pub traffic_limit: Option<i64>,
    pub traffic_limit_type: Option<String>,
}

pub fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

// --- Lookups ---

pub async fn get_client_by_token(
    db: &DatabaseConnection,
    token: &str,
) -> Result<Option<client::Model>, DbErr> {
    if token.is_empty() {
        return Ok(None);
    }
    client::Entity::find()
        .filter(client::Column::Token.eq(token))
        .one(db)
        .await
}

pub async fn get_client_by_uuid(
    db: &DatabaseConnection,
    uuid: &str,
) -> Result<Option<client::Model>, DbErr> {
    client::Entity::find_by_id(uuid.to_owned()).one(db).await
}

/// All clients ordered by weight then name.
pub async fn list_clients(db: &DatabaseConnection) -> Result<Vec<client::Model>, DbErr> {
    client::Entity::find()
        .order_by_asc(client::Column::Weight)
        .order_by_asc(client::Column::Name)
        .all(db)
        .await
}

pub async fn hidden_client_ids(db: &DatabaseConnection) -> Result<HashSet<String>, DbErr> {
    let ids: Vec<String> = client::Entity::find()
        .select_only()
        .column(client::Column::Uuid)
        .filter(client::Column::Hidden.eq(true))
        .into_tuple()
        .all(db)
        .await?;
    Ok(ids.into_iter().collect())
}

// --- Mutations ---

/// Creates a client with a fresh uuid and token.
pub async fn create_client(db: &DatabaseConnection, name: &str) -> Result<client::Model, DbErr> {
    let now = Utc::now();
    let uuid = Uuid::new_v4().to_string();
    let name = if name.trim().is_empty() {
        format!("client_{}", &uuid[..8])
    } else {
        name.trim().to_owned()
    };
    let model = client::ActiveModel {
        uuid: Set(uuid),
        token: Set(generate_token()),
        name: Set(name),
        cpu_name: Set(String::new()),
        cpu_cores: Set(0),
        mem_total: Set(0),
        swap_total: Set(0),
        disk_total: Set(0),
        os: Set(String::new()),
        kernel_version: Set(String::new()),
        virtualization: Set(String::new()),
        arch: Set(String::new()),
        gpu_name: Set(String::new()),
        ipv4: Set(None),
        ipv6: Set(None),
        region: Set(String::new()),
        version: Set(String::new()),
        weight: Set(0),
        hidden: Set(false),
        expired_at: Set(None),
        billing_cycle: Set(0),
        auto_renewal: Set(false),
        traffic_limit: Set(0),
        traffic_limit_type: Set("sum".to_owned()),
        created_at: Set(now),
        updated_at: Set(now),
    };
    let created = model.insert(db).await?;
    info!(client = %created.uuid, name = %created.name, "Client created.");
    Ok(created)
}

pub async fn update_basic_info(
    db: &DatabaseConnection,
    uuid: &str,
    info: BasicInfo,
) -> Result<client::Model, DbErr> {
    let existing = client::Entity::find_by_id(uuid.to_owned())
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("client {uuid}")))?;

    let mut active = existing.into_active_model();
    active.cpu_name = Set(info.cpu_name);
    active.cpu_cores = Set(info.cpu_cores);
    active.mem_total = Set(info.mem_total);
    active.swap_total = Set(info.swap_total);
    active.disk_total = Set(info.disk_total);
    active.os = Set(info.os);
    active.kernel_version = Set(info.kernel_version);
    active.virtualization = Set(info.virtualization);
    active.arch = Set(info.arch);
    active.gpu_name = Set(info.gpu_name);
    // Agents without a public address of one family keep the stored value.
    if info.ipv4.as_deref().is_some_and(|ip| !ip.is_empty()) {
        active.ipv4 = Set(info.ipv4);
    }
    if info.ipv6.as_deref().is_some_and(|ip| !ip.is_empty()) {
        active.ipv6 = Set(info.ipv6);
    }
    active.version = Set(info.version);
    active.updated_at = Set(Utc::now());
    active.update(db).await
}

pub async fn update_client(
    db: &DatabaseConnection,
    uuid: &str,
    update: ClientUpdate,
) -> Result<client::Model, DbErr> {
    let existing = client::Entity::find_by_id(uuid.to_owned())
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("client {uuid}")))?;

    let mut active = existing.into_active_model();
    if let Some(name) = update.name {
        active.name = Set(name);
    }
    if let Some(weight) = update.weight {
        active.weight = Set(weight);
    }
    if let Some(hidden) = update.hidden {
        active.hidden = Set(hidden);
    }
    if let Some(expired_at) = update.expired_at {
        active.expired_at = Set(Some(expired_at));
    }
    if let Some(cycle) = update.billing_cycle {
        active.billing_cycle = Set(cycle);
    }
    if let Some(auto_renewal) = update.auto_renewal {
        active.auto_renewal = Set(auto_renewal);
    }
    if let Some(limit) = update.traffic_limit {
        active.traffic_limit = Set(limit);
    }
    if let Some(kind) = update.traffic_limit_type {
        active.traffic_limit_type = Set(kind);
    }
    active.updated_at = Set(Utc::now());
    active.update(db).await
}

/// Stores the addresses and region resolved for a client.
pub async fn update_geo(
    db: &DatabaseConnection,
    uuid: &str,
    ipv4: Option<String>,
    ipv6: Option<String>,
    region: Option<String>,
) -> Result<(), DbErr> {
    let Some(existing) = client::Entity::find_by_id(uuid.to_owned()).one(db).await? else {
        return Ok(());
    };
    let mut active = existing.into_active_model();
    if ipv4.is_some() {
        active.ipv4 = Set(ipv4);
    }
    if ipv6.is_some() {
        active.ipv6 = Set(ipv6);
    }
    if let Some(region) = region {
        active.region = Set(region);
    }
    active.updated_at = Set(Utc::now());
    active.update(db).await?;
    Ok(())
}

/// Removes a client and everything keyed by it in one transaction. Probe
/// tasks and load rules keep existing with the client stripped from their
/// lists. Returns false when the client did not exist.
pub async fn delete_client(db: &DatabaseConnection, uuid: &str) -> Result<bool, DbErr> {
    let txn = db.begin().await?;

    let deleted = client::Entity::delete_by_id(uuid.to_owned())
        .exec(&txn)
        .await?;
    if deleted.rows_affected == 0 {
        txn.rollback().await?;
        return Ok(false);
    }

    record::Entity::delete_many()
        .filter(record::Column::Client.eq(uuid))
        .exec(&txn)
        .await?;
    record_long_term::Entity::delete_many()
        .filter(record_long_term::Column::Client.eq(uuid))
        .exec(&txn)
        .await?;
    ping_record::Entity::delete_many()
        .filter(ping_record::Column::Client.eq(uuid))
        .exec(&txn)
        .await?;
    task_result::Entity::delete_many()
        .filter(task_result::Column::Client.eq(uuid))
        .exec(&txn)
        .await?;
    offline_notification::Entity::delete_by_id(uuid.to_owned())
        .exec(&txn)
        .await?;

    for task in ping_task::Entity::find().all(&txn).await? {
        let clients = client_list(&task.clients);
        if clients.iter().any(|c| c == uuid) {
            let remaining: Vec<String> = clients.into_iter().filter(|c| c != uuid).collect();
            let mut active = task.into_active_model();
            active.clients = Set(client_list_json(&remaining));
            active.update(&txn).await?;
        }
    }
    for rule in load_notification::Entity::find().all(&txn).await? {
        let clients = client_list(&rule.clients);
        if clients.iter().any(|c| c == uuid) {
            let remaining: Vec<String> = clients.into_iter().filter(|c| c != uuid).collect();
            let mut active = rule.into_active_model();
            active.clients = Set(client_list_json(&remaining));
            active.update(&txn).await?;
        }
    }

    txn.commit().await?;
    info!(client = %uuid, "Client deleted with its records and rules.");
    Ok(true)
}
