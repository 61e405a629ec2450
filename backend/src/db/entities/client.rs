use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A monitored host. The token is immutable once issued.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "clients")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub uuid: String,
    #[sea_orm(unique)]
    #[serde(skip_serializing, default)]
    pub token: String,
    pub name: String,
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
    pub region: String,
    pub version: String,
    pub weight: i32,
    pub hidden: bool,
    pub expired_at: Option<ChronoDateTimeUtc>,
    /// Billing cycle in days; 0 disables auto-renewal arithmetic.
    pub billing_cycle: i32,
    pub auto_renewal: bool,
    /// Bytes; 0 means unlimited.
    pub traffic_limit: i64,
    /// One of `sum`, `max`, `min`, `up`, `down`.
    pub traffic_limit_type: String,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
