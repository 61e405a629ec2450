use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Threshold-ratio rule evaluated over a sliding window of minute records.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "load_notifications")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    pub clients: Json,
    pub metric: String,
    /// Percent for ratio metrics, raw value otherwise.
    pub threshold: f64,
    /// Fraction of samples in (0, 1] that must breach.
    pub ratio: f64,
    /// Window length and cool-down, in minutes.
    pub interval: i32,
    pub last_notified: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
