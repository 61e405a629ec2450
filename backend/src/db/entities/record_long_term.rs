use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One compacted sample per client per bucket (hourly by default).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "records_long_term")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub client: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub time: ChronoDateTimeUtc,
    pub cpu: f64,
    pub gpu: f64,
    pub ram: i64,
    pub ram_total: i64,
    pub swap: i64,
    pub swap_total: i64,
    pub load: f64,
    pub temp: f64,
    pub disk: i64,
    pub disk_total: i64,
    pub net_in: i64,
    pub net_out: i64,
    pub net_total_up: i64,
    pub net_total_down: i64,
    pub process: i64,
    pub connections: i64,
    pub connections_udp: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for super::record::Model {
    fn from(m: Model) -> Self {
        Self {
            client: m.client,
            time: m.time,
            cpu: m.cpu,
            gpu: m.gpu,
            ram: m.ram,
            ram_total: m.ram_total,
            swap: m.swap,
            swap_total: m.swap_total,
            load: m.load,
            temp: m.temp,
            disk: m.disk,
            disk_total: m.disk_total,
            net_in: m.net_in,
            net_out: m.net_out,
            net_total_up: m.net_total_up,
            net_total_down: m.net_total_down,
            process: m.process,
            connections: m.connections,
            connections_udp: m.connections_udp,
        }
    }
}
