use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    sea_query::OnConflict, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use tracing::{debug, info};

use crate::db::entities::{record, record_long_term};

/// Recent rows are thinned to one per slot of this width on blended reads.
pub const RECENT_SLOT_MINUTES: i64 = 15;

/// Windows that split the record store into its two tiers.
#[derive(Debug, Clone, Copy)]
pub struct TierWindows {
    /// Rows younger than this stay in `records`.
    pub short_term: Duration,
    /// Width of a compacted bucket in `records_long_term`.
    pub bucket: Duration,
}

impl Default for TierWindows {
    fn default() -> Self {
        Self {
            short_term: Duration::hours(4),
            bucket: Duration::hours(1),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionSummary {
    pub clients: usize,
    pub consumed_rows: u64,
    pub produced_rows: usize,
}

/// Floors `time` to a multiple of `width` since the unix epoch.
pub fn truncate_time(time: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let secs = width.num_seconds();
    if secs <= 0 {
        return time;
    }
    let ts = time.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(secs), 0).unwrap_or(time)
}

/// Mean of the samples between the 2nd and 98th percentile indices:
/// `lo = floor(0.02 N)`, `hi = floor(0.98 N)`, mean of `sorted[lo..hi)`,
/// and 0 when the interval is empty.
pub fn trimmed_mean(values: &[f64]) -> f64 {
    let n = values.len();
    let lo = n * 2 / 100;
    let hi = n * 98 / 100;
    if lo >= hi {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let kept = &sorted[lo..hi];
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Integer arithmetic mean, truncating toward zero.
pub fn integer_mean(values: &[i64]) -> i64 {
    if values.is_empty() {
        return 0;
    }
    let sum: i128 = values.iter().map(|v| i128::from(*v)).sum();
    (sum / values.len() as i128) as i64
}

/// Folds one bucket of minute records into a single long-term row stamped
/// with the bucket start.
pub fn compact_bucket(
    client: &str,
    bucket_start: DateTime<Utc>,
    rows: &[record::Model],
) -> record_long_term::Model {
    let floats = |f: fn(&record::Model) -> f64| -> f64 {
        let values: Vec<f64> = rows.iter().map(f).collect();
        trimmed_mean(&values)
    };
    let ints = |f: fn(&record::Model) -> i64| -> i64 {
        let values: Vec<i64> = rows.iter().map(f).collect();
        integer_mean(&values)
    };

    record_long_term::Model {
        client: client.to_owned(),
        time: bucket_start,
        cpu: floats(|r| r.cpu),
        gpu: floats(|r| r.gpu),
        load: floats(|r| r.load),
        temp: floats(|r| r.temp),
        ram: ints(|r| r.ram),
        ram_total: ints(|r| r.ram_total),
        swap: ints(|r| r.swap),
        swap_total: ints(|r| r.swap_total),
        disk: ints(|r| r.disk),
        disk_total: ints(|r| r.disk_total),
        net_in: ints(|r| r.net_in),
        net_out: ints(|r| r.net_out),
        net_total_up: ints(|r| r.net_total_up),
        net_total_down: ints(|r| r.net_total_down),
        process: ints(|r| r.process),
        connections: ints(|r| r.connections),
        connections_udp: ints(|r| r.connections_udp),
    }
}

/// Keeps the latest row of every `slot`-wide window; input must be sorted
/// ascending by time.
pub fn latest_per_slot(rows: Vec<record::Model>, slot: Duration) -> Vec<record::Model> {
    let mut slots: BTreeMap<DateTime<Utc>, record::Model> = BTreeMap::new();
    for row in rows {
        let key = truncate_time(row.time, slot);
        match slots.get(&key) {
            Some(existing) if existing.time > row.time => {}
            _ => {
                slots.insert(key, row);
            }
        }
    }
    slots.into_values().collect()
}

fn record_active_model(r: record::Model) -> record::ActiveModel {
    record::ActiveModel {
        client: Set(r.client),
        time: Set(r.time),
        cpu: Set(r.cpu),
        gpu: Set(r.gpu),
        ram: Set(r.ram),
        ram_total: Set(r.ram_total),
        swap: Set(r.swap),
        swap_total: Set(r.swap_total),
        load: Set(r.load),
        temp: Set(r.temp),
        disk: Set(r.disk),
        disk_total: Set(r.disk_total),
        net_in: Set(r.net_in),
        net_out: Set(r.net_out),
        net_total_up: Set(r.net_total_up),
        net_total_down: Set(r.net_total_down),
        process: Set(r.process),
        connections: Set(r.connections),
        connections_udp: Set(r.connections_udp),
    }
}

fn long_term_active_model(r: record_long_term::Model) -> record_long_term::ActiveModel {
    record_long_term::ActiveModel {
        client: Set(r.client),
        time: Set(r.time),
        cpu: Set(r.cpu),
        gpu: Set(r.gpu),
        ram: Set(r.ram),
        ram_total: Set(r.ram_total),
        swap: Set(r.swap),
        swap_total: Set(r.swap_total),
        load: Set(r.load),
        temp: Set(r.temp),
        disk: Set(r.disk),
        disk_total: Set(r.disk_total),
        net_in: Set(r.net_in),
        net_out: Set(r.net_out),
        net_total_up: Set(r.net_total_up),
        net_total_down: Set(r.net_total_down),
        process: Set(r.process),
        connections: Set(r.connections),
        connections_udp: Set(r.connections_udp),
    }
}

/// Inserts a minute record. A second write for the same `(client, time)`
/// replaces the first.
pub async fn insert_record<C: ConnectionTrait>(db: &C, r: record::Model) -> Result<(), DbErr> {
    use record::Column as C_;
    record::Entity::insert(record_active_model(r))
        .on_conflict(
            OnConflict::columns([C_::Client, C_::Time])
                .update_columns([
                    C_::Cpu,
                    C_::Gpu,
                    C_::Ram,
                    C_::RamTotal,
                    C_::Swap,
                    C_::SwapTotal,
                    C_::Load,
                    C_::Temp,
                    C_::Disk,
                    C_::DiskTotal,
                    C_::NetIn,
                    C_::NetOut,
                    C_::NetTotalUp,
                    C_::NetTotalDown,
                    C_::Process,
                    C_::Connections,
                    C_::ConnectionsUdp,
                ])
                .to_owned(),
        )
        .exec(db)
        .await?;
    Ok(())
}

async fn upsert_long_term<C: ConnectionTrait>(
    db: &C,
    r: record_long_term::Model,
) -> Result<(), DbErr> {
    use record_long_term::Column as C_;
    record_long_term::Entity::insert(long_term_active_model(r))
        .on_conflict(
            OnConflict::columns([C_::Client, C_::Time])
                .update_columns([
                    C_::Cpu,
                    C_::Gpu,
                    C_::Ram,
                    C_::RamTotal,
                    C_::Swap,
                    C_::SwapTotal,
                    C_::Load,
                    C_::Temp,
                    C_::Disk,
                    C_::DiskTotal,
                    C_::NetIn,
                    C_::NetOut,
                    C_::NetTotalUp,
                    C_::NetTotalDown,
                    C_::Process,
                    C_::Connections,
                    C_::ConnectionsUdp,
                ])
                .to_owned(),
        )
        .exec(db)
        .await?;
    Ok(())
}

/// Short-term rows of one client inside `[start, end]`, oldest first.
pub async fn get_recent_records<C: ConnectionTrait>(
    db: &C,
    client: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<record::Model>, DbErr> {
    record::Entity::find()
        .filter(record::Column::Client.eq(client))
        .filter(record::Column::Time.gte(start))
        .filter(record::Column::Time.lte(end))
        .order_by_asc(record::Column::Time)
        .all(db)
        .await
}

/// Moves every short-term row older than the short window into hourly
/// long-term buckets. The cutoff is floored to a bucket boundary so a bucket
/// is only ever compacted once, when it is complete.
pub async fn compact_records(
    db: &DatabaseConnection,
    now: DateTime<Utc>,
    windows: TierWindows,
) -> Result<CompactionSummary, DbErr> {
    let cutoff = truncate_time(now - windows.short_term, windows.bucket);
    let clients: Vec<String> = record::Entity::find()
        .select_only()
        .column(record::Column::Client)
        .distinct()
        .filter(record::Column::Time.lt(cutoff))
        .into_tuple()
        .all(db)
        .await?;

    let mut summary = CompactionSummary::default();
    for client in clients {
        let txn = db.begin().await?;
        let rows = record::Entity::find()
            .filter(record::Column::Client.eq(client.as_str()))
            .filter(record::Column::Time.lt(cutoff))
            .order_by_asc(record::Column::Time)
            .all(&txn)
            .await?;

        let mut buckets: BTreeMap<DateTime<Utc>, Vec<record::Model>> = BTreeMap::new();
        for row in rows {
            buckets
                .entry(truncate_time(row.time, windows.bucket))
                .or_default()
                .push(row);
        }

        let produced = buckets.len();
        for (start, rows) in buckets {
            upsert_long_term(&txn, compact_bucket(&client, start, &rows)).await?;
        }

        let deleted = record::Entity::delete_many()
            .filter(record::Column::Client.eq(client.as_str()))
            .filter(record::Column::Time.lt(cutoff))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        debug!(client = %client, buckets = produced, rows = deleted.rows_affected, "Compacted records.");
        summary.clients += 1;
        summary.produced_rows += produced;
        summary.consumed_rows += deleted.rows_affected;
    }

    if summary.clients > 0 {
        info!(
            clients = summary.clients,
            consumed = summary.consumed_rows,
            produced = summary.produced_rows,
            "Record compaction finished."
        );
    }
    Ok(summary)
}

/// Blended history read: compacted rows for the part of `[start, end]` older
/// than the short window, recent rows (latest per 15-minute slot) for the
/// rest. When no compacted rows exist the raw recent rows are returned as-is.
pub async fn get_records_by_client_and_time(
    db: &DatabaseConnection,
    client: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
    short_term: Duration,
) -> Result<Vec<record::Model>, DbErr> {
    let recent_cutoff = now - short_term;

    let recent = if end > recent_cutoff {
        get_recent_records(db, client, start.max(recent_cutoff), end).await?
    } else {
        Vec::new()
    };

    let long_term = if start < recent_cutoff {
        record_long_term::Entity::find()
            .filter(record_long_term::Column::Client.eq(client))
            .filter(record_long_term::Column::Time.gte(start))
            .filter(record_long_term::Column::Time.lte(recent_cutoff))
            .order_by_asc(record_long_term::Column::Time)
            .all(db)
            .await?
    } else {
        Vec::new()
    };

    if long_term.is_empty() {
        return Ok(recent);
    }

    let mut merged: Vec<record::Model> = long_term.into_iter().map(Into::into).collect();
    merged.extend(latest_per_slot(
        recent,
        Duration::minutes(RECENT_SLOT_MINUTES),
    ));
    merged.sort_by_key(|r| r.time);
    Ok(merged)
}

/// Drops rows older than `cutoff` from both tiers.
pub async fn delete_records_before(
    db: &DatabaseConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let short = record::Entity::delete_many()
        .filter(record::Column::Time.lt(cutoff))
        .exec(db)
        .await?;
    let long = record_long_term::Entity::delete_many()
        .filter(record_long_term::Column::Time.lt(cutoff))
        .exec(db)
        .await?;
    Ok(short.rows_affected + long.rows_affected)
}

#[cfg(test)]
pub(crate) fn sample_record(client: &str, time: DateTime<Utc>, cpu: f64, ram: i64) -> record::Model {
    record::Model {
        client: client.to_owned(),
        time,
        cpu,
        gpu: 0.0,
        ram,
        ram_total: 1000,
        swap: 0,
        swap_total: 0,
        load: cpu / 100.0,
        temp: 40.0,
        disk: 10,
        disk_total: 100,
        net_in: 5,
        net_out: 7,
        net_total_up: 100,
        net_total_down: 200,
        process: 50,
        connections: 10,
        connections_udp: 2,
    }
}
