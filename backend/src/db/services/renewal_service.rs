use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    IntoActiveModel, QueryFilter,
};
use tracing::{info, warn};

use crate::db::entities::client;

/// True when the expiry lies so far ahead that the client is billed once for
/// its lifetime.
pub fn is_lifetime(expired_at: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    expired_at - now > threshold
}

/// Advances `expired_at` by whole billing cycles until it lies after `now`.
/// Returns `None` when no renewal is due or the cycle is not positive.
pub fn next_expiry(
    expired_at: DateTime<Utc>,
    cycle_days: i32,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if cycle_days <= 0 || expired_at > now {
        return None;
    }
    let cycle = Duration::days(i64::from(cycle_days));
    let behind = (now - expired_at).num_seconds();
    let cycles = behind / cycle.num_seconds() + 1;
    expired_at.checked_add_signed(cycle * cycles as i32)
}

/// Renews every auto-renewing client whose expiry has passed. Returns the
/// renewed `(uuid, new_expiry)` pairs.
pub async fn apply_auto_renewals(
    db: &DatabaseConnection,
    now: DateTime<Utc>,
    lifetime_threshold: Duration,
) -> Result<Vec<(String, DateTime<Utc>)>, DbErr> {
    let due = client::Entity::find()
        .filter(client::Column::AutoRenewal.eq(true))
        .filter(client::Column::BillingCycle.gt(0))
        .filter(client::Column::ExpiredAt.lte(now))
        .all(db)
        .await?;

    let mut renewed = Vec::new();
    for c in due {
        let Some(expired_at) = c.expired_at else { continue };
        if is_lifetime(expired_at, now, lifetime_threshold) {
            continue;
        }
        let Some(next) = next_expiry(expired_at, c.billing_cycle, now) else {
            warn!(client = %c.uuid, "Could not compute next expiry.");
            continue;
        };
        let uuid = c.uuid.clone();
        let mut active = c.into_active_model();
        active.expired_at = Set(Some(next));
        active.updated_at = Set(now);
        active.update(db).await?;
        info!(client = %uuid, next_expiry = %next, "Client auto-renewed.");
        renewed.push((uuid, next));
    }
    Ok(renewed)
}

/// Clients whose expiry falls within `[now, now + lead]`, lifetime-billed
/// clients excluded.
pub async fn expiring_clients(
    db: &DatabaseConnection,
    now: DateTime<Utc>,
    lead: Duration,
    lifetime_threshold: Duration,
) -> Result<Vec<client::Model>, DbErr> {
    let clients = client::Entity::find()
        .filter(client::Column::ExpiredAt.is_not_null())
        .filter(client::Column::ExpiredAt.gte(now))
        .filter(client::Column::ExpiredAt.lte(now + lead))
        .all(db)
        .await?;
    Ok(clients
        .into_iter()
        .filter(|c| {
            c.expired_at
                .is_some_and(|at| !is_lifetime(at, now, lifetime_threshold))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::db::services::client_service::{self, ClientUpdate};
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn next_expiry_skips_missed_cycles() {
        assert_eq!(next_expiry(day(1), 7, day(1)), Some(day(8)));
        assert_eq!(next_expiry(day(1), 7, day(20)), Some(day(22)));
        assert_eq!(next_expiry(day(10), 7, day(1)), None);
        assert_eq!(next_expiry(day(1), 0, day(20)), None);
    }

    #[test]
    fn lifetime_threshold_is_exclusive() {
        let threshold = Duration::days(36500);
        assert!(!is_lifetime(day(1) + threshold, day(1), threshold));
        assert!(is_lifetime(day(1) + threshold + Duration::days(1), day(1), threshold));
    }

    #[tokio::test]
    async fn renewal_and_expiry_queries() {
        let db = connect_in_memory().await.unwrap();
        let renewing = client_service::create_client(&db, "renewing").await.unwrap();
        let expiring = client_service::create_client(&db, "expiring").await.unwrap();
        let lifetime = client_service::create_client(&db, "lifetime").await.unwrap();
        let threshold = Duration::days(36500);
        let now = day(15);

        client_service::update_client(
            &db,
            &renewing.uuid,
            ClientUpdate {
                expired_at: Some(day(1)),
                billing_cycle: Some(30),
                auto_renewal: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        client_service::update_client(
            &db,
            &expiring.uuid,
            ClientUpdate {
                expired_at: Some(day(17)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        client_service::update_client(
            &db,
            &lifetime.uuid,
            ClientUpdate {
                expired_at: Some(now + Duration::days(40000)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let renewed = apply_auto_renewals(&db, now, threshold).await.unwrap();
        assert_eq!(renewed, vec![(renewing.uuid.clone(), day(31))]);

        let soon = expiring_clients(&db, now, Duration::days(7), threshold).await.unwrap();
        let ids: Vec<_> = soon.iter().map(|c| c.uuid.as_str()).collect();
        assert_eq!(ids, vec![expiring.uuid.as_str()]);
    }
}
