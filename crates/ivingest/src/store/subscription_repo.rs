//! Webhook subscription storage and delivery counters.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use crate::events::EventType;
use crate::store::{parse_ts, ts, Database, StoreError};

/// A registered webhook endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub tenant: String,
    pub url: String,
    pub events: BTreeSet<EventType>,
    /// HMAC secret; returned to the owner exactly once at creation.
    #[serde(skip_serializing)]
    pub secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub active: bool,
    pub total_deliveries: u64,
    pub succeeded_deliveries: u64,
    pub failed_deliveries: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn subscribes_to(&self, event_type: EventType) -> bool {
        self.events.contains(&event_type)
    }
}

/// Creation parameters. The secret is generated server-side.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub tenant: String,
    pub url: String,
    pub events: BTreeSet<EventType>,
    pub description: Option<String>,
}

pub struct SubscriptionRepo {
    db: Arc<Database>,
}

impl SubscriptionRepo {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Creates a subscription and returns it with the freshly generated
    /// secret. Callers must not surface the secret again afterwards.
    pub fn create(
        &self,
        new: NewSubscription,
        now: DateTime<Utc>,
    ) -> Result<Subscription, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        // Two UUIDs worth of entropy, hex-ish and URL-safe.
        let secret = format!(
            "whsec_{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let events_json = serde_json::to_string(
            &new.events.iter().map(|e| e.as_str()).collect::<Vec<_>>(),
        )?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO subscriptions (id, tenant, url, events, secret, description,
                     active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
                params![
                    id,
                    new.tenant,
                    new.url,
                    events_json,
                    secret,
                    new.description,
                    ts(now),
                ],
            )?;
            Ok(())
        })?;

        self.get(&id)?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    pub fn get(&self, id: &str) -> Result<Option<Subscription>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM subscriptions WHERE id = ?1")?;
            let sub = stmt.query_row(params![id], row_to_subscription).optional()?;
            Ok(sub)
        })
    }

    /// Lists a tenant's subscriptions, active or not.
    pub fn list(&self, tenant: &str) -> Result<Vec<Subscription>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM subscriptions WHERE tenant = ?1 ORDER BY created_at ASC",
            )?;
            let subs = stmt
                .query_map(params![tenant], row_to_subscription)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(subs)
        })
    }

    /// Active subscriptions whose event set contains `event_type`.
    pub fn active_for_event(
        &self,
        event_type: EventType,
    ) -> Result<Vec<Subscription>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM subscriptions WHERE active = 1")?;
            let subs = stmt
                .query_map([], row_to_subscription)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(subs
                .into_iter()
                .filter(|s| s.subscribes_to(event_type))
                .collect())
        })
    }

    /// Soft delete: flips the active flag off.
    pub fn deactivate(&self, id: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE subscriptions SET active = 0 WHERE id = ?1",
                params![id],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Ok(())
        })
    }

    /// Records one finished delivery attempt sequence for a subscription.
    pub fn record_delivery(
        &self,
        id: &str,
        succeeded: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE subscriptions SET
                     total_deliveries = total_deliveries + 1,
                     succeeded_deliveries = succeeded_deliveries + ?2,
                     failed_deliveries = failed_deliveries + ?3,
                     last_triggered_at = ?4
                 WHERE id = ?1",
                params![id, succeeded as u32, (!succeeded) as u32, ts(now)],
            )?;
            Ok(())
        })
    }
}

fn row_to_subscription(row: &Row<'_>) -> Result<Subscription, rusqlite::Error> {
    let events_json: String = row.get("events")?;
    let events: BTreeSet<EventType> = serde_json::from_str::<Vec<String>>(&events_json)
        .unwrap_or_default()
        .iter()
        .filter_map(|s| EventType::parse(s))
        .collect();

    let last_triggered: Option<String> = row.get("last_triggered_at")?;
    let created_at: String = row.get("created_at")?;

    Ok(Subscription {
        id: row.get("id")?,
        tenant: row.get("tenant")?,
        url: row.get("url")?,
        events,
        secret: row.get("secret")?,
        description: row.get("description")?,
        active: row.get::<_, i64>("active")? != 0,
        total_deliveries: row.get("total_deliveries")?,
        succeeded_deliveries: row.get("succeeded_deliveries")?,
        failed_deliveries: row.get("failed_deliveries")?,
        last_triggered_at: last_triggered.as_deref().and_then(parse_ts),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
    })
}
