use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events produced by the watchers and consumed by the notification
/// dispatcher. Producers never call senders directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    Online {
        client: String,
    },
    Offline {
        client: String,
    },
    LoadAlert {
        rule_id: i32,
        rule_name: String,
        metric: String,
        threshold: f64,
        ratio: f64,
        interval_minutes: i32,
        clients: Vec<String>,
    },
    Expire {
        clients: Vec<(String, DateTime<Utc>)>,
    },
    Renewed {
        client: String,
        next_expiry: DateTime<Utc>,
    },
    TrafficLimit {
        client: String,
        used: i64,
        limit: i64,
        limit_type: String,
    },
}

impl NotificationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            NotificationEvent::Online { .. } => "online",
            NotificationEvent::Offline { .. } => "offline",
            NotificationEvent::LoadAlert { .. } => "load",
            NotificationEvent::Expire { .. } => "expire",
            NotificationEvent::Renewed { .. } => "renewal",
            NotificationEvent::TrafficLimit { .. } => "traffic",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            NotificationEvent::Online { .. } => "\u{1F7E2}",
            NotificationEvent::Offline { .. } => "\u{1F534}",
            NotificationEvent::LoadAlert { .. } => "\u{1F4C8}",
            NotificationEvent::Expire { .. } => "\u{23F0}",
            NotificationEvent::Renewed { .. } => "\u{1F504}",
            NotificationEvent::TrafficLimit { .. } => "\u{1F4CA}",
        }
    }

    /// Client uuids the event is about.
    pub fn clients(&self) -> Vec<String> {
        match self {
            NotificationEvent::Online { client }
            | NotificationEvent::Offline { client }
            | NotificationEvent::Renewed { client, .. }
            | NotificationEvent::TrafficLimit { client, .. } => vec![client.clone()],
            NotificationEvent::LoadAlert { clients, .. } => clients.clone(),
            NotificationEvent::Expire { clients } => clients.iter().map(|(c, _)| c.clone()).collect(),
        }
    }

    /// Human-readable body. `names` maps uuids to display names; unknown
    /// uuids are shown as-is.
    pub fn format_message(&self, names: &HashMap<String, String>) -> String {
        let name = |uuid: &str| names.get(uuid).cloned().unwrap_or_else(|| uuid.to_owned());
        match self {
            NotificationEvent::Online { client } => format!("{} is back online", name(client)),
            NotificationEvent::Offline { client } => format!("{} is offline", name(client)),
            NotificationEvent::LoadAlert {
                rule_name,
                metric,
                threshold,
                ratio,
                interval_minutes,
                clients,
                ..
            } => {
                let list: Vec<String> = clients.iter().map(|c| name(c)).collect();
                format!(
                    "Load rule `{rule_name}`: {metric} >= {threshold} for {:.0}% of the last {interval_minutes} min on {}",
                    ratio * 100.0,
                    list.join(", ")
                )
            }
            NotificationEvent::Expire { clients } => {
                let lines: Vec<String> = clients
                    .iter()
                    .map(|(c, at)| format!("{} expires at {}", name(c), at.format("%Y-%m-%d %H:%M UTC")))
                    .collect();
                lines.join("\n")
            }
            NotificationEvent::Renewed {
                client,
                next_expiry,
            } => format!(
                "{} was renewed until {}",
                name(client),
                next_expiry.format("%Y-%m-%d %H:%M UTC")
            ),
            NotificationEvent::TrafficLimit {
                client,
                used,
                limit,
                limit_type,
            } => {
                let pct = if *limit > 0 {
                    *used as f64 / *limit as f64 * 100.0
                } else {
                    0.0
                };
                format!(
                    "{} used {:.1}% of its traffic limit ({used} / {limit} bytes, {limit_type})",
                    name(client),
                    pct
                )
            }
        }
    }
}

/// What a sender receives for one event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundNotification {
    pub event: String,
    /// Display names of the affected clients.
    pub clients: Vec<String>,
    pub message: String,
    pub emoji: String,
    pub time: DateTime<Utc>,
}

impl OutboundNotification {
    pub fn from_event(
        event: &NotificationEvent,
        names: &HashMap<String, String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            event: event.event_type().to_owned(),
            clients: event
                .clients()
                .iter()
                .map(|c| names.get(c).cloned().unwrap_or_else(|| c.clone()))
                .collect(),
            message: event.format_message(names),
            emoji: event.emoji().to_owned(),
            time,
        }
    }
}
