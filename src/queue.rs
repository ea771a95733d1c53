use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgTypeInfo, PgValueRef};
use sqlx::{Decode, FromRow, Postgres, Type};

use crate::errors::{Error, Result};

/// Reserved prefix for internal queue names.
pub(crate) const RESERVED_PREFIX: &str = "__";

/// Uniqueness discipline a queue enforces at insert time.
///
/// The policy selects which unique partial indexes the queue's partition
/// carries and is copied onto every job row at enqueue so index predicates
/// can filter on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// No uniqueness constraints beyond throttle keys.
    #[default]
    Standard,
    /// At most one job in `created` per queue.
    Short,
    /// At most one job in `active` per queue.
    Singleton,
    /// At most one job per `(queue, state)` for states up to `active`.
    Stately,
}

impl Display for QueuePolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueuePolicy::Standard => "standard",
            QueuePolicy::Short => "short",
            QueuePolicy::Singleton => "singleton",
            QueuePolicy::Stately => "stately",
        };
        write!(f, "{s}")
    }
}

impl FromStr for QueuePolicy {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s {
            "standard" => Ok(QueuePolicy::Standard),
            "short" => Ok(QueuePolicy::Short),
            "singleton" => Ok(QueuePolicy::Singleton),
            "stately" => Ok(QueuePolicy::Stately),
            other => Err(format!("unknown queue policy '{other}'")),
        }
    }
}

impl Type<Postgres> for QueuePolicy {
    fn type_info() -> PgTypeInfo {
        <&str as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as Type<Postgres>>::compatible(ty)
    }
}

impl<'r> Decode<'r, Postgres> for QueuePolicy {
    fn decode(value: PgValueRef<'r>) -> core::result::Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<Postgres>>::decode(value)?;
        Ok(s.parse()?)
    }
}

/// Configuration for `create_queue` / `update_queue`.
///
/// ```
/// use stevedore::{QueueOptionsBuilder, QueuePolicy};
///
/// let opts = QueueOptionsBuilder::default()
///     .policy(QueuePolicy::Singleton)
///     .retry_limit(5)
///     .dead_letter("failures")
///     .build()
///     .unwrap();
/// ```
#[derive(Builder, Getters, Debug, Default, Clone, Serialize)]
#[getset(get = "pub")]
#[builder(setter(strip_option, into), default, pattern = "owned")]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<QueuePolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<i32>,
    /// Seconds between retries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff: Option<bool>,
    /// Handler deadline, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_in_seconds: Option<i32>,
    /// How long terminal jobs stay in the live table before archival.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_minutes: Option<i32>,
    /// Queue that receives a copy of jobs that exhaust their retry budget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<String>,
}

/// A queue metadata row.
#[derive(FromRow, Getters, Debug, Clone)]
#[getset(get = "pub")]
pub struct Queue {
    name: String,
    policy: QueuePolicy,
    retry_limit: Option<i32>,
    retry_delay: Option<i32>,
    retry_backoff: Option<bool>,
    expire_seconds: Option<i32>,
    retention_minutes: Option<i32>,
    dead_letter: Option<String>,
    created_on: DateTime<Utc>,
    updated_on: DateTime<Utc>,
}

/// Validate a queue (or event) name: non-empty, `[A-Za-z0-9_-]+`, and not
/// carrying the reserved `__` prefix.
pub(crate) fn assert_valid_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("queue name cannot be empty"));
    }

    if name.starts_with(RESERVED_PREFIX) {
        return Err(Error::validation(format!(
            "queue name '{name}' uses the reserved '{RESERVED_PREFIX}' prefix"
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::validation(format!(
            "queue name '{name}' may only contain letters, digits, underscores and dashes"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_round_trips_through_text() {
        for p in ["standard", "short", "singleton", "stately"] {
            let policy: QueuePolicy = p.parse().unwrap();
            assert_eq!(policy.to_string(), p);
        }
        assert!("strict".parse::<QueuePolicy>().is_err());
    }

    #[test]
    fn valid_names_pass() {
        for name in ["q", "email-welcome", "batch_7", "A1"] {
            assert!(assert_valid_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn invalid_names_are_rejected() {
        for name in ["", "__internal", "has space", "dotted.name", "emoji🦀"] {
            assert!(assert_valid_name(name).is_err(), "{name} should be invalid");
        }
    }

    #[test]
    fn queue_options_serialize_to_camel_case() {
        let opts = QueueOptionsBuilder::default()
            .policy(QueuePolicy::Short)
            .retry_limit(3)
            .build()
            .unwrap();

        let v = serde_json::to_value(&opts).unwrap();
        assert_eq!(v["policy"], "short");
        assert_eq!(v["retryLimit"], 3);
        assert!(v.get("deadLetter").is_none());
    }
}
