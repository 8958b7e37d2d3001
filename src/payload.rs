//! Message payloads sent through a project and the artifact it writes back.

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A payload the round-trip verifier can generate and compare.
pub trait RoundTripPayload:
    Serialize + DeserializeOwned + PartialEq + fmt::Debug + Clone + Send + Sync + 'static
{
    fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self;

    /// The first field (by name) whose value differs, as
    /// `(field, expected, actual)`.
    fn first_difference(&self, actual: &Self) -> Option<(String, String, String)> {
        if self == actual {
            return None;
        }

        let expected = serde_json::to_value(self).unwrap_or(Value::Null);
        let actual = serde_json::to_value(actual).unwrap_or(Value::Null);
        match (&expected, &actual) {
            (Value::Object(expected), Value::Object(actual)) => expected
                .iter()
                .find(|(key, value)| actual.get(key.as_str()) != Some(value))
                .map(|(key, value)| {
                    let found = actual.get(key.as_str()).cloned().unwrap_or(Value::Null);
                    (key.clone(), value.to_string(), found.to_string())
                }),
            _ => Some(("payload".to_string(), expected.to_string(), actual.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorStatus {
    Online,
    Offline,
}

/// Telemetry of a single sensor, as sent to event-hub workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorUpdate {
    pub sensor_id: String,
    pub sensor_status: SensorStatus,
    pub timestamp: DateTime<Utc>,
}

impl RoundTripPayload for SensorUpdate {
    fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let sensor_status = if rng.gen_bool(0.5) {
            SensorStatus::Online
        } else {
            SensorStatus::Offline
        };
        Self {
            sensor_id: Uuid::new_v4().to_string(),
            sensor_status,
            timestamp: Utc::now().trunc_subsecs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub first_name: String,
    pub last_name: String,
}

/// An order, as sent to queue and topic workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub amount: i32,
    pub article_number: String,
    pub customer: Customer,
}

const FIRST_NAMES: &[&str] = &["Ada", "Grace", "Linus", "Barbara", "Ken", "Margaret"];
const LAST_NAMES: &[&str] = &["Lovelace", "Hopper", "Torvalds", "Liskov", "Thompson", "Hamilton"];
const PRODUCTS: &[&str] = &["Chair", "Keyboard", "Lamp", "Monitor", "Desk", "Headphones"];

fn pick<R: Rng + ?Sized>(rng: &mut R, values: &[&str]) -> String {
    values.choose(rng).copied().unwrap_or_default().to_string()
}

impl RoundTripPayload for Order {
    fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            amount: rng.gen_range(1..=10_000),
            article_number: format!("{}-{:05}", pick(rng, PRODUCTS), rng.gen_range(0..100_000)),
            customer: Customer {
                first_name: pick(rng, FIRST_NAMES),
                last_name: pick(rng, LAST_NAMES),
            },
        }
    }
}

/// Correlation the project observed while handling the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationInfo {
    pub transaction_id: String,
    pub operation_parent_id: String,
    #[serde(default)]
    pub cycle_id: String,
}

/// The artifact a message handler writes: the payload fields plus the
/// correlation it saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData<P> {
    #[serde(flatten)]
    pub payload: P,
    pub correlation_info: CorrelationInfo,
}
