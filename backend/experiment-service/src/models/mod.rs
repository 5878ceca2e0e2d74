/// Domain entities for experiments, assignments and outcome events
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use uuid::Uuid;

/// Event type counted as a conversion when an experiment names no goal
pub const DEFAULT_GOAL_EVENT: &str = "conversion";

/// Experiment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "experiment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Active => "active",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Completed => "completed",
        }
    }

    /// Whether non-status fields may be edited in this state
    pub fn is_editable(&self) -> bool {
        matches!(self, ExperimentStatus::Draft | ExperimentStatus::Paused)
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExperimentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Ok(ExperimentStatus::Draft),
            "active" => Ok(ExperimentStatus::Active),
            "paused" => Ok(ExperimentStatus::Paused),
            "completed" => Ok(ExperimentStatus::Completed),
            other => Err(format!("unknown experiment status: {}", other)),
        }
    }
}

/// One treatment arm of an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Presentation-layer payload, passed through untouched
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub is_control: bool,
}

/// Targeting predicates over subject attributes.
///
/// Every populated dimension must match (AND). An empty list means the
/// dimension is unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetingRules {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub countries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<String>,
    /// Custom attribute name -> accepted values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, Vec<serde_json::Value>>,
    /// Share (0-100) of otherwise-eligible subjects allowed into the experiment
    #[serde(default)]
    pub percentage: Option<u32>,
}

/// Attributes describing a subject, supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectAttributes {
    #[serde(default)]
    pub user_type: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub custom: HashMap<String, serde_json::Value>,
}

/// Experiment entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub variants: Vec<Variant>,
    /// Variant id -> traffic percentage
    pub allocation: BTreeMap<String, u32>,
    pub targeting: Option<TargetingRules>,
    pub status: ExperimentStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub sample_size: Option<i64>,
    pub confidence_level: Option<f64>,
    pub goal_event: Option<String>,
    /// Bumped whenever targeting or allocation changes
    pub epoch: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<Uuid>,
}

impl Experiment {
    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    /// The single control variant, if exactly one is flagged
    pub fn control(&self) -> Option<&Variant> {
        let mut controls = self.variants.iter().filter(|v| v.is_control);
        match (controls.next(), controls.next()) {
            (Some(control), None) => Some(control),
            _ => None,
        }
    }

    pub fn goal_event_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.goal_event.as_deref().unwrap_or(default)
    }
}

/// Durable (experiment, subject) -> variant pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Assignment {
    pub experiment_id: Uuid,
    pub subject_id: String,
    pub variant_id: String,
    pub epoch: i32,
    pub assigned_at: DateTime<Utc>,
}

/// Outcome event type.
///
/// Serialized as a plain string; unknown strings become `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    View,
    Click,
    Conversion,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::View => "view",
            EventType::Click => "click",
            EventType::Conversion => "conversion",
            EventType::Custom(name) => name,
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "view" => EventType::View,
            "click" => EventType::Click,
            "conversion" => EventType::Conversion,
            _ => EventType::Custom(value),
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        EventType::from(value.to_string())
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only outcome event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub variant_id: String,
    pub subject_id: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Create experiment request
#[derive(Debug, Clone, Deserialize, validator::Validate)]
pub struct CreateExperimentRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub description: Option<String>,
    pub variants: Vec<Variant>,
    pub allocation: BTreeMap<String, u32>,
    #[serde(default)]
    pub targeting: Option<TargetingRules>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sample_size: Option<i64>,
    #[serde(default)]
    pub confidence_level: Option<f64>,
    #[serde(default)]
    pub goal_event: Option<String>,
    #[serde(default)]
    pub created_by: Option<Uuid>,
}

/// Partial update; absent fields are left unchanged.
///
/// Optional definition fields take an explicit `null` to clear them, which
/// deserializes as `Some(None)`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateExperimentRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    pub variants: Option<Vec<Variant>>,
    pub allocation: Option<BTreeMap<String, u32>>,
    #[serde(default, deserialize_with = "nullable")]
    pub targeting: Option<Option<TargetingRules>>,
    #[serde(default, deserialize_with = "nullable")]
    pub start_date: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "nullable")]
    pub end_date: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "nullable")]
    pub sample_size: Option<Option<i64>>,
    #[serde(default, deserialize_with = "nullable")]
    pub confidence_level: Option<Option<f64>>,
    #[serde(default, deserialize_with = "nullable")]
    pub goal_event: Option<Option<String>>,
    pub status: Option<ExperimentStatus>,
}

/// A present field is `Some`, even when its value is `null`
fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl UpdateExperimentRequest {
    /// True when the patch touches anything besides `status`
    pub fn has_field_changes(&self) -> bool {
        self.name.is_some()
            || self.description.is_some()
            || self.variants.is_some()
            || self.allocation.is_some()
            || self.targeting.is_some()
            || self.start_date.is_some()
            || self.end_date.is_some()
            || self.sample_size.is_some()
            || self.confidence_level.is_some()
            || self.goal_event.is_some()
    }
}
