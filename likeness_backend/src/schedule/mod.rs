pub mod evaluator;
pub mod scheduler;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Daily,
    Weekly,
    Random,
    Contextual,
}

impl ScheduleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleKind::Daily => "daily",
            ScheduleKind::Weekly => "weekly",
            ScheduleKind::Random => "random",
            ScheduleKind::Contextual => "contextual",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(ScheduleKind::Daily),
            "weekly" => Some(ScheduleKind::Weekly),
            "random" => Some(ScheduleKind::Random),
            "contextual" | "inactivity" => Some(ScheduleKind::Contextual),
            _ => None,
        }
    }
}

/// Trigger conditions. The variant fixes the schedule type, so a validated
/// definition can never carry conditions that disagree with its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TriggerConditions {
    Daily {
        times: Vec<NaiveTime>,
    },
    Weekly {
        days: Vec<Weekday>,
        times: Vec<NaiveTime>,
    },
    Random {
        probability: f64,
    },
    Contextual {
        inactivity_minutes: i64,
    },
}

impl TriggerConditions {
    pub fn kind(&self) -> ScheduleKind {
        match self {
            TriggerConditions::Daily { .. } => ScheduleKind::Daily,
            TriggerConditions::Weekly { .. } => ScheduleKind::Weekly,
            TriggerConditions::Random { .. } => ScheduleKind::Random,
            TriggerConditions::Contextual { .. } => ScheduleKind::Contextual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: String,
    pub character_id: String,
    pub conditions: TriggerConditions,
    pub priority: u8,
    pub active: bool,
    /// Offset applied to UTC before comparing times of day and weekdays.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Steers what the initiative message is about ("good morning", "check in").
    #[serde(default)]
    pub message_hint: Option<String>,
}

impl ScheduleDefinition {
    pub fn kind(&self) -> ScheduleKind {
        self.conditions.kind()
    }
}

/// Schedule as written in configuration: a type name plus a loosely typed
/// conditions table. Converted into [`ScheduleDefinition`] by validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSchedule {
    pub id: String,
    pub character_id: String,
    #[serde(rename = "type")]
    pub schedule_type: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub trigger_conditions: serde_json::Value,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub message_hint: Option<String>,
}

fn default_priority() -> u8 {
    5
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawTimes {
    #[serde(default)]
    times: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawWeekly {
    #[serde(default)]
    days: Vec<String>,
    #[serde(default)]
    times: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawRandom {
    probability: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawContextual {
    inactivity_minutes: Option<i64>,
}

impl TryFrom<RawSchedule> for ScheduleDefinition {
    type Error = EngineError;

    fn try_from(raw: RawSchedule) -> EngineResult<Self> {
        if raw.id.trim().is_empty() {
            return Err(EngineError::Validation("schedule id is empty".to_string()));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&raw.priority) {
            return Err(EngineError::Validation(format!(
                "priority {} outside {}..={}",
                raw.priority, MIN_PRIORITY, MAX_PRIORITY
            )));
        }
        let kind = ScheduleKind::parse(&raw.schedule_type).ok_or_else(|| {
            EngineError::Validation(format!("unknown schedule type '{}'", raw.schedule_type))
        })?;
        if !raw.trigger_conditions.is_object()
            || raw
                .trigger_conditions
                .as_object()
                .is_some_and(|map| map.is_empty())
        {
            return Err(EngineError::Validation(
                "trigger_conditions must be a non-empty table".to_string(),
            ));
        }

        let conditions = parse_conditions(kind, raw.trigger_conditions)?;
        let definition = ScheduleDefinition {
            id: raw.id,
            character_id: raw.character_id,
            conditions,
            priority: raw.priority,
            active: raw.active,
            utc_offset_minutes: raw.utc_offset_minutes,
            message_hint: raw.message_hint.filter(|hint| !hint.trim().is_empty()),
        };
        validate(&definition)?;
        Ok(definition)
    }
}

fn parse_conditions(
    kind: ScheduleKind,
    value: serde_json::Value,
) -> EngineResult<TriggerConditions> {
    let bad = |e: serde_json::Error| {
        EngineError::Validation(format!("{} trigger_conditions: {}", kind.as_str(), e))
    };
    match kind {
        ScheduleKind::Daily => {
            let raw: RawTimes = serde_json::from_value(value).map_err(bad)?;
            Ok(TriggerConditions::Daily {
                times: parse_times(&raw.times)?,
            })
        }
        ScheduleKind::Weekly => {
            let raw: RawWeekly = serde_json::from_value(value).map_err(bad)?;
            let days = raw
                .days
                .iter()
                .map(|day| {
                    day.trim().parse::<Weekday>().map_err(|_| {
                        EngineError::Validation(format!("unknown weekday '{}'", day))
                    })
                })
                .collect::<EngineResult<Vec<_>>>()?;
            Ok(TriggerConditions::Weekly {
                days,
                times: parse_times(&raw.times)?,
            })
        }
        ScheduleKind::Random => {
            let raw: RawRandom = serde_json::from_value(value).map_err(bad)?;
            let probability = raw.probability.ok_or_else(|| {
                EngineError::Validation("random schedule needs a probability".to_string())
            })?;
            Ok(TriggerConditions::Random { probability })
        }
        ScheduleKind::Contextual => {
            let raw: RawContextual = serde_json::from_value(value).map_err(bad)?;
            let inactivity_minutes = raw.inactivity_minutes.ok_or_else(|| {
                EngineError::Validation(
                    "contextual schedule needs inactivity_minutes".to_string(),
                )
            })?;
            Ok(TriggerConditions::Contextual { inactivity_minutes })
        }
    }
}

fn parse_times(raw: &[String]) -> EngineResult<Vec<NaiveTime>> {
    raw.iter()
        .map(|value| {
            let trimmed = value.trim();
            NaiveTime::parse_from_str(trimmed, "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
                .map_err(|_| EngineError::Validation(format!("invalid time of day '{}'", value)))
        })
        .collect()
}

/// Checks a definition for internal consistency. Also applied to definitions
/// that bypass [`RawSchedule`], e.g. ones built in code.
pub fn validate(schedule: &ScheduleDefinition) -> EngineResult<()> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&schedule.priority) {
        return Err(EngineError::Validation(format!(
            "priority {} outside {}..={}",
            schedule.priority, MIN_PRIORITY, MAX_PRIORITY
        )));
    }
    if schedule.utc_offset_minutes.abs() > 14 * 60 {
        return Err(EngineError::Validation(format!(
            "utc offset {} minutes out of range",
            schedule.utc_offset_minutes
        )));
    }
    match &schedule.conditions {
        TriggerConditions::Daily { times } if times.is_empty() => Err(EngineError::Validation(
            "daily schedule needs at least one time".to_string(),
        )),
        TriggerConditions::Weekly { days, times } if days.is_empty() || times.is_empty() => {
            Err(EngineError::Validation(
                "weekly schedule needs at least one day and one time".to_string(),
            ))
        }
        TriggerConditions::Random { probability }
            if !probability.is_finite() || !(0.0..=1.0).contains(probability) =>
        {
            Err(EngineError::Validation(format!(
                "probability {} outside 0.0..=1.0",
                probability
            )))
        }
        TriggerConditions::Contextual { inactivity_minutes } if *inactivity_minutes <= 0 => {
            Err(EngineError::Validation(
                "inactivity_minutes must be positive".to_string(),
            ))
        }
        _ => Ok(()),
    }
}

/// "A schedule fired for a conversation at time T". Append-only, used only for
/// de-duplication windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiativeEvent {
    pub schedule_id: String,
    pub conversation_id: String,
    pub fired_at: DateTime<Utc>,
}
