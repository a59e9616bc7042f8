//! Character visual state: what the character looks like right now.
//!
//! Snapshots are immutable. Each turn produces a [`VisualDelta`] which is
//! folded onto the previous snapshot by [`merge`].

pub mod extractor;
pub mod heuristic;
pub mod schema;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualField {
    BodyType,
    SkinTone,
    Hair,
    Eyes,
    Face,
    DistinguishingFeatures,
    Clothing,
    Accessories,
    Expression,
    Pose,
    Action,
    Location,
    Injuries,
}

impl VisualField {
    pub const ALL: [VisualField; 13] = [
        VisualField::BodyType,
        VisualField::SkinTone,
        VisualField::Hair,
        VisualField::Eyes,
        VisualField::Face,
        VisualField::DistinguishingFeatures,
        VisualField::Clothing,
        VisualField::Accessories,
        VisualField::Expression,
        VisualField::Pose,
        VisualField::Action,
        VisualField::Location,
        VisualField::Injuries,
    ];

    /// Permanent appearance. Never changes within a conversation unless the
    /// story explicitly says so.
    pub const LOCKED: [VisualField; 6] = [
        VisualField::BodyType,
        VisualField::SkinTone,
        VisualField::Hair,
        VisualField::Eyes,
        VisualField::Face,
        VisualField::DistinguishingFeatures,
    ];

    pub fn key(self) -> &'static str {
        match self {
            VisualField::BodyType => "body_type",
            VisualField::SkinTone => "skin_tone",
            VisualField::Hair => "hair",
            VisualField::Eyes => "eyes",
            VisualField::Face => "face",
            VisualField::DistinguishingFeatures => "distinguishing_features",
            VisualField::Clothing => "clothing",
            VisualField::Accessories => "accessories",
            VisualField::Expression => "expression",
            VisualField::Pose => "pose",
            VisualField::Action => "action",
            VisualField::Location => "location",
            VisualField::Injuries => "injuries",
        }
    }

    /// Accepts canonical keys plus the aliases older prompts produced.
    pub fn from_key(raw: &str) -> Option<Self> {
        let key = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        let field = match key.as_str() {
            "body_type" | "body" | "build" => VisualField::BodyType,
            "skin_tone" | "skin" => VisualField::SkinTone,
            "hair" | "hair_style" | "hairstyle" => VisualField::Hair,
            "eyes" | "eye_color" => VisualField::Eyes,
            "face" | "facial_features" => VisualField::Face,
            "distinguishing_features" | "features" | "marks" => {
                VisualField::DistinguishingFeatures
            }
            "clothing" | "clothes" | "outfit" => VisualField::Clothing,
            "accessories" => VisualField::Accessories,
            "expression" | "emotion" | "mood" => VisualField::Expression,
            "pose" | "posture" => VisualField::Pose,
            "action" | "activity" => VisualField::Action,
            "location" | "setting" | "place" => VisualField::Location,
            "injuries" | "injury" => VisualField::Injuries,
            _ => return None,
        };
        Some(field)
    }

    pub fn is_locked(self) -> bool {
        Self::LOCKED.contains(&self)
    }

    /// Neutral value used when the first snapshot has nothing for a field.
    pub fn default_value(self) -> &'static str {
        match self {
            VisualField::BodyType => "average build",
            VisualField::SkinTone => "natural skin",
            VisualField::Hair => "natural hair",
            VisualField::Eyes => "natural eyes",
            VisualField::Face => "natural features",
            VisualField::DistinguishingFeatures => "none",
            VisualField::Clothing => "casual clothes",
            VisualField::Accessories => "none",
            VisualField::Expression => "neutral expression",
            VisualField::Pose => "standing",
            VisualField::Action => "idle",
            VisualField::Location => "indoors",
            VisualField::Injuries => "none",
        }
    }

    /// A change in one of these fields always warrants a new image.
    fn forces_regeneration(self) -> bool {
        self.is_locked()
            || matches!(
                self,
                VisualField::Location | VisualField::Expression | VisualField::Clothing
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: String,
    pub changed: bool,
}

impl FieldValue {
    pub fn new(value: impl Into<String>, changed: bool) -> Self {
        Self {
            value: value.into(),
            changed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    Ai,
    Heuristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Low,
}

/// Why a scene prompt is being (re)built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneTrigger {
    Initial,
    Evolution,
    Followup,
}

impl SceneTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            SceneTrigger::Initial => "initial",
            SceneTrigger::Evolution => "evolution",
            SceneTrigger::Followup => "followup",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "initial" => SceneTrigger::Initial,
            "followup" | "follow_up" => SceneTrigger::Followup,
            _ => SceneTrigger::Evolution,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterVisualState {
    pub id: String,
    pub conversation_id: String,
    pub fields: BTreeMap<VisualField, FieldValue>,
    pub source: ExtractionSource,
    pub confidence: Confidence,
    pub context_significance: u8,
    pub visual_update_needed: bool,
    pub captured_at: DateTime<Utc>,
}

impl CharacterVisualState {
    pub fn value(&self, field: VisualField) -> &str {
        self.fields
            .get(&field)
            .map(|f| f.value.as_str())
            .unwrap_or_else(|| field.default_value())
    }

    pub fn changed(&self, field: VisualField) -> bool {
        self.fields.get(&field).is_some_and(|f| f.changed)
    }

    pub fn changed_fields(&self) -> Vec<VisualField> {
        VisualField::ALL
            .into_iter()
            .filter(|field| self.changed(*field))
            .collect()
    }

    /// Does this snapshot warrant a new scene prompt?
    ///
    /// Heuristic snapshots never do; they exist to keep history continuous.
    pub fn is_significant(&self, threshold: u8) -> bool {
        if self.source == ExtractionSource::Heuristic {
            return false;
        }
        self.visual_update_needed
            || self.context_significance >= threshold
            || self
                .changed_fields()
                .into_iter()
                .any(VisualField::forces_regeneration)
    }

    /// Compact "field: value" listing, used as context for the next extraction.
    pub fn describe(&self) -> String {
        VisualField::ALL
            .iter()
            .map(|field| format!("{}: {}", field.key(), self.value(*field)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One turn's extracted observations, before merging.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualDelta {
    pub fields: BTreeMap<VisualField, FieldValue>,
    pub visual_update_needed: bool,
    pub context_significance: u8,
    pub source: ExtractionSource,
    pub confidence: Confidence,
}

impl VisualDelta {
    pub fn empty(source: ExtractionSource) -> Self {
        Self {
            fields: BTreeMap::new(),
            visual_update_needed: false,
            context_significance: 0,
            source,
            confidence: match source {
                ExtractionSource::Ai => Confidence::High,
                ExtractionSource::Heuristic => Confidence::Low,
            },
        }
    }

    pub fn set(&mut self, field: VisualField, value: impl Into<String>, changed: bool) {
        self.fields.insert(field, FieldValue::new(value, changed));
    }
}

/// Fold a delta onto the previous snapshot, producing a new snapshot.
///
/// With a previous snapshot, a field adopts the extracted value only when it
/// is flagged changed and non-empty; otherwise the previous value is kept
/// verbatim. Without one, every non-empty extracted value is adopted and the
/// rest fall back to per-field defaults.
pub fn merge(
    previous: Option<&CharacterVisualState>,
    delta: &VisualDelta,
    conversation_id: &str,
    captured_at: DateTime<Utc>,
) -> CharacterVisualState {
    let mut fields = BTreeMap::new();
    for field in VisualField::ALL {
        let extracted = delta
            .fields
            .get(&field)
            .map(|f| (f.value.trim(), f.changed))
            .filter(|(value, _)| !value.is_empty());

        let merged = match (previous, extracted) {
            (Some(prev), Some((value, true))) => {
                let before = prev.value(field);
                FieldValue::new(value, value != before)
            }
            (Some(prev), _) => FieldValue::new(prev.value(field), false),
            (None, Some((value, _))) => FieldValue::new(value, true),
            (None, None) => FieldValue::new(field.default_value(), false),
        };
        fields.insert(field, merged);
    }

    CharacterVisualState {
        id: uuid::Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        fields,
        source: delta.source,
        confidence: delta.confidence,
        context_significance: delta.context_significance.min(10),
        visual_update_needed: delta.visual_update_needed,
        captured_at,
    }
}
