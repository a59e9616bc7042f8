//! Wire formats for the AI visual analysis.
//!
//! Two shapes are accepted. The current one nests per-field objects:
//!
//! ```json
//! {"visual_update_needed": true, "context_significance": 8,
//!  "attributes": {"clothing": {"value": "red dress", "changed": true}}}
//! ```
//!
//! The legacy one is flat: `{"clothing": "red dress", "clothing_changed": true,
//! "significance": 8}`. Both decode once into a [`VisualDelta`].

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::{ExtractionSource, VisualDelta, VisualField};
use crate::error::{EngineError, EngineResult};
use crate::llm_client::{extract_json_object, strip_reasoning};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireAnalysis {
    Current(CurrentSchema),
    Legacy(Map<String, Value>),
}

#[derive(Debug, Deserialize)]
struct CurrentSchema {
    attributes: HashMap<String, WireField>,
    #[serde(default)]
    visual_update_needed: Option<Value>,
    #[serde(default)]
    context_significance: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireField {
    Full {
        #[serde(default)]
        value: Option<Value>,
        #[serde(default)]
        changed: Option<Value>,
    },
    Bare(Value),
}

/// Parse a raw model response into a delta.
pub fn decode_analysis(response: &str) -> EngineResult<VisualDelta> {
    let object = extract_json_object(strip_reasoning(response)).ok_or_else(|| {
        EngineError::parse("visual analysis", "response contains no JSON object")
    })?;
    let wire: WireAnalysis =
        serde_json::from_str(object).map_err(|e| EngineError::parse("visual analysis", e))?;
    let delta = match wire {
        WireAnalysis::Current(current) => from_current(current),
        WireAnalysis::Legacy(flat) => from_legacy(flat),
    };
    if delta.fields.is_empty() {
        return Err(EngineError::parse(
            "visual analysis",
            "no recognised attributes",
        ));
    }
    Ok(delta)
}

fn from_current(current: CurrentSchema) -> VisualDelta {
    let mut delta = VisualDelta::empty(ExtractionSource::Ai);
    for (key, field) in current.attributes {
        let Some(visual_field) = VisualField::from_key(&key) else {
            tracing::debug!("Ignoring unknown visual attribute '{}'", key);
            continue;
        };
        let (value, changed) = match field {
            WireField::Full { value, changed } => (
                value.as_ref().and_then(text_of).unwrap_or_default(),
                changed.as_ref().and_then(flag_of),
            ),
            WireField::Bare(value) => (text_of(&value).unwrap_or_default(), None),
        };
        let changed = changed.unwrap_or(!value.is_empty());
        delta.set(visual_field, value, changed);
    }
    delta.visual_update_needed = current
        .visual_update_needed
        .as_ref()
        .and_then(flag_of)
        .unwrap_or(false);
    delta.context_significance = current
        .context_significance
        .as_ref()
        .and_then(score_of)
        .unwrap_or(0);
    delta
}

fn from_legacy(flat: Map<String, Value>) -> VisualDelta {
    let mut delta = VisualDelta::empty(ExtractionSource::Ai);
    for (key, value) in &flat {
        if key.ends_with("_changed") {
            continue;
        }
        let Some(field) = VisualField::from_key(key) else {
            continue;
        };
        let text = text_of(value).unwrap_or_default();
        let changed = flat
            .get(&format!("{}_changed", key))
            .and_then(flag_of)
            .unwrap_or(!text.is_empty());
        delta.set(field, text, changed);
    }
    delta.visual_update_needed = ["visual_update_needed", "needs_update", "update_image"]
        .iter()
        .find_map(|key| flat.get(*key).and_then(flag_of))
        .unwrap_or(false);
    delta.context_significance = ["context_significance", "significance"]
        .iter()
        .find_map(|key| flat.get(*key).and_then(score_of))
        .unwrap_or(0);
    delta
}

/// Strings pass through, lists are comma-joined, null is absent.
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(text_of).filter(|s| !s.is_empty()).collect();
            Some(parts.join(", "))
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(_) | Value::Null | Value::Object(_) => None,
    }
}

fn flag_of(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

fn score_of(value: &Value) -> Option<u8> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    Some(raw.round().clamp(0.0, 10.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_current_schema() {
        let response = r#"<think>let me look</think>
        {"visual_update_needed": true, "context_significance": 8,
         "attributes": {
            "clothing": {"value": "red dress", "changed": true},
            "location": {"value": "rooftop bar", "changed": "yes"},
            "hair": {"value": "long black hair", "changed": false},
            "weather": {"value": "rainy", "changed": true}
         }}"#;
        let delta = decode_analysis(response).expect("decode");
        assert!(delta.visual_update_needed);
        assert_eq!(delta.context_significance, 8);
        assert_eq!(delta.fields.len(), 3);
        let location = &delta.fields[&VisualField::Location];
        assert_eq!(location.value, "rooftop bar");
        assert!(location.changed);
        assert!(!delta.fields[&VisualField::Hair].changed);
    }

    #[test]
    fn decodes_legacy_flat_schema() {
        let response = r#"{"clothes": "hoodie", "clothes_changed": true,
            "emotion": "tired", "emotion_changed": false,
            "location": ["kitchen", "by the window"], "significance": "6.6"}"#;
        let delta = decode_analysis(response).expect("decode");
        assert_eq!(delta.context_significance, 7);
        assert!(!delta.visual_update_needed);
        assert_eq!(delta.fields[&VisualField::Clothing].value, "hoodie");
        assert!(!delta.fields[&VisualField::Expression].changed);
        let location = &delta.fields[&VisualField::Location];
        assert_eq!(location.value, "kitchen, by the window");
        assert!(location.changed);
    }

    #[test]
    fn rejects_responses_without_attributes() {
        assert!(matches!(
            decode_analysis("I could not analyse that."),
            Err(EngineError::Parse { .. })
        ));
        assert!(matches!(
            decode_analysis(r#"{"mood_of_user": "fine"}"#),
            Err(EngineError::Parse { .. })
        ));
    }
}
