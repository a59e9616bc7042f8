//! Keyword fallback used when the AI analysis is unavailable or unreadable.
//!
//! Only expression, clothing, location and pose are detected. The result is a
//! low-confidence delta; anything not matched is left to the previous snapshot.

use regex_lite::Regex;
use std::sync::LazyLock;

use super::{ExtractionSource, VisualDelta, VisualField};

const EMOTIONS: &[(&str, &str)] = &[
    (r"(?i)\b(laugh(s|ed|ing)?|giggl(e|es|ed|ing)|haha+)\b", "laughing"),
    (r"(?i)\b(smil(e|es|ed|ing)|happy|glad|grin(s|ned|ning)?)\b", "smiling"),
    (r"(?i)\b(cr(y|ies|ied|ying)|tears|sad|sob(s|bed|bing)?)\b", "sad expression, teary eyes"),
    (r"(?i)\b(angry|furious|mad at|glar(e|es|ed|ing)|scowl(s|ed|ing)?)\b", "angry expression"),
    (r"(?i)\b(blush(es|ed|ing)?|embarrass(ed|ing)?|flustered)\b", "blushing"),
    (r"(?i)\b(surprised|shocked|gasp(s|ed)?|startled)\b", "surprised expression"),
    (r"(?i)\b(tired|sleepy|exhausted|yawn(s|ed|ing)?)\b", "tired expression"),
    (r"(?i)\b(nervous|anxious|worried)\b", "nervous expression"),
];

const LOCATIONS: &[(&str, &str)] = &[
    (r"(?i)\b(beach|seaside|shore)\b", "beach"),
    (r"(?i)\b(park|garden)\b", "park"),
    (r"(?i)\b(cafe|coffee shop)\b", "cafe"),
    (r"(?i)\b(restaurant|diner)\b", "restaurant"),
    (r"(?i)\b(kitchen)\b", "kitchen"),
    (r"(?i)\b(bedroom|in bed)\b", "bedroom"),
    (r"(?i)\b(living room|couch|sofa)\b", "living room"),
    (r"(?i)\b(bathroom|shower|bath)\b", "bathroom"),
    (r"(?i)\b(office|desk at work)\b", "office"),
    (r"(?i)\b(library)\b", "library"),
    (r"(?i)\b(gym)\b", "gym"),
    (r"(?i)\b(forest|woods)\b", "forest"),
    (r"(?i)\b(street|sidewalk|downtown)\b", "city street"),
    (r"(?i)\b(car|driving)\b", "inside a car"),
    (r"(?i)\b(bar|pub|club)\b", "bar"),
];

const POSES: &[(&str, &str)] = &[
    (r"(?i)\b(sit(s|ting)?|sat down|seated)\b", "sitting"),
    (r"(?i)\b(l(ie|ies|ying|ay) down|lying)\b", "lying down"),
    (r"(?i)\b(walk(s|ed|ing)?|stroll(s|ed|ing)?)\b", "walking"),
    (r"(?i)\b(run(s|ning)?|jog(s|ged|ging)?)\b", "running"),
    (r"(?i)\b(danc(e|es|ed|ing))\b", "dancing"),
    (r"(?i)\b(lean(s|ed|ing)?)\b", "leaning"),
];

#[allow(clippy::expect_used)]
static CLOTHING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:wearing|wears|put on|puts on|changed into|changes into|dressed in|slipped into)\s+(?:a |an |my |her |his |some |the )?([a-z][a-z \-]{2,40})",
    )
    .expect("valid regex")
});

struct KeywordTable {
    rules: Vec<(Regex, &'static str)>,
}

impl KeywordTable {
    fn compile(entries: &[(&str, &'static str)]) -> Self {
        let rules = entries
            .iter()
            .filter_map(|(pattern, value)| Regex::new(pattern).ok().map(|re| (re, *value)))
            .collect();
        Self { rules }
    }

    /// Value of the rule whose match appears last in the text.
    fn latest_match(&self, text: &str) -> Option<&'static str> {
        self.rules
            .iter()
            .filter_map(|(re, value)| re.find_iter(text).last().map(|m| (m.start(), *value)))
            .max_by_key(|(position, _)| *position)
            .map(|(_, value)| value)
    }
}

static EMOTION_TABLE: LazyLock<KeywordTable> = LazyLock::new(|| KeywordTable::compile(EMOTIONS));
static LOCATION_TABLE: LazyLock<KeywordTable> =
    LazyLock::new(|| KeywordTable::compile(LOCATIONS));
static POSE_TABLE: LazyLock<KeywordTable> = LazyLock::new(|| KeywordTable::compile(POSES));

/// Words that end a clothing phrase ("wearing a red coat and smiling").
const CLOTHING_STOP_WORDS: &[&str] = &["and", "while", "with", "as", "because", "then", "to"];

fn clothing_phrase(text: &str) -> Option<String> {
    let captures = CLOTHING_RE.captures_iter(text).last()?;
    let raw = captures.get(1)?.as_str();
    let words: Vec<&str> = raw
        .split_whitespace()
        .take_while(|word| !CLOTHING_STOP_WORDS.contains(&word.to_ascii_lowercase().as_str()))
        .take(4)
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" ").to_lowercase())
    }
}

/// Scan text for keyword cues. Detected fields are flagged changed.
pub fn extract(text: &str) -> VisualDelta {
    let mut delta = VisualDelta::empty(ExtractionSource::Heuristic);
    if let Some(expression) = EMOTION_TABLE.latest_match(text) {
        delta.set(VisualField::Expression, expression, true);
    }
    if let Some(clothing) = clothing_phrase(text) {
        delta.set(VisualField::Clothing, clothing, true);
    }
    if let Some(location) = LOCATION_TABLE.latest_match(text) {
        delta.set(VisualField::Location, location, true);
    }
    if let Some(pose) = POSE_TABLE.latest_match(text) {
        delta.set(VisualField::Pose, pose, true);
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visual::Confidence;

    #[test]
    fn detects_emotion_clothing_and_location() {
        let delta = extract("*giggles* I changed into a red summer dress and headed to the beach");
        assert_eq!(delta.source, ExtractionSource::Heuristic);
        assert_eq!(delta.confidence, Confidence::Low);
        assert_eq!(delta.fields[&VisualField::Expression].value, "laughing");
        assert_eq!(delta.fields[&VisualField::Clothing].value, "red summer dress");
        assert_eq!(delta.fields[&VisualField::Location].value, "beach");
        assert!(!delta.visual_update_needed);
        assert_eq!(delta.context_significance, 0);
    }

    #[test]
    fn later_cue_wins() {
        let delta = extract("I was at the park earlier, now I'm in the kitchen");
        assert_eq!(delta.fields[&VisualField::Location].value, "kitchen");
    }

    #[test]
    fn plain_text_yields_nothing() {
        let delta = extract("What do you think about that?");
        assert!(delta.fields.is_empty());
    }
}
