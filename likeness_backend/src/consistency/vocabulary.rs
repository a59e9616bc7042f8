//! Colour vocabularies and permanent-feature keywords.

use crate::tags::{normalize_tags, TagSet, DEFAULT_MAX_TAGS, DEFAULT_MAX_TAG_CHARS};
use crate::visual::{CharacterVisualState, VisualField};

pub const HAIR_COLOURS: &[&str] = &[
    "black", "brown", "blonde", "red", "auburn", "white", "silver", "grey", "pink", "blue",
    "green", "purple", "orange",
];

pub const EYE_COLOURS: &[&str] = &[
    "blue", "green", "brown", "hazel", "grey", "amber", "red", "purple", "black", "golden",
];

/// Words that mark a tag as describing a permanent feature.
const PERMANENT_KEYWORDS: &[&str] = &[
    "hair", "eyes", "eye", "skin", "complexion", "build", "tall", "short", "petite", "slim",
    "slender", "athletic", "curvy", "muscular", "stocky", "freckles", "scar", "tattoo", "mole",
    "beard", "piercing", "face", "jaw", "cheekbones", "ears", "horns", "tail",
];

fn words(tag: &str) -> impl Iterator<Item = &str> {
    tag.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
}

fn canonical_colour(word: &str) -> &str {
    match word {
        "blond" => "blonde",
        "gray" => "grey",
        "gold" => "golden",
        other => other,
    }
}

fn colour_in(tags: &TagSet, noun: &str, palette: &[&'static str]) -> Option<&'static str> {
    tags.tags()
        .iter()
        .filter(|tag| words(tag).any(|w| w == noun))
        .find_map(|tag| {
            words(tag).find_map(|w| {
                let colour = canonical_colour(w);
                palette.iter().find(|c| **c == colour).copied()
            })
        })
}

pub fn hair_colour(locked: &TagSet) -> Option<&'static str> {
    colour_in(locked, "hair", HAIR_COLOURS)
}

pub fn eye_colour(locked: &TagSet) -> Option<&'static str> {
    colour_in(locked, "eyes", EYE_COLOURS)
}

/// Negative tags naming every hair and eye colour the character does not have.
pub fn opposing_colour_tags(locked: &TagSet) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(hair) = hair_colour(locked) {
        out.extend(
            HAIR_COLOURS
                .iter()
                .filter(|c| **c != hair)
                .map(|c| format!("{} hair", c)),
        );
    }
    if let Some(eyes) = eye_colour(locked) {
        out.extend(
            EYE_COLOURS
                .iter()
                .filter(|c| **c != eyes)
                .map(|c| format!("{} eyes", c)),
        );
    }
    out
}

pub fn is_permanent_feature(tag: &str) -> bool {
    words(tag).any(|w| PERMANENT_KEYWORDS.contains(&w))
}

/// Locked attributes without the text generator: permanent-feature tags from
/// the character description, then the snapshot's appearance fields.
pub fn heuristic_locked(appearance: &str, state: Option<&CharacterVisualState>) -> TagSet {
    let mut locked = TagSet::from_tags(
        normalize_tags(appearance, DEFAULT_MAX_TAGS, DEFAULT_MAX_TAG_CHARS)
            .into_iter()
            .filter(|tag| is_permanent_feature(tag)),
    );
    if let Some(state) = state {
        for field in VisualField::LOCKED {
            let value = state.value(field);
            if value != field.default_value() && value != "none" {
                locked.extend_from_text(value);
            }
        }
    }
    locked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_colours_and_their_opposites() {
        let locked = TagSet::from_text("long blond hair, gray eyes, freckles");
        assert_eq!(hair_colour(&locked), Some("blonde"));
        assert_eq!(eye_colour(&locked), Some("grey"));

        let negatives = opposing_colour_tags(&locked);
        assert!(negatives.contains(&"black hair".to_string()));
        assert!(negatives.contains(&"blue eyes".to_string()));
        assert!(!negatives.contains(&"blonde hair".to_string()));
        assert!(!negatives.contains(&"grey eyes".to_string()));
        assert_eq!(negatives.len(), HAIR_COLOURS.len() - 1 + EYE_COLOURS.len() - 1);
    }

    #[test]
    fn heuristic_keeps_only_permanent_features() {
        let locked = heuristic_locked(
            "A tall woman with long black hair and green eyes. She wears a leather jacket, \
             loves coffee, and has a small scar on her cheek.",
            None,
        );
        assert!(locked.tags().iter().all(|tag| is_permanent_feature(tag)));
        assert!(locked.tags().iter().any(|tag| tag.contains("scar")));
        assert!(!locked.tags().iter().any(|tag| tag.contains("coffee")));
    }
}
