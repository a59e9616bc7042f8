//! Age-safety filter for image prompts.
//!
//! Any sentence or tag that mentions a minor is removed before the prompt is
//! budgeted. The prompt builder always adds `adult` afterwards.

use regex_lite::Regex;
use std::sync::LazyLock;

/// Used when filtering leaves nothing to describe.
pub const SAFE_DEFAULT_TAGS: &str = "portrait, simple background, soft lighting";

#[allow(clippy::expect_used)]
static MINOR_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(child|children|kid|kids|teen|teens|teenage|teenager|teenagers|minor|minors|underage|preteen|toddler|infant|baby|loli|lolita|shota|schoolgirl|schoolboy|young girl|young boy|little girl|little boy)\b",
    )
    .expect("valid regex")
});

pub fn mentions_minor(text: &str) -> bool {
    MINOR_TERMS.is_match(text)
}

/// Drop every sentence that mentions a minor.
pub fn strip_sentences(text: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut start = 0;
    for (index, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let end = index + c.len_utf8();
            let sentence = &text[start..end];
            if !mentions_minor(sentence) {
                kept.push(sentence);
            }
            start = end;
        }
    }
    let rest = &text[start..];
    if !mentions_minor(rest) {
        kept.push(rest);
    }
    kept.concat().trim().to_string()
}

/// Drop every tag that mentions a minor. Returns how many were removed.
pub fn strip_tags(tags: &mut Vec<String>) -> usize {
    let before = tags.len();
    tags.retain(|tag| !mentions_minor(tag));
    before - tags.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_whole_words_only() {
        assert!(mentions_minor("a Teenager at school"));
        assert!(mentions_minor("young girl"));
        assert!(!mentions_minor("kidney beans"));
        assert!(!mentions_minor("steen street"));
        assert!(!mentions_minor("adult woman"));
    }

    #[test]
    fn strips_offending_sentences() {
        let text = "She sits in a cafe. Kids play outside! She smiles warmly";
        assert_eq!(strip_sentences(text), "She sits in a cafe. She smiles warmly");
        assert_eq!(strip_sentences("A child waves."), "");
    }

    #[test]
    fn strips_offending_tags() {
        let mut tags = vec![
            "red dress".to_string(),
            "schoolgirl outfit".to_string(),
            "park".to_string(),
        ];
        assert_eq!(strip_tags(&mut tags), 1);
        assert_eq!(tags, vec!["red dress", "park"]);
    }
}
