//! Tag-list normalization for image prompts.
//!
//! A tag list is a deduplicated, comma-separated, lowercase token sequence.

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_TAGS: usize = 48;
pub const DEFAULT_MAX_TAG_CHARS: usize = 48;

/// Canonicalize free text into a tag list.
///
/// Splits on commas, semicolons, newlines and sentence ends; strips prompt
/// weighting syntax; lowercases; collapses whitespace; drops duplicates while
/// keeping first-seen order. Tags longer than `max_tag_chars` are shortened at a
/// word boundary, and at most `max_tags` tags are returned.
pub fn normalize_tags(text: &str, max_tags: usize, max_tag_chars: usize) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for raw in fragments(text).split(',') {
        if tags.len() >= max_tags {
            break;
        }
        let Some(tag) = normalize_tag(raw, max_tag_chars) else {
            continue;
        };
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

/// Rewrites every separator to a comma. A `.` followed by a digit is part of a
/// weight such as `1.3` and is kept.
fn fragments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ';' | '\n' | '|' => out.push(','),
            '.' | '!' | '?' if !chars.peek().is_some_and(|next| next.is_ascii_digit()) => {
                out.push(',')
            }
            _ => out.push(c),
        }
    }
    out
}

fn normalize_tag(raw: &str, max_chars: usize) -> Option<String> {
    let stripped = strip_weight(raw);
    let collapsed = stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let trimmed = collapsed.trim_matches(|c: char| !c.is_alphanumeric());
    if trimmed.is_empty() {
        return None;
    }
    Some(bound_length(trimmed, max_chars))
}

/// Removes `(` `)` `[` `]` `{` `}` and a trailing `:1.2` style weight.
fn strip_weight(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '(' | ')' | '[' | ']' | '{' | '}' | '"'))
        .collect();
    match cleaned.rsplit_once(':') {
        Some((head, weight))
            if !weight.trim().is_empty()
                && weight.trim().chars().all(|c| c.is_ascii_digit() || c == '.') =>
        {
            head.to_string()
        }
        _ => cleaned,
    }
}

fn bound_length(tag: &str, max_chars: usize) -> String {
    if tag.chars().count() <= max_chars {
        return tag.to_string();
    }
    let mut out = String::new();
    for word in tag.split(' ') {
        let needed = if out.is_empty() { word.chars().count() } else { word.chars().count() + 1 };
        if out.chars().count() + needed > max_chars {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    if out.is_empty() {
        tag.chars().take(max_chars).collect()
    } else {
        out
    }
}

pub fn join_tags<S: AsRef<str>>(tags: &[S]) -> String {
    tags.iter()
        .map(|tag| tag.as_ref())
        .collect::<Vec<_>>()
        .join(", ")
}

/// An ordered, deduplicated tag list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(Vec<String>);

impl TagSet {
    pub fn from_text(text: &str) -> Self {
        Self(normalize_tags(text, DEFAULT_MAX_TAGS, DEFAULT_MAX_TAG_CHARS))
    }

    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for tag in tags {
            set.extend_from_text(tag.as_ref());
        }
        set
    }

    pub fn extend_from_text(&mut self, text: &str) {
        for tag in normalize_tags(text, DEFAULT_MAX_TAGS, DEFAULT_MAX_TAG_CHARS) {
            if self.0.len() >= DEFAULT_MAX_TAGS {
                break;
            }
            if !self.0.contains(&tag) {
                self.0.push(tag);
            }
        }
    }

    pub fn tags(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t == tag)
    }

    pub fn retain<F: FnMut(&String) -> bool>(&mut self, f: F) {
        self.0.retain(f);
    }

    pub fn to_prompt(&self) -> String {
        join_tags(&self.0)
    }
}
