//! Consistency-preserving image prompt assembly.
//!
//! Permanent features are derived once per conversation and rendered as a
//! weighted group that is identical across every build, so the character
//! keeps the same face while clothes, pose and location move around them.

pub mod safety;
pub mod vocabulary;

use rand::Rng;
use std::sync::Arc;

use crate::config::{ConsistencyConfig, RetryConfig};
use crate::llm_client::{generate_with_retry, strip_reasoning, CompletionOptions, Message, TextGenerator};
use crate::tags::{join_tags, normalize_tags, TagSet, DEFAULT_MAX_TAGS, DEFAULT_MAX_TAG_CHARS};
use crate::visual::{CharacterVisualState, SceneTrigger, VisualField};

pub const ADULT_TAG: &str = "adult";

const BASE_NEGATIVE: &str = "child, teen, underage, loli, shota, young, childlike, \
    lowres, bad anatomy, bad hands, extra fingers, missing fingers, deformed, blurry, \
    watermark, signature, text, jpeg artifacts";

const LOCKED_MAX_TOKENS: u32 = 200;

/// Values that carry no visual information.
const EMPTY_VALUES: &[&str] = &["none", "idle", "unknown", "n/a"];

pub struct BuildRequest<'a> {
    pub locked: &'a TagSet,
    pub dynamic: &'a CharacterVisualState,
    pub trigger: SceneTrigger,
    pub seed: u64,
    pub max_chars: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPrompt {
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: u64,
}

/// One random seed per conversation.
pub fn new_seed() -> u64 {
    u64::from(rand::rng().random::<u32>())
}

pub struct ConsistencyPromptBuilder {
    generator: Arc<dyn TextGenerator>,
    config: ConsistencyConfig,
    retry: RetryConfig,
}

impl ConsistencyPromptBuilder {
    pub fn new(generator: Arc<dyn TextGenerator>, config: ConsistencyConfig, retry: RetryConfig) -> Self {
        Self {
            generator,
            config,
            retry,
        }
    }

    pub fn max_prompt_chars(&self) -> usize {
        self.config.max_prompt_chars
    }

    /// Locked attributes for a conversation. Returns the cached set unless
    /// `force_refresh` is set; otherwise asks the text generator for permanent
    /// features only, falling back to the vocabulary heuristic.
    pub async fn locked_attributes(
        &self,
        cached: Option<&TagSet>,
        appearance: &str,
        state: Option<&CharacterVisualState>,
        force_refresh: bool,
    ) -> TagSet {
        if let Some(cached) = cached.filter(|c| !c.is_empty() && !force_refresh) {
            return cached.clone();
        }

        match self.derive_locked(appearance, state).await {
            Some(locked) => locked,
            None => {
                let locked = vocabulary::heuristic_locked(appearance, state);
                tracing::debug!("Locked attributes from heuristic: {}", locked.to_prompt());
                locked
            }
        }
    }

    async fn derive_locked(&self, appearance: &str, state: Option<&CharacterVisualState>) -> Option<TagSet> {
        let mut description = appearance.trim().to_string();
        if let Some(state) = state {
            for field in VisualField::LOCKED {
                description.push_str(&format!("\n{}: {}", field.key(), state.value(field)));
            }
        }
        if description.trim().is_empty() {
            return None;
        }

        let messages = vec![
            Message::system(
                "You extract permanent physical features of an adult character for an image \
                 generator. List ONLY features that never change: body type, skin tone, hair \
                 colour and style, eye colour, face shape, scars, tattoos and similar marks. \
                 Never include clothing, accessories, expression, pose, action or location. \
                 Reply with a single comma-separated list of short tags and nothing else.",
            ),
            Message::user(description),
        ];
        let options = CompletionOptions::new(self.config.locked_temperature, LOCKED_MAX_TOKENS);
        let response = match generate_with_retry(self.generator.as_ref(), messages, options, &self.retry).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Locked attribute derivation failed: {}", e);
                return None;
            }
        };

        let text = strip_reasoning(&response);
        let text = text
            .trim()
            .trim_start_matches("Tags:")
            .trim_start_matches("tags:");
        let mut tags = normalize_tags(safety::strip_sentences(text).as_str(), DEFAULT_MAX_TAGS, DEFAULT_MAX_TAG_CHARS);
        safety::strip_tags(&mut tags);
        tags.retain(|tag| tag != ADULT_TAG);
        let locked = TagSet::from_tags(tags);
        if locked.is_empty() {
            tracing::warn!("Locked attribute derivation returned no usable tags");
            return None;
        }
        tracing::debug!("Locked attributes derived: {}", locked.to_prompt());
        Some(locked)
    }

    pub fn build(&self, request: BuildRequest<'_>) -> BuiltPrompt {
        let budget = request.max_chars.max(ADULT_TAG.len());

        let mut locked: Vec<String> = request.locked.tags().to_vec();
        safety::strip_tags(&mut locked);
        locked.retain(|tag| tag != ADULT_TAG);

        let exclude: Vec<String> = locked.iter().cloned().chain([ADULT_TAG.to_string()]).collect();
        let group = |fields: &[VisualField]| -> Vec<String> {
            let mut tags = Vec::new();
            for field in fields {
                let value = request.dynamic.value(*field);
                if EMPTY_VALUES.contains(&value.trim().to_ascii_lowercase().as_str()) {
                    continue;
                }
                let cleaned = safety::strip_sentences(value);
                for tag in normalize_tags(&cleaned, DEFAULT_MAX_TAGS, DEFAULT_MAX_TAG_CHARS) {
                    if !tags.contains(&tag) && !exclude.contains(&tag) && !EMPTY_VALUES.contains(&tag.as_str()) {
                        tags.push(tag);
                    }
                }
            }
            safety::strip_tags(&mut tags);
            tags
        };

        let clothing = group(&[VisualField::Clothing, VisualField::Accessories, VisualField::Injuries]);
        let pose = group(&[VisualField::Action, VisualField::Pose, VisualField::Expression]);
        let location = group(&[VisualField::Location]);

        let mut quality = normalize_tags(&self.config.quality_prefix, DEFAULT_MAX_TAGS, DEFAULT_MAX_TAG_CHARS);
        safety::strip_tags(&mut quality);
        quality.retain(|tag| tag != ADULT_TAG);

        if locked.is_empty() && clothing.is_empty() && pose.is_empty() && location.is_empty() {
            tracing::warn!("Nothing left to describe after safety filtering, using safe default");
            quality.extend(normalize_tags(safety::SAFE_DEFAULT_TAGS, DEFAULT_MAX_TAGS, DEFAULT_MAX_TAG_CHARS));
        }

        let mut layout = PromptLayout {
            weight: self.config.locked_weight,
            ..PromptLayout::default()
        };

        // Locked group: whole tags drop from the end until it fits.
        for keep in (0..=locked.len()).rev() {
            layout.locked = locked[..keep].to_vec();
            if layout.render().chars().count() <= budget {
                break;
            }
        }
        if layout.locked.len() < locked.len() {
            tracing::warn!(
                "Prompt budget {} dropped {} locked tags",
                budget,
                locked.len() - layout.locked.len()
            );
        }

        for (slot, tags) in [
            (Slot::Quality, quality),
            (Slot::Clothing, clothing),
            (Slot::Pose, pose),
            (Slot::Location, location),
        ] {
            for tag in tags {
                layout.slot_mut(slot).push(tag);
                if layout.render().chars().count() > budget {
                    layout.slot_mut(slot).pop();
                }
            }
        }

        let prompt = layout.render();
        tracing::debug!(
            "Built {} prompt ({} chars, seed {})",
            request.trigger.as_str(),
            prompt.chars().count(),
            request.seed
        );

        BuiltPrompt {
            prompt,
            negative_prompt: negative_prompt(request.locked),
            seed: request.seed,
        }
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Quality,
    Clothing,
    Pose,
    Location,
}

#[derive(Default)]
struct PromptLayout {
    weight: f32,
    quality: Vec<String>,
    locked: Vec<String>,
    clothing: Vec<String>,
    pose: Vec<String>,
    location: Vec<String>,
}

impl PromptLayout {
    fn slot_mut(&mut self, slot: Slot) -> &mut Vec<String> {
        match slot {
            Slot::Quality => &mut self.quality,
            Slot::Clothing => &mut self.clothing,
            Slot::Pose => &mut self.pose,
            Slot::Location => &mut self.location,
        }
    }

    /// quality, adult, (locked:weight), clothing, pose, location
    fn render(&self) -> String {
        let mut parts: Vec<String> = self.quality.clone();
        parts.push(ADULT_TAG.to_string());
        if !self.locked.is_empty() {
            parts.push(format!("({}:{})", join_tags(&self.locked), self.weight));
        }
        parts.extend(self.clothing.iter().cloned());
        parts.extend(self.pose.iter().cloned());
        parts.extend(self.location.iter().cloned());
        join_tags(&parts)
    }
}

fn negative_prompt(locked: &TagSet) -> String {
    let mut negative = TagSet::from_text(BASE_NEGATIVE);
    for tag in vocabulary::opposing_colour_tags(locked) {
        negative.extend_from_text(&tag);
    }
    negative.to_prompt()
}
