use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{heuristic, merge, schema, CharacterVisualState, ExtractionSource, SceneTrigger, VisualField};
use crate::config::{ExtractionConfig, RetryConfig};
use crate::conversation::{ChatMessage, Role};
use crate::error::EngineResult;
use crate::llm_client::{generate_with_retry, CompletionOptions, Message, TextGenerator};

const ANALYSIS_MAX_TOKENS: u32 = 700;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionMeta {
    pub source: ExtractionSource,
    /// The snapshot warrants a new scene prompt.
    pub significant: bool,
    /// No new snapshot was created; `state` is the previous one.
    pub reused_previous: bool,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub state: CharacterVisualState,
    pub meta: ExtractionMeta,
}

/// Inputs for one extraction.
pub struct ExtractionInput<'a> {
    pub conversation_id: &'a str,
    pub history: &'a [ChatMessage],
    pub latest: &'a str,
    pub previous: Option<&'a CharacterVisualState>,
    pub trigger: SceneTrigger,
    /// Character card appearance, grounding the first snapshot.
    pub appearance: Option<&'a str>,
    pub at: DateTime<Utc>,
}

pub struct ContextExtractor {
    generator: Arc<dyn TextGenerator>,
    config: ExtractionConfig,
    retry: RetryConfig,
}

impl ContextExtractor {
    pub fn new(generator: Arc<dyn TextGenerator>, config: ExtractionConfig, retry: RetryConfig) -> Self {
        Self {
            generator,
            config,
            retry,
        }
    }

    fn temperature(&self, trigger: SceneTrigger) -> f32 {
        match trigger {
            SceneTrigger::Initial => self.config.initial_temperature,
            SceneTrigger::Evolution | SceneTrigger::Followup => self.config.evolution_temperature,
        }
    }

    /// Extract the character's current look. Never fails: AI problems fall
    /// back to the keyword heuristic, which never requests a new image.
    pub async fn extract(&self, input: ExtractionInput<'_>) -> ExtractionOutcome {
        let (delta, fallback_reason) = match self.analyse(&input).await {
            Ok(delta) => (delta, None),
            Err(e) => {
                tracing::warn!(
                    "Visual analysis for {} fell back to heuristic: {}",
                    input.conversation_id,
                    e
                );
                (heuristic::extract(input.latest), Some(e.to_string()))
            }
        };

        let merged = merge(input.previous, &delta, input.conversation_id, input.at);
        let significant = merged.is_significant(self.config.significance_threshold);

        let meta = ExtractionMeta {
            source: delta.source,
            significant,
            reused_previous: false,
            fallback_reason,
        };

        match input.previous {
            Some(previous) if !significant => {
                tracing::debug!(
                    "Turn in {} not visually significant ({}), keeping snapshot {}",
                    input.conversation_id,
                    merged.context_significance,
                    previous.id
                );
                ExtractionOutcome {
                    state: previous.clone(),
                    meta: ExtractionMeta {
                        reused_previous: true,
                        ..meta
                    },
                }
            }
            _ => {
                tracing::debug!(
                    "New visual snapshot for {}: changed {:?}",
                    input.conversation_id,
                    merged.changed_fields()
                );
                ExtractionOutcome {
                    state: merged,
                    meta,
                }
            }
        }
    }

    async fn analyse(&self, input: &ExtractionInput<'_>) -> EngineResult<super::VisualDelta> {
        let messages = build_analysis_messages(input);
        let options = CompletionOptions::new(self.temperature(input.trigger), ANALYSIS_MAX_TOKENS);
        let response = generate_with_retry(self.generator.as_ref(), messages, options, &self.retry).await?;
        schema::decode_analysis(&response)
    }

    pub fn history_limit(&self) -> usize {
        self.config.history_messages
    }
}

fn build_analysis_messages(input: &ExtractionInput<'_>) -> Vec<Message> {
    let field_list = VisualField::ALL
        .iter()
        .map(|field| field.key())
        .collect::<Vec<_>>()
        .join(", ");

    let system = format!(
        "You are a visual continuity analyst for an illustrated roleplay. \
         Track how the character looks in the latest moment of the story.\n\n\
         Respond with JSON only, using exactly this shape:\n\
         {{\n  \"visual_update_needed\": true/false,\n  \"context_significance\": 0-10,\n  \
         \"attributes\": {{\n    \"<field>\": {{\"value\": \"short tag phrase\", \"changed\": true/false}}\n  }}\n}}\n\n\
         Fields: {}.\n\
         Mark a field changed only when the latest message changes it. \
         Appearance fields (body_type, skin_tone, hair, eyes, face, distinguishing_features) \
         change only when the story explicitly says so. \
         The character is always an adult.",
        field_list
    );

    let mut user = String::new();
    if let Some(appearance) = input.appearance.filter(|a| !a.trim().is_empty()) {
        user.push_str(&format!("Character appearance: {}\n\n", appearance.trim()));
    }
    match input.previous {
        Some(previous) => {
            user.push_str("Previous visual state:\n");
            user.push_str(&previous.describe());
            user.push_str("\n\n");
        }
        None => user.push_str("There is no previous visual state; describe every field.\n\n"),
    }
    if !input.history.is_empty() {
        user.push_str("Recent conversation:\n");
        for message in input.history {
            let speaker = match message.role {
                Role::User => "User",
                Role::Character => "Character",
            };
            user.push_str(&format!("{}: {}\n", speaker, message.content));
        }
        user.push('\n');
    }
    user.push_str(&format!(
        "Latest message ({}):\n{}",
        input.trigger.as_str(),
        input.latest
    ));

    vec![Message::system(system), Message::user(user)]
}
