//! Follow-up intent: does a reply imply the character steps away, or that
//! they will come back to the topic on their own?

use regex_lite::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};

use crate::config::{PresenceConfig, RetryConfig};
use crate::llm_client::{generate_with_retry, parse_json, CompletionOptions, Message, TextGenerator};

const INTENT_TEMPERATURE: f32 = 0.1;
const INTENT_MAX_TOKENS: u32 = 160;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUpIntent {
    None,
    StepAway { reason: String, minutes: i64 },
    FollowUp { minutes: i64, hint: Option<String> },
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    #[serde(default)]
    intent: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    minutes: Option<f64>,
    #[serde(default)]
    hint: Option<String>,
}

#[allow(clippy::expect_used)]
static BACK_IN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bback in (?:about |like |around )?(\d{1,3}|a few|a couple(?: of)?)\s*(minutes?|mins?|hours?|hrs?)\b")
        .expect("valid regex")
});

#[allow(clippy::expect_used)]
static BRB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:brb|be right back|give me a (?:minute|moment|sec|second)|hold on a (?:minute|moment|sec|second))\b")
        .expect("valid regex")
});

#[allow(clippy::expect_used)]
static ERRAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:i'?ll|i will|let me|i'?m going to|i'?m gonna|gonna)\s+(?:go\s+|quickly\s+|just\s+|run\s+and\s+)*(grab|get|make|fetch|take|answer)\s+(?:a\s+|an\s+|some\s+|my\s+|the\s+)?([a-z]+(?:\s+[a-z]+)?)",
    )
    .expect("valid regex")
});

#[allow(clippy::expect_used)]
static FOLLOW_UP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:i'?ll|let me|i will)\s+(?:think about (?:it|that)|check (?:on )?(?:it|that)|get back to you|find out|look into (?:it|that))")
        .expect("valid regex")
});

pub struct IntentClassifier {
    generator: Arc<dyn TextGenerator>,
    config: PresenceConfig,
    retry: RetryConfig,
}

impl IntentClassifier {
    pub fn new(generator: Arc<dyn TextGenerator>, config: PresenceConfig, retry: RetryConfig) -> Self {
        Self {
            generator,
            config,
            retry,
        }
    }

    pub async fn classify(&self, reply: &str) -> FollowUpIntent {
        if reply.trim().is_empty() {
            return FollowUpIntent::None;
        }
        let messages = vec![
            Message::system(
                "Classify whether a roleplay character's message implies a follow-up. \
                 Respond with JSON only: {\"intent\": \"none\" | \"step_away\" | \"follow_up\", \
                 \"reason\": \"short activity, e.g. get coffee\", \"minutes\": number, \
                 \"hint\": \"what the character will come back with\"}. \
                 Use step_away only when the character says they are leaving for a while. \
                 Use follow_up when they promise to come back to the topic without leaving.",
            ),
            Message::user(reply.to_string()),
        ];
        let options = CompletionOptions::new(INTENT_TEMPERATURE, INTENT_MAX_TOKENS);
        let decoded = match generate_with_retry(self.generator.as_ref(), messages, options, &self.retry).await {
            Ok(response) => parse_json::<IntentResponse>(&response, "follow-up intent"),
            Err(e) => Err(e),
        };
        match decoded {
            Ok(response) => self.from_response(response),
            Err(e) => {
                tracing::debug!("Intent classification fell back to patterns: {}", e);
                classify_heuristic(reply, &self.config)
            }
        }
    }

    fn from_response(&self, response: IntentResponse) -> FollowUpIntent {
        let minutes = response.minutes.map(|m| m.round() as i64);
        match response.intent.trim().to_ascii_lowercase().as_str() {
            "step_away" | "away" => FollowUpIntent::StepAway {
                reason: response
                    .reason
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "stepping away".to_string()),
                minutes: clamp_minutes(minutes.unwrap_or(self.config.default_away_minutes), &self.config),
            },
            "follow_up" | "followup" => FollowUpIntent::FollowUp {
                minutes: clamp_minutes(minutes.unwrap_or(self.config.default_follow_up_minutes), &self.config),
                hint: response.hint.filter(|h| !h.trim().is_empty()),
            },
            _ => FollowUpIntent::None,
        }
    }
}

fn clamp_minutes(minutes: i64, config: &PresenceConfig) -> i64 {
    minutes.clamp(1, config.max_away_minutes.max(1))
}

/// Pattern fallback for when the classifier is unavailable.
pub fn classify_heuristic(reply: &str, config: &PresenceConfig) -> FollowUpIntent {
    let back_in = BACK_IN_RE.captures(reply).map(|caps| {
        let amount = caps.get(1).map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default();
        let amount = amount.parse::<i64>().unwrap_or(if amount.starts_with("a couple") { 2 } else { 5 });
        let unit = caps.get(2).map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default();
        if unit.starts_with('h') {
            amount * 60
        } else {
            amount
        }
    });
    let errand = ERRAND_RE.captures(reply).and_then(|caps| {
        let verb = caps.get(1)?.as_str().to_ascii_lowercase();
        let object = caps.get(2)?.as_str().to_ascii_lowercase();
        Some(format!("{} {}", verb, object))
    });

    if back_in.is_some() || BRB_RE.is_match(reply) || errand.is_some() {
        return FollowUpIntent::StepAway {
            reason: errand.unwrap_or_else(|| "a quick break".to_string()),
            minutes: clamp_minutes(back_in.unwrap_or(config.default_away_minutes), config),
        };
    }
    if FOLLOW_UP_RE.is_match(reply) {
        return FollowUpIntent::FollowUp {
            minutes: clamp_minutes(config.default_follow_up_minutes, config),
            hint: None,
        };
    }
    FollowUpIntent::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedText;

    fn config() -> PresenceConfig {
        PresenceConfig::default()
    }

    #[test]
    fn patterns_detect_stepping_away() {
        assert_eq!(
            classify_heuristic("Hold on, I'll go grab a coffee. Back in 10 minutes!", &config()),
            FollowUpIntent::StepAway {
                reason: "grab coffee".to_string(),
                minutes: 10
            }
        );
        assert_eq!(
            classify_heuristic("brb", &config()),
            FollowUpIntent::StepAway {
                reason: "a quick break".to_string(),
                minutes: 15
            }
        );
        assert_eq!(
            classify_heuristic("Back in 9 hours, long shift.", &config()),
            FollowUpIntent::StepAway {
                reason: "a quick break".to_string(),
                minutes: 240
            }
        );
    }

    #[test]
    fn patterns_detect_follow_up_and_plain_replies() {
        assert_eq!(
            classify_heuristic("Hmm, let me think about it.", &config()),
            FollowUpIntent::FollowUp {
                minutes: 5,
                hint: None
            }
        );
        assert_eq!(classify_heuristic("That sounds lovely!", &config()), FollowUpIntent::None);
    }

    #[tokio::test]
    async fn ai_classification_is_clamped() {
        let generator = Arc::new(ScriptedText::new(vec![Ok(
            r#"{"intent": "step_away", "reason": "get coffee", "minutes": 900}"#.to_string(),
        )]));
        let classifier = IntentClassifier::new(generator, config(), RetryConfig::default());
        assert_eq!(
            classifier.classify("See you soon").await,
            FollowUpIntent::StepAway {
                reason: "get coffee".to_string(),
                minutes: 240
            }
        );
    }

    #[tokio::test]
    async fn unavailable_classifier_uses_patterns() {
        let generator = Arc::new(ScriptedText::new(vec![]));
        let classifier = IntentClassifier::new(generator, config(), RetryConfig::default());
        assert_eq!(
            classifier.classify("brb, back in 3 mins").await,
            FollowUpIntent::StepAway {
                reason: "a quick break".to_string(),
                minutes: 3
            }
        );
    }
}
