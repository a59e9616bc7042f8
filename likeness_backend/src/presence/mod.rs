//! Presence state machine: replies, stepping away, returning, follow-ups and
//! initiative messages. Every flow runs inside the conversation's generation
//! slot so at most one of them produces text at a time.

pub mod intent;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::character_card::{character_to_system_prompt, CharacterProfile};
use crate::config::{EngineConfig, PresenceConfig, RetryConfig};
use crate::conversation::{ChatMessage, Commit, ConversationGate, ConversationState, Presence, Role, StateEdit};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventSink, MessageOrigin};
use crate::jobs::{Job, JobScheduler};
use crate::llm_client::{generate_with_retry, strip_reasoning, CompletionOptions, Message, TextGenerator};
use crate::scene::{ScenePipeline, SceneTrigger};
use crate::schedule::{InitiativeEvent, ScheduleDefinition};

use self::intent::{FollowUpIntent, IntentClassifier};

/// Delay before a Return that found the conversation busy tries again.
const BUSY_RETURN_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ReplySettings {
    pub presence: PresenceConfig,
    pub retry: RetryConfig,
    pub temperature: f32,
    pub max_tokens: u32,
    pub history_messages: usize,
    pub fallback_reply: String,
}

impl ReplySettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            presence: config.presence.clone(),
            retry: config.retry.clone(),
            temperature: config.llm.reply_temperature,
            max_tokens: config.llm.max_tokens,
            history_messages: config.extraction.history_messages,
            fallback_reply: config.fallback_reply.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Replied(usize),
    /// The character is away; the message waits for the return.
    Deferred,
    /// Another generation owns the conversation and will pick the message up.
    Busy,
}

pub struct PresenceCoordinator {
    gate: Arc<ConversationGate>,
    generator: Arc<dyn TextGenerator>,
    scene: Arc<ScenePipeline>,
    jobs: Arc<dyn JobScheduler>,
    events: EventSink,
    classifier: IntentClassifier,
    settings: ReplySettings,
}

impl PresenceCoordinator {
    pub fn new(
        gate: Arc<ConversationGate>,
        generator: Arc<dyn TextGenerator>,
        scene: Arc<ScenePipeline>,
        jobs: Arc<dyn JobScheduler>,
        events: EventSink,
        settings: ReplySettings,
    ) -> Self {
        let classifier = IntentClassifier::new(generator.clone(), settings.presence.clone(), settings.retry.clone());
        Self {
            gate,
            generator,
            scene,
            jobs,
            events,
            classifier,
            settings,
        }
    }

    /// Persist an inbound message and reply unless the character is away.
    pub async fn on_user_message(&self, conversation_id: &str, content: &str, at: DateTime<Utc>) -> Result<TurnOutcome> {
        let state = self
            .gate
            .update(conversation_id, |state| {
                state.activity_version += 1;
                state.clone()
            })
            .await?;
        self.gate
            .store()
            .append_message(&ChatMessage::user(conversation_id, content, at))?;

        if let Presence::Away { reason, return_at, .. } = &state.presence {
            tracing::debug!(
                "{} is away ({}) until {}, deferring reply",
                conversation_id,
                reason,
                return_at
            );
            return Ok(TurnOutcome::Deferred);
        }
        self.drain_replies(conversation_id).await
    }

    /// Answer unprocessed user messages, a bounded number of rounds.
    pub async fn drain_replies(&self, conversation_id: &str) -> Result<TurnOutcome> {
        let mut replies = 0;
        for _ in 0..self.settings.presence.max_drain_rounds.max(1) {
            let turn = self
                .gate
                .run_generation(
                    conversation_id,
                    |state| !state.presence.is_away(),
                    |state| self.reply_turn(state),
                )
                .await?;
            match turn {
                None if replies == 0 => {
                    let state = self.gate.load(conversation_id)?;
                    return Ok(if state.presence.is_away() {
                        TurnOutcome::Deferred
                    } else {
                        TurnOutcome::Busy
                    });
                }
                None => break,
                Some(sent) => {
                    if sent {
                        replies += 1;
                    }
                    let state = self.gate.load(conversation_id)?;
                    if state.presence.is_away() {
                        self.emit_presence(&state);
                        break;
                    }
                    if self.gate.store().unprocessed_user_messages(conversation_id)?.is_empty() {
                        break;
                    }
                }
            }
        }
        Ok(TurnOutcome::Replied(replies))
    }

    async fn reply_turn(&self, state: ConversationState) -> Result<Commit<bool>> {
        let store = self.gate.store();
        let pending = store.unprocessed_user_messages(&state.id)?;
        if pending.is_empty() {
            return Ok(Commit::new(false));
        }
        let profile = self.profile(&state)?;
        let history = store.recent_messages(&state.id, self.settings.history_messages)?;

        let (text, origin) = match self.compose(&profile, &history, None).await {
            Some(text) => (text, MessageOrigin::Reply),
            None => (self.settings.fallback_reply.clone(), MessageOrigin::Fallback),
        };
        let message = self.deliver(&state.id, &text, origin)?;
        store.mark_messages_processed(&pending.iter().map(|m| m.id.clone()).collect::<Vec<_>>())?;

        self.scene
            .on_new_content(&state.id, &text, message.created_at, SceneTrigger::Evolution)
            .await;

        if origin == MessageOrigin::Fallback {
            return Ok(Commit::new(true));
        }
        let edit = self.plan_follow_up(&state, &text).await;
        Ok(Commit { value: true, edit })
    }

    /// Classify the message and schedule what it implies. Stepping away
    /// schedules the Return first; if that fails the character stays present.
    async fn plan_follow_up(&self, state: &ConversationState, text: &str) -> StateEdit {
        match self.classifier.classify(text).await {
            FollowUpIntent::None => Box::new(|_| {}),
            FollowUpIntent::StepAway { reason, minutes } => {
                let since = Utc::now();
                let return_at = since + chrono::Duration::minutes(minutes);
                let job = Job::PresenceReturn {
                    conversation_id: state.id.clone(),
                    return_at,
                };
                if let Err(e) = self.jobs.schedule_after(minutes_to_duration(minutes), job) {
                    tracing::warn!("Could not schedule return for {}, staying present: {}", state.id, e);
                    return Box::new(|_| {});
                }
                tracing::info!("{} steps away ({}) for {} min", state.id, reason, minutes);
                let id = state.id.clone();
                Box::new(move |state| {
                    if state.presence == Presence::Present {
                        state.presence = Presence::Away {
                            since,
                            reason,
                            return_at,
                        };
                    } else {
                        tracing::error!(
                            "{}: away transition from non-present state",
                            EngineError::ConcurrencyConflict(id)
                        );
                    }
                })
            }
            FollowUpIntent::FollowUp { minutes, hint } => {
                let job = Job::FollowUp {
                    conversation_id: state.id.clone(),
                    activity_version: state.activity_version,
                    hint,
                };
                match self.jobs.schedule_after(minutes_to_duration(minutes), job) {
                    Ok(()) => tracing::debug!("Follow-up for {} in {} min", state.id, minutes),
                    Err(e) => tracing::warn!("Could not schedule follow-up for {}: {}", state.id, e),
                }
                Box::new(|_| {})
            }
        }
    }

    /// Scheduled return. Stale unless the conversation is still away until
    /// exactly `return_at`.
    pub async fn on_return(&self, conversation_id: &str, return_at: DateTime<Utc>) -> Result<()> {
        let state = self.gate.load(conversation_id)?;
        if state.presence.return_at() != Some(return_at) {
            tracing::debug!("Stale return for {} ignored", conversation_id);
            return Ok(());
        }

        let result = self
            .gate
            .run_generation(
                conversation_id,
                |state| state.presence.return_at() == Some(return_at),
                |state| self.return_turn(state, return_at),
            )
            .await;

        match result {
            Ok(Some(())) => {
                tracing::info!("{} is back", conversation_id);
                self.emit_presence(&self.gate.load(conversation_id)?);
                self.answer_queued(conversation_id).await;
                Ok(())
            }
            Ok(None) => {
                if self.gate.load(conversation_id)?.presence.return_at() == Some(return_at) {
                    tracing::debug!("{} busy at return time, retrying later", conversation_id);
                    self.jobs.schedule_after(
                        BUSY_RETURN_RETRY,
                        Job::PresenceReturn {
                            conversation_id: conversation_id.to_string(),
                            return_at,
                        },
                    )?;
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Return for {} failed, forcing present: {:#}", conversation_id, e);
                let forced = self
                    .gate
                    .update(conversation_id, |state| {
                        let matches = state.presence.return_at() == Some(return_at);
                        if matches {
                            state.presence = Presence::Present;
                        }
                        matches
                    })
                    .await?;
                if forced {
                    self.emit_presence(&self.gate.load(conversation_id)?);
                    self.answer_queued(conversation_id).await;
                }
                Ok(())
            }
        }
    }

    async fn return_turn(&self, state: ConversationState, return_at: DateTime<Utc>) -> Result<Commit<()>> {
        let Presence::Away { reason, .. } = &state.presence else {
            anyhow::bail!("{} is not away", state.id);
        };
        let store = self.gate.store();
        let pending = store.unprocessed_user_messages(&state.id)?;
        let profile = self.profile(&state)?;
        let history = store.recent_messages(&state.id, self.settings.history_messages)?;

        let (instruction, fallback) = match pending.last() {
            Some(latest) => (
                format!(
                    "You just came back from being away ({}). While you were gone the user wrote to you. \
                     Reply once, addressing their most recent message: \"{}\"",
                    reason, latest.content
                ),
                self.settings.fallback_reply.clone(),
            ),
            None => (
                format!(
                    "You just came back from being away ({}). Let the user know you are back \
                     and mention briefly what you were doing.",
                    reason
                ),
                format!("I'm back! Sorry about the wait ({}).", reason),
            ),
        };

        let (text, origin) = match self.compose(&profile, &history, Some(&instruction)).await {
            Some(text) => (text, MessageOrigin::Return),
            None => (fallback, MessageOrigin::Fallback),
        };
        let message = self.deliver(&state.id, &text, origin)?;
        if !pending.is_empty() {
            store.mark_messages_processed(&pending.iter().map(|m| m.id.clone()).collect::<Vec<_>>())?;
        }
        self.scene
            .on_new_content(&state.id, &text, message.created_at, SceneTrigger::Evolution)
            .await;

        Ok(Commit::with_edit((), move |state| {
            if state.presence.return_at() == Some(return_at) {
                state.presence = Presence::Present;
            }
        }))
    }

    /// Scheduled follow-up. A no-op once newer user activity exists.
    pub async fn on_follow_up(&self, conversation_id: &str, activity_version: u64, hint: Option<String>) -> Result<()> {
        let done = self
            .gate
            .run_generation(
                conversation_id,
                |state| !state.presence.is_away() && state.activity_version == activity_version,
                |state| self.follow_up_turn(state, hint),
            )
            .await?;
        match done {
            Some(()) => self.answer_queued(conversation_id).await,
            None => tracing::debug!("Follow-up for {} superseded", conversation_id),
        }
        Ok(())
    }

    async fn follow_up_turn(&self, state: ConversationState, hint: Option<String>) -> Result<Commit<()>> {
        let profile = self.profile(&state)?;
        let history = self
            .gate
            .store()
            .recent_messages(&state.id, self.settings.history_messages)?;
        let mut instruction =
            "Some time has passed and the user has not replied. Continue the conversation on your own, briefly."
                .to_string();
        if let Some(hint) = hint.as_deref() {
            instruction.push_str(&format!(" You wanted to come back to: {}", hint));
        }

        let Some(text) = self.compose(&profile, &history, Some(&instruction)).await else {
            tracing::warn!("Follow-up for {} skipped, generation failed", state.id);
            return Ok(Commit::new(()));
        };
        let message = self.deliver(&state.id, &text, MessageOrigin::FollowUp)?;
        self.scene
            .on_new_content(&state.id, &text, message.created_at, SceneTrigger::Followup)
            .await;
        Ok(Commit::new(()))
    }

    /// Send an unprompted message for `schedule`. Returns false when the
    /// conversation is away or busy.
    pub async fn fire_initiative(&self, conversation_id: &str, schedule: &ScheduleDefinition) -> Result<bool> {
        let fired = self
            .gate
            .run_generation(
                conversation_id,
                |state| !state.presence.is_away(),
                |state| self.initiative_turn(state, schedule),
            )
            .await?;
        if fired.is_some() {
            let state = self.gate.load(conversation_id)?;
            if state.presence.is_away() {
                self.emit_presence(&state);
            }
            self.answer_queued(conversation_id).await;
        }
        Ok(fired.is_some())
    }

    async fn initiative_turn(&self, state: ConversationState, schedule: &ScheduleDefinition) -> Result<Commit<()>> {
        let store = self.gate.store();
        store.record_initiative_event(&InitiativeEvent {
            schedule_id: schedule.id.clone(),
            conversation_id: state.id.clone(),
            fired_at: Utc::now(),
        })?;
        tracing::info!("Initiative {} fired for {}", schedule.id, state.id);

        let profile = self.profile(&state)?;
        let history = store.recent_messages(&state.id, self.settings.history_messages)?;
        let instruction = format!(
            "Write a new message to the user on your own, without being prompted. {}",
            schedule
                .message_hint
                .as_deref()
                .unwrap_or("Check in naturally, as you would with a friend.")
        );

        let Some(text) = self.compose(&profile, &history, Some(&instruction)).await else {
            tracing::warn!("Initiative {} for {} produced no message", schedule.id, state.id);
            return Ok(Commit::new(()));
        };
        let message = self.deliver(&state.id, &text, MessageOrigin::Initiative)?;
        self.scene
            .on_new_content(&state.id, &text, message.created_at, SceneTrigger::Evolution)
            .await;
        let edit = self.plan_follow_up(&state, &text).await;
        Ok(Commit { value: (), edit })
    }

    /// Reply to user messages that arrived while another flow held the slot
    /// (those callers saw `Busy` or `Deferred`). Runs after the slot is released.
    async fn answer_queued(&self, conversation_id: &str) {
        let queued = match self.gate.store().unprocessed_user_messages(conversation_id) {
            Ok(queued) => queued.len(),
            Err(e) => {
                tracing::warn!("Could not check queued messages for {}: {:#}", conversation_id, e);
                return;
            }
        };
        if queued == 0 {
            return;
        }
        tracing::debug!("{} message(s) queued in {} during generation", queued, conversation_id);
        match self.drain_replies(conversation_id).await {
            Ok(outcome) => tracing::debug!("Queued messages in {}: {:?}", conversation_id, outcome),
            Err(e) => tracing::warn!("Answering queued messages in {} failed: {:#}", conversation_id, e),
        }
    }

    fn profile(&self, state: &ConversationState) -> Result<CharacterProfile> {
        self.gate
            .store()
            .get_character(&state.character_id)?
            .with_context(|| format!("Unknown character '{}'", state.character_id))
    }

    /// One in-character completion, `None` when every attempt failed.
    async fn compose(
        &self,
        profile: &CharacterProfile,
        history: &[ChatMessage],
        instruction: Option<&str>,
    ) -> Option<String> {
        let mut messages = vec![Message::system(character_to_system_prompt(profile))];
        for message in history {
            messages.push(match message.role {
                Role::User => Message::user(message.content.clone()),
                Role::Character => Message::assistant(message.content.clone()),
            });
        }
        if let Some(instruction) = instruction {
            messages.push(Message::system(instruction));
        }

        let options = CompletionOptions::new(self.settings.temperature, self.settings.max_tokens);
        match generate_with_retry(self.generator.as_ref(), messages, options, &self.settings.retry).await {
            Ok(response) => {
                let text = strip_reasoning(&response).trim().to_string();
                (!text.is_empty()).then_some(text)
            }
            Err(e) => {
                tracing::warn!("Reply generation for {} failed: {}", profile.name, e);
                None
            }
        }
    }

    fn deliver(&self, conversation_id: &str, text: &str, origin: MessageOrigin) -> Result<ChatMessage> {
        let message = ChatMessage::character(conversation_id, text, Utc::now());
        self.gate.store().append_message(&message)?;
        tracing::debug!("{:?} message sent in {}", origin, conversation_id);
        self.events.emit(EngineEvent::CharacterMessage {
            message: message.clone(),
            origin,
        });
        Ok(message)
    }

    fn emit_presence(&self, state: &ConversationState) {
        self.events.emit(EngineEvent::PresenceChanged {
            conversation_id: state.id.clone(),
            presence: state.presence.clone(),
        });
    }
}

fn minutes_to_duration(minutes: i64) -> Duration {
    Duration::from_secs(minutes.max(1).unsigned_abs() * 60)
}
