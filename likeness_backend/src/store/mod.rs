//! Storage interface shared by the in-memory store and the SQLite database.

pub mod memory;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::character_card::CharacterProfile;
use crate::conversation::{ChatMessage, ConversationState};
use crate::scene::ScenePromptRecord;
use crate::schedule::{InitiativeEvent, ScheduleDefinition};
use crate::visual::CharacterVisualState;

/// Persistence for everything the engine owns.
///
/// Calls are synchronous and short; callers serialize writes to one
/// conversation through [`crate::conversation::ConversationGate`].
pub trait Store: Send + Sync {
    // Conversations
    fn get_conversation(&self, conversation_id: &str) -> Result<Option<ConversationState>>;
    fn put_conversation(&self, state: &ConversationState) -> Result<()>;
    fn list_conversations(&self) -> Result<Vec<ConversationState>>;

    // Characters
    fn get_character(&self, character_id: &str) -> Result<Option<CharacterProfile>>;
    fn put_character(&self, profile: &CharacterProfile) -> Result<()>;

    // Chat history
    fn append_message(&self, message: &ChatMessage) -> Result<()>;
    /// Most recent `limit` messages, oldest first.
    fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>>;
    /// User messages the character has not answered yet, oldest first.
    fn unprocessed_user_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>>;
    fn mark_messages_processed(&self, message_ids: &[String]) -> Result<()>;

    // Visual snapshots
    fn latest_visual_state(&self, conversation_id: &str) -> Result<Option<CharacterVisualState>>;
    fn append_visual_state(&self, state: &CharacterVisualState) -> Result<()>;
    fn visual_state_count(&self, conversation_id: &str) -> Result<usize>;

    // Schedules
    fn put_schedule(&self, schedule: &ScheduleDefinition) -> Result<()>;
    fn schedules_for_character(&self, character_id: &str) -> Result<Vec<ScheduleDefinition>>;
    /// Returns false when the schedule does not exist.
    fn set_schedule_active(&self, schedule_id: &str, active: bool) -> Result<bool>;

    // Initiative events
    fn record_initiative_event(&self, event: &InitiativeEvent) -> Result<()>;
    /// Latest firing time per schedule id for one conversation.
    fn last_initiative_events(&self, conversation_id: &str) -> Result<HashMap<String, DateTime<Utc>>>;
    fn prune_initiative_events(&self, before: DateTime<Utc>) -> Result<usize>;

    // Scene prompt history
    fn append_scene_prompt(&self, record: &ScenePromptRecord) -> Result<()>;
    /// Most recent `limit` records, oldest first.
    fn scene_prompts(&self, conversation_id: &str, limit: usize) -> Result<Vec<ScenePromptRecord>>;
}

/// Keep only the last `limit` items of a chronological list.
pub(crate) fn tail<T>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    if items.len() > limit {
        items.drain(..items.len() - limit);
    }
    items
}
