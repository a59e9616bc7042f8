use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{tail, Store};
use crate::character_card::CharacterProfile;
use crate::conversation::{ChatMessage, ConversationState, Role};
use crate::scene::ScenePromptRecord;
use crate::schedule::{InitiativeEvent, ScheduleDefinition};
use crate::visual::CharacterVisualState;

#[derive(Default)]
struct Tables {
    conversations: HashMap<String, ConversationState>,
    characters: HashMap<String, CharacterProfile>,
    messages: Vec<ChatMessage>,
    visual_states: Vec<CharacterVisualState>,
    schedules: Vec<ScheduleDefinition>,
    initiative_events: Vec<InitiativeEvent>,
    scene_prompts: Vec<ScenePromptRecord>,
}

/// Process-local store for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))
    }
}

impl Store for InMemoryStore {
    fn get_conversation(&self, conversation_id: &str) -> Result<Option<ConversationState>> {
        Ok(self.lock()?.conversations.get(conversation_id).cloned())
    }

    fn put_conversation(&self, state: &ConversationState) -> Result<()> {
        self.lock()?
            .conversations
            .insert(state.id.clone(), state.clone());
        Ok(())
    }

    fn list_conversations(&self) -> Result<Vec<ConversationState>> {
        let mut all: Vec<_> = self.lock()?.conversations.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    fn get_character(&self, character_id: &str) -> Result<Option<CharacterProfile>> {
        Ok(self.lock()?.characters.get(character_id).cloned())
    }

    fn put_character(&self, profile: &CharacterProfile) -> Result<()> {
        self.lock()?
            .characters
            .insert(profile.id.clone(), profile.clone());
        Ok(())
    }

    fn append_message(&self, message: &ChatMessage) -> Result<()> {
        self.lock()?.messages.push(message.clone());
        Ok(())
    }

    fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let tables = self.lock()?;
        let history = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        Ok(tail(history, limit))
    }

    fn unprocessed_user_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        Ok(self
            .lock()?
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id && m.role == Role::User && !m.processed)
            .cloned()
            .collect())
    }

    fn mark_messages_processed(&self, message_ids: &[String]) -> Result<()> {
        let mut tables = self.lock()?;
        for message in tables.messages.iter_mut() {
            if message_ids.contains(&message.id) {
                message.processed = true;
            }
        }
        Ok(())
    }

    fn latest_visual_state(&self, conversation_id: &str) -> Result<Option<CharacterVisualState>> {
        Ok(self
            .lock()?
            .visual_states
            .iter()
            .rev()
            .find(|s| s.conversation_id == conversation_id)
            .cloned())
    }

    fn append_visual_state(&self, state: &CharacterVisualState) -> Result<()> {
        self.lock()?.visual_states.push(state.clone());
        Ok(())
    }

    fn visual_state_count(&self, conversation_id: &str) -> Result<usize> {
        Ok(self
            .lock()?
            .visual_states
            .iter()
            .filter(|s| s.conversation_id == conversation_id)
            .count())
    }

    fn put_schedule(&self, schedule: &ScheduleDefinition) -> Result<()> {
        let mut tables = self.lock()?;
        tables.schedules.retain(|s| s.id != schedule.id);
        tables.schedules.push(schedule.clone());
        Ok(())
    }

    fn schedules_for_character(&self, character_id: &str) -> Result<Vec<ScheduleDefinition>> {
        Ok(self
            .lock()?
            .schedules
            .iter()
            .filter(|s| s.character_id == character_id)
            .cloned()
            .collect())
    }

    fn set_schedule_active(&self, schedule_id: &str, active: bool) -> Result<bool> {
        let mut tables = self.lock()?;
        match tables.schedules.iter_mut().find(|s| s.id == schedule_id) {
            Some(schedule) => {
                schedule.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn record_initiative_event(&self, event: &InitiativeEvent) -> Result<()> {
        self.lock()?.initiative_events.push(event.clone());
        Ok(())
    }

    fn last_initiative_events(&self, conversation_id: &str) -> Result<HashMap<String, DateTime<Utc>>> {
        let tables = self.lock()?;
        let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
        for event in tables
            .initiative_events
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
        {
            let entry = latest.entry(event.schedule_id.clone()).or_insert(event.fired_at);
            if event.fired_at > *entry {
                *entry = event.fired_at;
            }
        }
        Ok(latest)
    }

    fn prune_initiative_events(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.lock()?;
        let original = tables.initiative_events.len();
        tables.initiative_events.retain(|e| e.fired_at >= before);
        Ok(original - tables.initiative_events.len())
    }

    fn append_scene_prompt(&self, record: &ScenePromptRecord) -> Result<()> {
        self.lock()?.scene_prompts.push(record.clone());
        Ok(())
    }

    fn scene_prompts(&self, conversation_id: &str, limit: usize) -> Result<Vec<ScenePromptRecord>> {
        let tables = self.lock()?;
        let records = tables
            .scene_prompts
            .iter()
            .filter(|r| r.conversation_id == conversation_id)
            .cloned()
            .collect();
        Ok(tail(records, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn unprocessed_messages_clear_after_marking() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let first = ChatMessage::user("c1", "hello", now);
        let reply = ChatMessage::character("c1", "hi", now);
        let second = ChatMessage::user("c1", "how are you", now + Duration::seconds(1));
        let other = ChatMessage::user("c2", "elsewhere", now);
        for message in [&first, &reply, &second, &other] {
            store.append_message(message).expect("append");
        }

        let pending = store.unprocessed_user_messages("c1").expect("pending");
        assert_eq!(pending.len(), 2);

        store
            .mark_messages_processed(&[first.id.clone()])
            .expect("mark");
        let pending = store.unprocessed_user_messages("c1").expect("pending");
        assert_eq!(pending, vec![second.clone()]);

        let recent = store.recent_messages("c1", 2).expect("recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].id, second.id);
    }

    #[test]
    fn initiative_events_report_latest_and_prune() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for minutes_ago in [120, 30, 90] {
            store
                .record_initiative_event(&InitiativeEvent {
                    schedule_id: "morning".to_string(),
                    conversation_id: "c1".to_string(),
                    fired_at: now - Duration::minutes(minutes_ago),
                })
                .expect("record");
        }

        let latest = store.last_initiative_events("c1").expect("latest");
        assert_eq!(latest.get("morning"), Some(&(now - Duration::minutes(30))));

        let pruned = store
            .prune_initiative_events(now - Duration::minutes(60))
            .expect("prune");
        assert_eq!(pruned, 2);
        assert!(store.last_initiative_events("c2").expect("other").is_empty());
    }
}
