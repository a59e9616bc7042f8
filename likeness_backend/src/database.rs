use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::character_card::CharacterProfile;
use crate::conversation::{ChatMessage, ConversationState, Role};
use crate::scene::ScenePromptRecord;
use crate::schedule::{InitiativeEvent, ScheduleDefinition};
use crate::store::Store;
use crate::visual::CharacterVisualState;

/// SQLite-backed [`Store`]. Structured values live in JSON columns; the
/// plain columns next to them exist for lookups and ordering.
pub struct EngineDatabase {
    conn: Mutex<Connection>,
}

impl EngineDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                character_id TEXT NOT NULL,
                state_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS characters (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                profile_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        // seq keeps insertion order for messages stored within the same instant.
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS chat_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0
            )"#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_conversation ON chat_messages(conversation_id, seq)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS visual_states (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                state_json TEXT NOT NULL,
                captured_at TEXT NOT NULL
            )"#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_visual_states_conversation ON visual_states(conversation_id, seq)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                character_id TEXT NOT NULL,
                definition_json TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS initiative_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                schedule_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                fired_at TEXT NOT NULL,
                fired_at_ms INTEGER NOT NULL
            )"#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_initiative_events_conversation ON initiative_events(conversation_id)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS scene_prompts (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                scene_version INTEGER NOT NULL,
                record_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        Ok(())
    }

    fn query_json<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<T>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| json_column(0, row.get::<_, String>(0)?))?
            .collect::<Result<Vec<T>, _>>()?;
        Ok(rows)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to encode JSON column")
}

fn json_column<T: DeserializeOwned>(index: usize, raw: String) -> rusqlite::Result<T> {
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

fn time_column(index: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: Role::from_db(&row.get::<_, String>(2)?),
        content: row.get(3)?,
        created_at: time_column(4, row.get(4)?)?,
        processed: row.get::<_, i64>(5)? != 0,
    })
}

impl Store for EngineDatabase {
    fn get_conversation(&self, conversation_id: &str) -> Result<Option<ConversationState>> {
        let conn = self.lock_conn()?;
        let state = conn
            .query_row(
                "SELECT state_json FROM conversations WHERE id = ?1",
                [conversation_id],
                |row| json_column(0, row.get(0)?),
            )
            .optional()?;
        Ok(state)
    }

    fn put_conversation(&self, state: &ConversationState) -> Result<()> {
        let json = to_json(state)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO conversations (id, character_id, state_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                character_id = excluded.character_id,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at",
            params![state.id, state.character_id, json, state.updated_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn list_conversations(&self) -> Result<Vec<ConversationState>> {
        self.query_json("SELECT state_json FROM conversations ORDER BY id ASC", [])
    }

    fn get_character(&self, character_id: &str) -> Result<Option<CharacterProfile>> {
        let conn = self.lock_conn()?;
        let profile = conn
            .query_row(
                "SELECT profile_json FROM characters WHERE id = ?1",
                [character_id],
                |row| json_column(0, row.get(0)?),
            )
            .optional()?;
        Ok(profile)
    }

    fn put_character(&self, profile: &CharacterProfile) -> Result<()> {
        let json = to_json(profile)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO characters (id, name, profile_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                profile_json = excluded.profile_json,
                updated_at = excluded.updated_at",
            params![profile.id, profile.name, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn append_message(&self, message: &ChatMessage) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO chat_messages (id, conversation_id, role, content, created_at, processed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id,
                message.conversation_id,
                message.role.as_db_str(),
                message.content,
                message.created_at.to_rfc3339(),
                message.processed as i64,
            ],
        )?;
        Ok(())
    }

    fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at, processed FROM chat_messages
             WHERE conversation_id = ?1
             ORDER BY seq DESC
             LIMIT ?2",
        )?;
        let messages = stmt
            .query_map(params![conversation_id, limit], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        // Reverse to get chronological order
        Ok(messages.into_iter().rev().collect())
    }

    fn unprocessed_user_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at, processed FROM chat_messages
             WHERE conversation_id = ?1 AND role = ?2 AND processed = 0
             ORDER BY seq ASC",
        )?;
        let messages = stmt
            .query_map(params![conversation_id, Role::User.as_db_str()], message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn mark_messages_processed(&self, message_ids: &[String]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        for id in message_ids {
            tx.execute("UPDATE chat_messages SET processed = 1 WHERE id = ?1", [id])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn latest_visual_state(&self, conversation_id: &str) -> Result<Option<CharacterVisualState>> {
        let conn = self.lock_conn()?;
        let state = conn
            .query_row(
                "SELECT state_json FROM visual_states WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT 1",
                [conversation_id],
                |row| json_column(0, row.get(0)?),
            )
            .optional()?;
        Ok(state)
    }

    fn append_visual_state(&self, state: &CharacterVisualState) -> Result<()> {
        let json = to_json(state)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO visual_states (id, conversation_id, state_json, captured_at) VALUES (?1, ?2, ?3, ?4)",
            params![state.id, state.conversation_id, json, state.captured_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn visual_state_count(&self, conversation_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM visual_states WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn put_schedule(&self, schedule: &ScheduleDefinition) -> Result<()> {
        let json = to_json(schedule)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO schedules (id, character_id, definition_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                character_id = excluded.character_id,
                definition_json = excluded.definition_json",
            params![schedule.id, schedule.character_id, json],
        )?;
        Ok(())
    }

    fn schedules_for_character(&self, character_id: &str) -> Result<Vec<ScheduleDefinition>> {
        self.query_json(
            "SELECT definition_json FROM schedules WHERE character_id = ?1 ORDER BY id ASC",
            [character_id],
        )
    }

    fn set_schedule_active(&self, schedule_id: &str, active: bool) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT definition_json FROM schedules WHERE id = ?1",
                [schedule_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = existing else {
            return Ok(false);
        };
        let mut schedule: ScheduleDefinition =
            serde_json::from_str(&raw).context("Failed to decode stored schedule")?;
        schedule.active = active;
        tx.execute(
            "UPDATE schedules SET definition_json = ?2 WHERE id = ?1",
            params![schedule_id, to_json(&schedule)?],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn record_initiative_event(&self, event: &InitiativeEvent) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO initiative_events (schedule_id, conversation_id, fired_at, fired_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.schedule_id,
                event.conversation_id,
                event.fired_at.to_rfc3339(),
                event.fired_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn last_initiative_events(&self, conversation_id: &str) -> Result<HashMap<String, DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT schedule_id, fired_at FROM initiative_events WHERE conversation_id = ?1",
        )?;
        let rows = stmt
            .query_map([conversation_id], |row| {
                Ok((row.get::<_, String>(0)?, time_column(1, row.get(1)?)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
        for (schedule_id, fired_at) in rows {
            let entry = latest.entry(schedule_id).or_insert(fired_at);
            if fired_at > *entry {
                *entry = fired_at;
            }
        }
        Ok(latest)
    }

    fn prune_initiative_events(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM initiative_events WHERE fired_at_ms < ?1",
            [before.timestamp_millis()],
        )?;
        Ok(removed)
    }

    fn append_scene_prompt(&self, record: &ScenePromptRecord) -> Result<()> {
        let json = to_json(record)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO scene_prompts (id, conversation_id, scene_version, record_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.conversation_id,
                record.scene_version as i64,
                json,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn scene_prompts(&self, conversation_id: &str, limit: usize) -> Result<Vec<ScenePromptRecord>> {
        let mut records: Vec<ScenePromptRecord> = self.query_json(
            "SELECT record_json FROM scene_prompts WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT ?2",
            params![conversation_id, limit],
        )?;
        records.reverse();
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Presence;
    use crate::scene::SceneTrigger;
    use crate::schedule::TriggerConditions;
    use crate::tags::TagSet;
    use crate::visual::{merge, ExtractionSource, VisualDelta, VisualField};
    use chrono::Duration;

    fn open(dir: &tempfile::TempDir) -> EngineDatabase {
        EngineDatabase::new(dir.path().join("likeness.db")).expect("db init")
    }

    #[test]
    fn conversation_state_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        let mut state = ConversationState::new("c1", "ch1");
        state.presence = Presence::Away {
            since: now,
            reason: "get coffee".to_string(),
            return_at: now + Duration::minutes(5),
        };
        state.locked_appearance = Some(TagSet::from_text("long black hair, green eyes"));
        state.seed = Some(42);
        state.scene_version = 3;
        {
            let db = open(&dir);
            db.put_conversation(&state).expect("put");
            state.generating = true;
            db.put_conversation(&state).expect("upsert");
        }

        let db = open(&dir);
        assert_eq!(db.get_conversation("c1").expect("get"), Some(state.clone()));
        assert_eq!(db.list_conversations().expect("list").len(), 1);
        assert_eq!(db.get_conversation("missing").expect("get"), None);
    }

    #[test]
    fn messages_keep_order_and_processed_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let at = Utc::now();
        let first = ChatMessage::user("c1", "hello", at);
        let reply = ChatMessage::character("c1", "hi!", at);
        let second = ChatMessage::user("c1", "how are you?", at);
        for message in [&first, &reply, &second] {
            db.append_message(message).expect("append");
        }
        db.append_message(&ChatMessage::user("c2", "elsewhere", at)).expect("append");

        let recent = db.recent_messages("c1", 2).expect("recent");
        assert_eq!(
            recent.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["hi!", "how are you?"]
        );
        assert_eq!(recent[0].role, Role::Character);

        let pending = db.unprocessed_user_messages("c1").expect("pending");
        assert_eq!(pending.len(), 2);
        db.mark_messages_processed(&[first.id.clone()]).expect("mark");
        let pending = db.unprocessed_user_messages("c1").expect("pending");
        assert_eq!(pending, vec![second]);
    }

    #[test]
    fn initiative_events_track_latest_and_prune() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let now = Utc::now();
        for (schedule, minutes_ago) in [("morning", 120), ("morning", 10), ("random", 300)] {
            db.record_initiative_event(&InitiativeEvent {
                schedule_id: schedule.to_string(),
                conversation_id: "c1".to_string(),
                fired_at: now - Duration::minutes(minutes_ago),
            })
            .expect("record");
        }

        let latest = db.last_initiative_events("c1").expect("latest");
        assert_eq!(latest.get("morning"), Some(&(now - Duration::minutes(10))));
        assert_eq!(latest.len(), 2);

        let removed = db
            .prune_initiative_events(now - Duration::minutes(60))
            .expect("prune");
        assert_eq!(removed, 2);
        let latest = db.last_initiative_events("c1").expect("latest");
        assert_eq!(latest.keys().collect::<Vec<_>>(), vec!["morning"]);
    }

    #[test]
    fn schedules_and_scene_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let schedule = ScheduleDefinition {
            id: "roll".to_string(),
            character_id: "ch1".to_string(),
            conditions: TriggerConditions::Random { probability: 0.25 },
            priority: 2,
            active: true,
            utc_offset_minutes: 60,
            message_hint: None,
        };
        db.put_schedule(&schedule).expect("put");
        assert!(db.set_schedule_active("roll", false).expect("toggle"));
        assert!(!db.set_schedule_active("missing", false).expect("toggle"));
        let stored = db.schedules_for_character("ch1").expect("schedules");
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].active);
        assert_eq!(stored[0].conditions, schedule.conditions);

        for version in 1..=3u64 {
            db.append_scene_prompt(&ScenePromptRecord {
                id: uuid::Uuid::new_v4().to_string(),
                conversation_id: "c1".to_string(),
                prompt: format!("adult, v{}", version),
                negative_prompt: "lowres".to_string(),
                trigger: SceneTrigger::Evolution,
                length: 9,
                scene_version: version,
                seed: 7,
                created_at: Utc::now(),
            })
            .expect("append");
        }
        let records = db.scene_prompts("c1", 2).expect("records");
        assert_eq!(
            records.iter().map(|r| r.scene_version).collect::<Vec<_>>(),
            vec![2, 3]
        );

        let mut delta = VisualDelta::empty(ExtractionSource::Ai);
        delta.set(VisualField::Location, "library", true);
        let snapshot = merge(None, &delta, "c1", Utc::now());
        db.append_visual_state(&snapshot).expect("append");
        assert_eq!(db.latest_visual_state("c1").expect("latest"), Some(snapshot));
        assert_eq!(db.visual_state_count("c1").expect("count"), 1);
    }
}
