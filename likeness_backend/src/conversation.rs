//! Conversation state and the per-conversation single-writer machinery.
//!
//! Every read-modify-write of a [`ConversationState`] goes through
//! [`ConversationGate::update`], which holds a per-conversation async lock for
//! the duration of the edit only. Long external calls run inside
//! [`ConversationGate::run_generation`], which marks the persisted `generating`
//! flag, releases the lock, awaits the work, then re-acquires to apply results.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

use crate::error::EngineError;
use crate::store::Store;
use crate::tags::TagSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Character,
}

impl Role {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Character => "character",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" | "operator" => Role::User,
            _ => Role::Character,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Has the character answered this? Always true for character messages.
    pub processed: bool,
}

impl ChatMessage {
    pub fn user(conversation_id: &str, content: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: Role::User,
            content: content.to_string(),
            created_at: at,
            processed: false,
        }
    }

    pub fn character(conversation_id: &str, content: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: Role::Character,
            content: content.to_string(),
            created_at: at,
            processed: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Presence {
    Present,
    Away {
        since: DateTime<Utc>,
        reason: String,
        return_at: DateTime<Utc>,
    },
}

impl Presence {
    pub fn is_away(&self) -> bool {
        matches!(self, Presence::Away { .. })
    }

    pub fn return_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Presence::Away { return_at, .. } => Some(*return_at),
            Presence::Present => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub id: String,
    pub character_id: String,
    pub presence: Presence,
    /// Permanent visual features, derived once and cached.
    pub locked_appearance: Option<TagSet>,
    pub current_scene_prompt: Option<String>,
    #[serde(default)]
    pub current_negative_prompt: Option<String>,
    /// Bumped on every accepted scene prompt update.
    pub scene_version: u64,
    /// Guards the bootstrap image enqueue.
    pub pending_image_enqueued: bool,
    pub seed: Option<u64>,
    /// A reply or other state-mutating generation is in flight.
    pub generating: bool,
    /// Bumped on every inbound user message; stale follow-ups compare against it.
    #[serde(default)]
    pub activity_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(id: &str, character_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            character_id: character_id.to_string(),
            presence: Presence::Present,
            locked_appearance: None,
            current_scene_prompt: None,
            current_negative_prompt: None,
            scene_version: 0,
            pending_image_enqueued: false,
            seed: None,
            generating: false,
            activity_version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Registry of per-conversation async locks. Entries nobody holds or waits on
/// are dropped on the next acquire, so the map tracks only live conversations.
#[derive(Default)]
pub struct ConversationLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // A count of one means only the map references the lock.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(conversation_id.to_string())
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

pub type StateEdit = Box<dyn FnOnce(&mut ConversationState) + Send>;

/// Result of generation work plus the state edit to apply once the lock is
/// re-acquired.
pub struct Commit<T> {
    pub value: T,
    pub edit: StateEdit,
}

impl<T> Commit<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            edit: Box::new(|_| {}),
        }
    }

    pub fn with_edit<F>(value: T, edit: F) -> Self
    where
        F: FnOnce(&mut ConversationState) + Send + 'static,
    {
        Self {
            value,
            edit: Box::new(edit),
        }
    }
}

pub struct ConversationGate {
    store: Arc<dyn Store>,
    locks: ConversationLocks,
}

impl ConversationGate {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: ConversationLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Lock-free read, for polling and for planning work.
    pub fn load(&self, conversation_id: &str) -> Result<ConversationState> {
        self.store
            .get_conversation(conversation_id)?
            .with_context(|| format!("Unknown conversation '{}'", conversation_id))
    }

    /// Create the conversation if it does not exist yet.
    pub async fn open(&self, conversation_id: &str, character_id: &str) -> Result<ConversationState> {
        let _guard = self.locks.acquire(conversation_id).await;
        if let Some(existing) = self.store.get_conversation(conversation_id)? {
            return Ok(existing);
        }
        let state = ConversationState::new(conversation_id, character_id);
        self.store.put_conversation(&state)?;
        tracing::info!(
            "Opened conversation {} with character {}",
            conversation_id,
            character_id
        );
        Ok(state)
    }

    /// Serialized read-modify-write.
    pub async fn update<T, F>(&self, conversation_id: &str, edit: F) -> Result<T>
    where
        F: FnOnce(&mut ConversationState) -> T,
    {
        let _guard = self.locks.acquire(conversation_id).await;
        let mut state = self.load(conversation_id)?;
        let out = edit(&mut state);
        state.updated_at = Utc::now();
        self.store.put_conversation(&state)?;
        Ok(out)
    }

    /// Run `work` with the conversation's generation slot held.
    ///
    /// Returns `Ok(None)` without running anything when another generation is
    /// in flight or `admit` rejects the current state. The `generating` flag is
    /// cleared on every exit path: success, error and panic.
    pub async fn run_generation<T, A, F, Fut>(
        &self,
        conversation_id: &str,
        admit: A,
        work: F,
    ) -> Result<Option<T>>
    where
        A: FnOnce(&ConversationState) -> bool,
        F: FnOnce(ConversationState) -> Fut,
        Fut: Future<Output = Result<Commit<T>>>,
    {
        let admitted = self
            .update(conversation_id, |state| {
                if state.generating || !admit(state) {
                    None
                } else {
                    state.generating = true;
                    Some(state.clone())
                }
            })
            .await?;
        let Some(snapshot) = admitted else {
            return Ok(None);
        };

        match AssertUnwindSafe(work(snapshot)).catch_unwind().await {
            Ok(Ok(Commit { value, edit })) => {
                self.release(conversation_id, edit).await?;
                Ok(Some(value))
            }
            Ok(Err(err)) => {
                if let Err(release_err) = self.release(conversation_id, Box::new(|_| {})).await {
                    tracing::error!(
                        "Failed to release generation slot for {}: {}",
                        conversation_id,
                        release_err
                    );
                }
                Err(err)
            }
            Err(panic) => {
                if let Err(release_err) = self.release(conversation_id, Box::new(|_| {})).await {
                    tracing::error!(
                        "Failed to release generation slot for {}: {}",
                        conversation_id,
                        release_err
                    );
                }
                Err(anyhow!(
                    "generation for {} panicked: {}",
                    conversation_id,
                    panic_message(panic.as_ref())
                ))
            }
        }
    }

    async fn release(&self, conversation_id: &str, edit: StateEdit) -> Result<()> {
        self.update(conversation_id, |state| {
            if !state.generating {
                let conflict = EngineError::ConcurrencyConflict(conversation_id.to_string());
                tracing::error!("{}: generation flag was cleared by another writer", conflict);
            }
            edit(state);
            state.generating = false;
        })
        .await
    }

    /// Clear `generating` flags left behind by a previous process.
    pub async fn reset_stale_generation(&self) -> Result<usize> {
        let stale: Vec<String> = self
            .store
            .list_conversations()?
            .into_iter()
            .filter(|state| state.generating)
            .map(|state| state.id)
            .collect();
        for id in &stale {
            self.update(id, |state| state.generating = false).await?;
            tracing::warn!("Cleared stale generation flag on conversation {}", id);
        }
        Ok(stale.len())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    async fn gate_with_conversation() -> ConversationGate {
        let gate = ConversationGate::new(Arc::new(InMemoryStore::new()));
        gate.open("c1", "alice").await.expect("open");
        gate
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let gate = gate_with_conversation().await;
        gate.update("c1", |state| state.scene_version = 3)
            .await
            .expect("update");
        let reopened = gate.open("c1", "bob").await.expect("reopen");
        assert_eq!(reopened.scene_version, 3);
        assert_eq!(reopened.character_id, "alice");
    }

    #[tokio::test]
    async fn idle_locks_are_released() {
        let locks = ConversationLocks::default();
        for i in 0..50 {
            let guard = locks.acquire(&format!("c{}", i)).await;
            drop(guard);
        }
        let held = locks.acquire("held").await;
        assert_eq!(locks.tracked(), 1);

        let other = locks.acquire("other").await;
        assert_eq!(locks.tracked(), 2);
        drop(other);

        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(20), locks.acquire("held")).await;
        assert!(blocked.is_err(), "held lock survived pruning");
        drop(held);
        let _again = locks.acquire("held").await;
        assert_eq!(locks.tracked(), 1);
    }

    #[tokio::test]
    async fn generation_slot_is_exclusive() {
        let gate = Arc::new(gate_with_conversation().await);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (finish_tx, finish_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.run_generation(
                    "c1",
                    |_| true,
                    |_| async move {
                        let _ = started_tx.send(());
                        let _ = finish_rx.await;
                        Ok(Commit::with_edit(1, |state: &mut ConversationState| {
                            state.scene_version += 1
                        }))
                    },
                )
                .await
            })
        };

        started_rx.await.expect("first started");
        assert!(gate.load("c1").expect("load").generating);
        let second = gate
            .run_generation("c1", |_| true, |_| async { Ok(Commit::new(2)) })
            .await
            .expect("second");
        assert_eq!(second, None);

        finish_tx.send(()).expect("finish");
        let first = first.await.expect("join").expect("first");
        assert_eq!(first, Some(1));

        let state = gate.load("c1").expect("load");
        assert!(!state.generating);
        assert_eq!(state.scene_version, 1);
    }

    #[tokio::test]
    async fn generation_flag_released_on_error_and_panic() {
        let gate = gate_with_conversation().await;

        let failed: Result<Option<()>> = gate
            .run_generation("c1", |_| true, |_| async { Err(anyhow!("boom")) })
            .await;
        assert!(failed.is_err());
        assert!(!gate.load("c1").expect("load").generating);

        let panicked: Result<Option<()>> = gate
            .run_generation(
                "c1",
                |_| true,
                |_| async {
                    panic!("generation exploded");
                    #[allow(unreachable_code)]
                    Ok(Commit::new(()))
                },
            )
            .await;
        let err = panicked.expect_err("panic surfaces as error");
        assert!(err.to_string().contains("generation exploded"));
        assert!(!gate.load("c1").expect("load").generating);
    }

    #[tokio::test]
    async fn admit_can_reject_without_touching_state() {
        let gate = gate_with_conversation().await;
        let outcome = gate
            .run_generation("c1", |state| state.presence.is_away(), |_| async {
                Ok(Commit::new(()))
            })
            .await
            .expect("run");
        assert_eq!(outcome, None);
        assert!(!gate.load("c1").expect("load").generating);
    }

    #[tokio::test]
    async fn reset_clears_stale_flags() {
        let gate = gate_with_conversation().await;
        gate.update("c1", |state| state.generating = true)
            .await
            .expect("mark");
        assert_eq!(gate.reset_stale_generation().await.expect("reset"), 1);
        assert!(!gate.load("c1").expect("load").generating);
    }

    #[test]
    fn role_db_strings_roundtrip() {
        assert_eq!(Role::from_db(Role::User.as_db_str()), Role::User);
        assert_eq!(Role::from_db("operator"), Role::User);
        assert_eq!(Role::from_db("character"), Role::Character);
    }
}
