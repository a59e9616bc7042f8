use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use flume::Sender;
use tokio::task::JoinHandle;

use crate::character_card::CharacterProfile;
use crate::comfy_client::ComfyImageClient;
use crate::config::EngineConfig;
use crate::consistency::ConsistencyPromptBuilder;
use crate::conversation::{ChatMessage, ConversationGate, ConversationState, Presence};
use crate::database::EngineDatabase;
use crate::events::{EngineEvent, EventSink, MessageOrigin};
use crate::image_client::ImageGenerator;
use crate::jobs::{Job, JobHandler, JobScheduler, TokioJobScheduler};
use crate::llm_client::{LlmClient, TextGenerator};
use crate::presence::{PresenceCoordinator, ReplySettings, TurnOutcome};
use crate::scene::{ScenePipeline, SceneSettings};
use crate::schedule::scheduler::InitiativeScheduler;
use crate::store::Store;
use crate::visual::extractor::ContextExtractor;

/// Routes background jobs to the pipeline that owns them.
struct EngineJobs {
    scene: Arc<ScenePipeline>,
    presence: Arc<PresenceCoordinator>,
}

#[async_trait]
impl JobHandler for EngineJobs {
    async fn handle(&self, job: &Job) -> Result<()> {
        match job {
            Job::GenerateSceneImage {
                conversation_id,
                scene_version,
            } => self.scene.handle_image_job(conversation_id, *scene_version).await,
            Job::PresenceReturn {
                conversation_id,
                return_at,
            } => self.presence.on_return(conversation_id, *return_at).await,
            Job::FollowUp {
                conversation_id,
                activity_version,
                hint,
            } => {
                self.presence
                    .on_follow_up(conversation_id, *activity_version, hint.clone())
                    .await
            }
        }
    }
}

pub struct EngineRuntime {
    pub config: EngineConfig,
    pub store: Arc<dyn Store>,
    pub gate: Arc<ConversationGate>,
    pub scene: Arc<ScenePipeline>,
    pub presence: Arc<PresenceCoordinator>,
    pub scheduler: Arc<InitiativeScheduler>,
    jobs: Arc<TokioJobScheduler>,
    events: EventSink,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

pub struct EngineRuntimeBuilder {
    config: EngineConfig,
    event_tx: Sender<EngineEvent>,
    store: Option<Arc<dyn Store>>,
    text: Option<Arc<dyn TextGenerator>>,
    images: Option<Arc<dyn ImageGenerator>>,
}

impl EngineRuntimeBuilder {
    pub fn new(config: EngineConfig, event_tx: Sender<EngineEvent>) -> Self {
        Self {
            config,
            event_tx,
            store: None,
            text: None,
            images: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_text_generator(mut self, text: Arc<dyn TextGenerator>) -> Self {
        self.text = Some(text);
        self
    }

    pub fn with_image_generator(mut self, images: Arc<dyn ImageGenerator>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn build(self) -> Result<EngineRuntime> {
        let config = self.config;

        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None => Arc::new(
                EngineDatabase::new(&config.database_path)
                    .with_context(|| format!("Failed to open database {}", config.database_path))?,
            ),
        };
        let text: Arc<dyn TextGenerator> = match self.text {
            Some(text) => text,
            None => Arc::new(LlmClient::from_config(&config.llm)?),
        };
        let images: Arc<dyn ImageGenerator> = match self.images {
            Some(images) => images,
            None => Arc::new(ComfyImageClient::from_config(&config.comfyui)?),
        };

        let schedules = config.validated_schedules()?;
        for schedule in &schedules {
            store.put_schedule(schedule)?;
        }
        tracing::info!("Registered {} schedule(s)", schedules.len());

        let events = EventSink::new(self.event_tx);
        let jobs = Arc::new(TokioJobScheduler::new(config.jobs.clone()));
        let gate = Arc::new(ConversationGate::new(store.clone()));

        let scene = Arc::new(ScenePipeline::new(
            gate.clone(),
            ContextExtractor::new(text.clone(), config.extraction.clone(), config.retry.clone()),
            ConsistencyPromptBuilder::new(text.clone(), config.consistency.clone(), config.retry.clone()),
            jobs.clone(),
            images,
            events.clone(),
            SceneSettings::from_config(&config),
        ));
        let presence = Arc::new(PresenceCoordinator::new(
            gate.clone(),
            text,
            scene.clone(),
            jobs.clone(),
            events.clone(),
            ReplySettings::from_config(&config),
        ));
        let scheduler = Arc::new(InitiativeScheduler::new(
            store.clone(),
            presence.clone(),
            config.triggers.clone(),
            &config.scheduler,
        ));

        Ok(EngineRuntime {
            config,
            store,
            gate,
            scene,
            presence,
            scheduler,
            jobs,
            events,
            handles: Mutex::new(Vec::new()),
        })
    }
}

impl EngineRuntime {
    pub fn bootstrap(config: EngineConfig, event_tx: Sender<EngineEvent>) -> Result<Self> {
        EngineRuntimeBuilder::new(config, event_tx).build()
    }

    /// Recover from a previous run, then start the job worker and, if
    /// enabled, the initiative scheduler.
    pub async fn start(&self) -> Result<()> {
        let reset = self.gate.reset_stale_generation().await?;
        if reset > 0 {
            tracing::warn!("Cleared {} generation flag(s) left by a previous run", reset);
        }
        self.resume_away_conversations()?;

        let handler = Arc::new(EngineJobs {
            scene: self.scene.clone(),
            presence: self.presence.clone(),
        });
        let mut handles = Vec::new();
        handles.push(self.jobs.start(handler));
        if self.config.scheduler.enabled {
            handles.push(self.scheduler.start());
        } else {
            tracing::info!("Initiative scheduler disabled");
        }
        self.handles
            .lock()
            .map_err(|e| anyhow::anyhow!("Runtime handle lock poisoned: {}", e))?
            .extend(handles);
        Ok(())
    }

    /// Pending returns live only in memory; reschedule them from persisted state.
    fn resume_away_conversations(&self) -> Result<()> {
        let now = Utc::now();
        for state in self.store.list_conversations()? {
            if let Presence::Away { return_at, .. } = state.presence {
                let delay = (return_at - now).to_std().unwrap_or(Duration::ZERO);
                self.jobs.schedule_after(
                    delay,
                    Job::PresenceReturn {
                        conversation_id: state.id.clone(),
                        return_at,
                    },
                )?;
                tracing::info!("Rescheduled return for {} in {:?}", state.id, delay);
            }
        }
        Ok(())
    }

    /// Register the character, open the conversation, greet with the card's
    /// first message on a fresh conversation and bootstrap the scene image.
    pub async fn open_conversation(
        &self,
        conversation_id: &str,
        character: &CharacterProfile,
    ) -> Result<ConversationState> {
        self.store.put_character(character)?;
        let state = self.gate.open(conversation_id, &character.id).await?;

        let greeting = character.first_message.trim();
        if !greeting.is_empty() && self.store.recent_messages(conversation_id, 1)?.is_empty() {
            let message = ChatMessage::character(conversation_id, greeting, Utc::now());
            self.store.append_message(&message)?;
            self.events.emit(EngineEvent::CharacterMessage {
                message,
                origin: MessageOrigin::Reply,
            });
        }

        if let Err(e) = self.scene.initialize_scene(conversation_id).await {
            tracing::warn!("Scene bootstrap for {} failed: {:#}", conversation_id, e);
            self.events
                .error(Some(conversation_id), format!("Scene setup failed: {}", e));
        }
        Ok(state)
    }

    pub async fn send_message(&self, conversation_id: &str, content: &str) -> Result<TurnOutcome> {
        self.presence
            .on_user_message(conversation_id, content, Utc::now())
            .await
    }

    pub async fn regenerate_scene(&self, conversation_id: &str) -> Result<u64> {
        self.scene.regenerate_scene(conversation_id).await
    }

    pub async fn shutdown(&self) {
        tracing::info!("Engine shutting down");
        self.scheduler.stop();
        self.jobs.shutdown();
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(e) => {
                tracing::error!("Runtime handle lock poisoned: {}", e);
                return;
            }
        };
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                tracing::warn!("Background task did not stop in time");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::testing::{test_character, ScriptedImages, ScriptedText};
    use tempfile::TempDir;

    struct TestRuntime {
        runtime: EngineRuntime,
        store: Arc<InMemoryStore>,
        events: flume::Receiver<EngineEvent>,
        _images: TempDir,
    }

    fn runtime(text: Arc<ScriptedText>) -> TestRuntime {
        let images = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig::default();
        config.image_output_dir = images.path().to_string_lossy().to_string();
        config.scheduler.enabled = false;
        let store = Arc::new(InMemoryStore::new());
        let (tx, events) = flume::unbounded();
        let runtime = EngineRuntimeBuilder::new(config, tx)
            .with_store(store.clone())
            .with_text_generator(text)
            .with_image_generator(Arc::new(ScriptedImages::default()))
            .build()
            .expect("runtime");
        TestRuntime {
            runtime,
            store,
            events,
            _images: images,
        }
    }

    #[tokio::test]
    async fn open_conversation_greets_and_bootstraps_once() {
        let t = runtime(Arc::new(ScriptedText::default()));

        t.runtime.open_conversation("c1", &test_character()).await.expect("open");
        t.runtime.open_conversation("c1", &test_character()).await.expect("reopen");

        let messages = t.store.recent_messages("c1", 10).expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Welcome in! Take any seat you like.");
        let state = t.runtime.gate.load("c1").expect("state");
        assert!(state.pending_image_enqueued);
        assert_eq!(state.scene_version, 1);
        let prompt_updates = t
            .events
            .drain()
            .filter(|e| matches!(e, EngineEvent::ScenePromptUpdated { .. }))
            .count();
        assert_eq!(prompt_updates, 1);
    }

    #[tokio::test]
    async fn start_clears_stale_flags_and_dispatches_jobs() {
        let text = Arc::new(ScriptedText::default());
        text.route("Stay in character", Ok("Hi!".to_string()));
        let t = runtime(text);
        t.runtime.open_conversation("c1", &test_character()).await.expect("open");
        t.runtime
            .gate
            .update("c1", |state| state.generating = true)
            .await
            .expect("flag");

        t.runtime.start().await.expect("start");
        assert!(!t.runtime.gate.load("c1").expect("state").generating);

        let image = tokio::time::timeout(Duration::from_secs(10), async {
            while let Ok(event) = t.events.recv_async().await {
                if let EngineEvent::SceneImageReady { path, .. } = event {
                    return Some(path);
                }
            }
            None
        })
        .await
        .expect("image in time");
        assert!(image.is_some_and(|path| path.exists()));

        assert_eq!(
            t.runtime.send_message("c1", "Hello").await.expect("send"),
            TurnOutcome::Replied(1)
        );
        t.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn stale_jobs_are_acknowledged() {
        let t = runtime(Arc::new(ScriptedText::default()));
        t.runtime.open_conversation("c1", &test_character()).await.expect("open");
        t.runtime
            .gate
            .update("c1", |state| state.activity_version = 3)
            .await
            .expect("activity");
        let handler = EngineJobs {
            scene: t.runtime.scene.clone(),
            presence: t.runtime.presence.clone(),
        };

        for job in [
            Job::FollowUp {
                conversation_id: "c1".to_string(),
                activity_version: 1,
                hint: None,
            },
            Job::PresenceReturn {
                conversation_id: "c1".to_string(),
                return_at: Utc::now(),
            },
            Job::GenerateSceneImage {
                conversation_id: "c1".to_string(),
                scene_version: 0,
            },
        ] {
            handler.handle(&job).await.expect("stale job is a no-op");
        }
        assert_eq!(t.store.recent_messages("c1", 10).expect("messages").len(), 1);
    }
}
