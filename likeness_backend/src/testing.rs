//! Scripted capabilities and a wired-up engine for unit tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use crate::character_card::CharacterProfile;
use crate::config::EngineConfig;
use crate::consistency::ConsistencyPromptBuilder;
use crate::conversation::{ConversationGate, ConversationState};
use crate::events::{EngineEvent, EventSink};
use crate::image_client::{validate_image, GeneratedImage, ImageGenerator, ImageRequest};
use crate::jobs::{Job, JobScheduler};
use crate::llm_client::{CompletionOptions, Message, TextGenerator};
use crate::presence::{PresenceCoordinator, ReplySettings};
use crate::scene::{ScenePipeline, SceneSettings};
use crate::schedule::{ScheduleDefinition, TriggerConditions};
use crate::store::memory::InMemoryStore;
use crate::store::Store;
use crate::visual::extractor::ContextExtractor;
use crate::visual::VisualField;

type Scripted = std::result::Result<String, String>;

/// Text generator fed from a queue. Routes answer every request whose
/// messages contain the marker; the most recently added route wins.
pub(crate) struct ScriptedText {
    queue: Mutex<VecDeque<Scripted>>,
    routes: Mutex<Vec<(String, Scripted)>>,
    log: Mutex<Vec<(Vec<Message>, f32)>>,
    holds: Mutex<Vec<(String, Arc<Semaphore>)>>,
    held: Semaphore,
}

impl Default for ScriptedText {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            routes: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            holds: Mutex::new(Vec::new()),
            held: Semaphore::new(0),
        }
    }
}

impl ScriptedText {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            queue: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn route(&self, marker: &str, response: Scripted) {
        let mut routes = self.routes.lock().unwrap();
        routes.retain(|(existing, _)| existing != marker);
        routes.push((marker.to_string(), response));
    }

    /// Park the next request mentioning `marker` until a permit is added to
    /// the returned semaphore.
    pub fn hold(&self, marker: &str) -> Arc<Semaphore> {
        let release = Arc::new(Semaphore::new(0));
        self.holds.lock().unwrap().push((marker.to_string(), release.clone()));
        release
    }

    /// Resolves once a held request is parked.
    pub async fn wait_until_held(&self) {
        self.held.acquire().await.expect("held semaphore").forget();
    }

    pub fn calls(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn temperatures(&self) -> Vec<f32> {
        self.log.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    /// All message contents of the latest request mentioning `marker`.
    pub fn last_request_containing(&self, marker: &str) -> Option<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(messages, _)| messages.iter().any(|m| m.content.contains(marker)))
            .map(|(messages, _)| {
                messages
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
    }
}

#[async_trait]
impl TextGenerator for ScriptedText {
    async fn complete(&self, messages: Vec<Message>, options: &CompletionOptions) -> Result<String> {
        let hold = {
            let mut holds = self.holds.lock().unwrap();
            let position = holds
                .iter()
                .position(|(marker, _)| messages.iter().any(|m| m.content.contains(marker.as_str())));
            position.map(|index| holds.remove(index).1)
        };
        if let Some(release) = hold {
            self.held.add_permits(1);
            release.acquire().await.expect("release semaphore").forget();
        }

        let routed = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(marker, _)| messages.iter().any(|m| m.content.contains(marker.as_str())))
            .map(|(_, response)| response.clone());
        self.log.lock().unwrap().push((messages, options.temperature));

        let next = match routed {
            Some(response) => response,
            None => self
                .queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err("script exhausted".to_string())),
        };
        next.map_err(|e| anyhow::anyhow!(e))
    }
}

#[derive(Default)]
pub(crate) struct ScriptedImages {
    requests: Mutex<Vec<ImageRequest>>,
    failing: AtomicBool,
}

impl ScriptedImages {
    pub fn fail_all(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ImageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageGenerator for ScriptedImages {
    async fn generate_image(&self, request: &ImageRequest) -> Result<GeneratedImage> {
        self.requests.lock().unwrap().push(request.clone());
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("image backend offline");
        }
        validate_image(tiny_png(request.width.clamp(1, 8), request.height.clamp(1, 8)))
    }
}

/// Records jobs instead of running them.
#[derive(Default)]
pub(crate) struct RecordingJobs {
    jobs: Mutex<Vec<(Duration, Job)>>,
    failing: AtomicBool,
}

impl RecordingJobs {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<(Duration, Job)> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn image_jobs(&self, conversation_id: &str) -> Vec<u64> {
        self.all()
            .into_iter()
            .filter_map(|(_, job)| match job {
                Job::GenerateSceneImage {
                    conversation_id: id,
                    scene_version,
                } if id == conversation_id => Some(scene_version),
                _ => None,
            })
            .collect()
    }

    pub fn returns(&self, conversation_id: &str) -> Vec<DateTime<Utc>> {
        self.all()
            .into_iter()
            .filter_map(|(_, job)| match job {
                Job::PresenceReturn {
                    conversation_id: id,
                    return_at,
                } if id == conversation_id => Some(return_at),
                _ => None,
            })
            .collect()
    }

    pub fn follow_ups(&self, conversation_id: &str) -> Vec<u64> {
        self.all()
            .into_iter()
            .filter_map(|(_, job)| match job {
                Job::FollowUp {
                    conversation_id: id,
                    activity_version,
                    ..
                } if id == conversation_id => Some(activity_version),
                _ => None,
            })
            .collect()
    }
}

impl JobScheduler for RecordingJobs {
    fn schedule_after(&self, delay: Duration, job: Job) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("job queue unavailable");
        }
        self.jobs.lock().unwrap().push((delay, job));
        Ok(())
    }
}

pub(crate) fn tiny_png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([200, 120, 80]));
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("encode png");
    bytes
}

/// Current-schema analysis JSON marking every given field as changed.
pub(crate) fn analysis_json(fields: &[(VisualField, &str)], significance: u8) -> String {
    let attributes: serde_json::Map<String, serde_json::Value> = fields
        .iter()
        .map(|(field, value)| {
            (
                field.key().to_string(),
                serde_json::json!({"value": value, "changed": true}),
            )
        })
        .collect();
    serde_json::json!({
        "visual_update_needed": false,
        "context_significance": significance,
        "attributes": attributes,
    })
    .to_string()
}

pub(crate) fn test_character() -> CharacterProfile {
    CharacterProfile {
        id: "ch1".to_string(),
        name: "Mira".to_string(),
        description: "A barista who loves old books.".to_string(),
        appearance: "tall, fair skin, long black hair, green eyes".to_string(),
        personality: "warm, teasing".to_string(),
        scenario: "A quiet cafe in the evening.".to_string(),
        first_message: "Welcome in! Take any seat you like.".to_string(),
        system_prompt: String::new(),
    }
}

/// Scene pipeline and presence coordinator over scripted capabilities, with
/// conversation `c1` open for character `ch1`.
pub(crate) struct Harness {
    pub config: EngineConfig,
    pub store: Arc<InMemoryStore>,
    pub gate: Arc<ConversationGate>,
    pub text: Arc<ScriptedText>,
    pub images: Arc<ScriptedImages>,
    pub jobs: Arc<RecordingJobs>,
    pub scene: Arc<ScenePipeline>,
    pub presence: Arc<PresenceCoordinator>,
    pub events: flume::Receiver<EngineEvent>,
    pub image_dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let config = EngineConfig::default();
        let store = Arc::new(InMemoryStore::new());
        store.put_character(&test_character()).expect("character");
        let gate = Arc::new(ConversationGate::new(store.clone()));
        gate.open("c1", "ch1").await.expect("conversation");

        let text = Arc::new(ScriptedText::default());
        let images = Arc::new(ScriptedImages::default());
        let jobs = Arc::new(RecordingJobs::default());
        let (events, events_rx) = EventSink::channel();
        let image_dir = tempfile::tempdir().expect("tempdir");

        let scene = Arc::new(ScenePipeline::new(
            gate.clone(),
            ContextExtractor::new(text.clone(), config.extraction.clone(), config.retry.clone()),
            ConsistencyPromptBuilder::new(text.clone(), config.consistency.clone(), config.retry.clone()),
            jobs.clone(),
            images.clone(),
            events.clone(),
            SceneSettings {
                image_output_dir: image_dir.path().to_path_buf(),
                width: 64,
                height: 64,
                image_attempts: 2,
            },
        ));
        let presence = Arc::new(PresenceCoordinator::new(
            gate.clone(),
            text.clone(),
            scene.clone(),
            jobs.clone(),
            events,
            ReplySettings::from_config(&config),
        ));

        Self {
            config,
            store,
            gate,
            text,
            images,
            jobs,
            scene,
            presence,
            events: events_rx,
            image_dir,
        }
    }

    pub fn state(&self, conversation_id: &str) -> ConversationState {
        self.gate.load(conversation_id).expect("conversation state")
    }

    pub fn daily_schedule(&self, id: &str) -> ScheduleDefinition {
        ScheduleDefinition {
            id: id.to_string(),
            character_id: "ch1".to_string(),
            conditions: TriggerConditions::Daily {
                times: vec![NaiveTime::from_hms_opt(8, 0, 0).expect("time")],
            },
            priority: 1,
            active: true,
            utc_offset_minutes: 0,
            message_hint: Some("Say good morning.".to_string()),
        }
    }
}
