//! Scene prompt pipeline: extract the character's look, rebuild the image
//! prompt when it matters, and hand image generation to the job scheduler.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::consistency::{new_seed, BuildRequest, BuiltPrompt, ConsistencyPromptBuilder};
use crate::conversation::{ConversationGate, ConversationState};
use crate::events::{EngineEvent, EventSink};
use crate::image_client::{save_scene_image, ImageGenerator, ImageRequest};
use crate::jobs::{Job, JobScheduler};
use crate::tags::TagSet;
use crate::visual::extractor::{ContextExtractor, ExtractionInput};
use crate::visual::{CharacterVisualState, ExtractionSource};

pub use crate::visual::SceneTrigger;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenePromptRecord {
    pub id: String,
    pub conversation_id: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub trigger: SceneTrigger,
    pub length: usize,
    pub scene_version: u64,
    pub seed: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneOutcome {
    /// Nothing visually significant happened.
    Unchanged,
    Updated { scene_version: u64 },
    /// Something failed; the previous prompt stays in place.
    FellBack,
}

#[derive(Debug, Clone)]
pub struct SceneSettings {
    pub image_output_dir: PathBuf,
    pub width: u32,
    pub height: u32,
    pub image_attempts: u32,
}

impl SceneSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            image_output_dir: PathBuf::from(&config.image_output_dir),
            width: config.comfyui.width,
            height: config.comfyui.height,
            image_attempts: config.retry.attempts(),
        }
    }
}

struct Composed {
    built: BuiltPrompt,
    locked: TagSet,
    dynamic: CharacterVisualState,
    trigger: SceneTrigger,
    heuristic: bool,
}

struct Applied {
    version: u64,
    enqueue: bool,
    /// This call claimed the first-image guard.
    bootstrap: bool,
}

pub struct ScenePipeline {
    gate: Arc<ConversationGate>,
    extractor: ContextExtractor,
    builder: ConsistencyPromptBuilder,
    jobs: Arc<dyn JobScheduler>,
    images: Arc<dyn ImageGenerator>,
    events: EventSink,
    settings: SceneSettings,
}

impl ScenePipeline {
    pub fn new(
        gate: Arc<ConversationGate>,
        extractor: ContextExtractor,
        builder: ConsistencyPromptBuilder,
        jobs: Arc<dyn JobScheduler>,
        images: Arc<dyn ImageGenerator>,
        events: EventSink,
        settings: SceneSettings,
    ) -> Self {
        Self {
            gate,
            extractor,
            builder,
            jobs,
            images,
            events,
            settings,
        }
    }

    /// Feed new story text through extraction and, when significant, a prompt
    /// rebuild plus image enqueue. Failures keep the previous prompt.
    pub async fn on_new_content(
        &self,
        conversation_id: &str,
        text: &str,
        at: DateTime<Utc>,
        trigger: SceneTrigger,
    ) -> SceneOutcome {
        match self.update_scene(conversation_id, text, at, trigger, false).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Scene update for {} failed, keeping previous prompt: {:#}", conversation_id, e);
                SceneOutcome::FellBack
            }
        }
    }

    /// Bootstrap the first image. Exactly one caller wins the
    /// `pending_image_enqueued` check-and-set; the rest return `Ok(false)`.
    pub async fn initialize_scene(&self, conversation_id: &str) -> Result<bool> {
        let claimed = self
            .gate
            .update(conversation_id, |state| {
                if state.pending_image_enqueued {
                    None
                } else {
                    state.pending_image_enqueued = true;
                    Some(state.clone())
                }
            })
            .await?;
        let Some(state) = claimed else {
            tracing::debug!("Scene for {} already bootstrapped", conversation_id);
            return Ok(false);
        };

        let bootstrap = async {
            let version = match state.current_scene_prompt {
                Some(_) => state.scene_version,
                None => {
                    let seed_text = self.bootstrap_text(&state)?;
                    let composed = self
                        .compose(&state, &seed_text, Utc::now(), SceneTrigger::Initial, true)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("no initial prompt could be built"))?;
                    self.apply(conversation_id, composed).await?.version
                }
            };
            self.jobs.enqueue_now(Job::GenerateSceneImage {
                conversation_id: conversation_id.to_string(),
                scene_version: version,
            })
        };

        if let Err(e) = bootstrap.await {
            tracing::warn!("Scene bootstrap for {} failed: {:#}", conversation_id, e);
            self.gate
                .update(conversation_id, |state| state.pending_image_enqueued = false)
                .await?;
            return Err(e);
        }
        tracing::info!("Scene for {} bootstrapped", conversation_id);
        Ok(true)
    }

    /// Queue a fresh image for the current prompt, ignoring the bootstrap guard.
    pub async fn regenerate_scene(&self, conversation_id: &str) -> Result<u64> {
        let state = self.gate.load(conversation_id)?;
        let version = match state.current_scene_prompt {
            Some(_) => state.scene_version,
            None => {
                let seed_text = self.bootstrap_text(&state)?;
                let composed = self
                    .compose(&state, &seed_text, Utc::now(), SceneTrigger::Initial, true)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("no prompt could be built"))?;
                self.apply(conversation_id, composed).await?.version
            }
        };
        self.gate
            .update(conversation_id, |state| state.pending_image_enqueued = true)
            .await?;
        self.jobs.enqueue_now(Job::GenerateSceneImage {
            conversation_id: conversation_id.to_string(),
            scene_version: version,
        })?;
        Ok(version)
    }

    fn bootstrap_text(&self, state: &ConversationState) -> Result<String> {
        let store = self.gate.store();
        if let Some(latest) = store.recent_messages(&state.id, 1)?.pop() {
            return Ok(latest.content);
        }
        let profile = store.get_character(&state.character_id)?;
        Ok(profile
            .map(|p| {
                if p.first_message.trim().is_empty() {
                    p.scenario
                } else {
                    p.first_message
                }
            })
            .unwrap_or_default())
    }

    async fn update_scene(
        &self,
        conversation_id: &str,
        text: &str,
        at: DateTime<Utc>,
        trigger: SceneTrigger,
        force: bool,
    ) -> Result<SceneOutcome> {
        let state = self.gate.load(conversation_id)?;
        let Some(composed) = self.compose(&state, text, at, trigger, force).await? else {
            return Ok(SceneOutcome::Unchanged);
        };
        let heuristic = composed.heuristic;
        let applied = self.apply(conversation_id, composed).await?;
        if applied.enqueue {
            if let Err(e) = self.jobs.enqueue_now(Job::GenerateSceneImage {
                conversation_id: conversation_id.to_string(),
                scene_version: applied.version,
            }) {
                tracing::warn!("Could not enqueue scene image for {}: {}", conversation_id, e);
                if applied.bootstrap {
                    self.gate
                        .update(conversation_id, |state| state.pending_image_enqueued = false)
                        .await?;
                }
            }
        }
        if heuristic {
            return Ok(SceneOutcome::FellBack);
        }
        Ok(SceneOutcome::Updated {
            scene_version: applied.version,
        })
    }

    /// Extract and, if warranted, build. `None` means the scene is unchanged.
    async fn compose(
        &self,
        state: &ConversationState,
        text: &str,
        at: DateTime<Utc>,
        trigger: SceneTrigger,
        force: bool,
    ) -> Result<Option<Composed>> {
        let store = self.gate.store();
        let appearance = store
            .get_character(&state.character_id)?
            .map(|p| p.appearance)
            .unwrap_or_default();
        let previous = store.latest_visual_state(&state.id)?;
        let history = store.recent_messages(&state.id, self.extractor.history_limit())?;

        let trigger = if state.current_scene_prompt.is_none() {
            SceneTrigger::Initial
        } else {
            trigger
        };

        let outcome = self
            .extractor
            .extract(ExtractionInput {
                conversation_id: &state.id,
                history: &history,
                latest: text,
                previous: previous.as_ref(),
                trigger,
                appearance: Some(appearance.as_str()),
                at,
            })
            .await;
        if !outcome.meta.reused_previous {
            store.append_visual_state(&outcome.state)?;
        }

        let needed = force || outcome.meta.significant || state.current_scene_prompt.is_none();
        if !needed {
            return Ok(None);
        }

        let locked = self
            .builder
            .locked_attributes(
                state.locked_appearance.as_ref(),
                &appearance,
                Some(&outcome.state),
                false,
            )
            .await;
        let seed = state.seed.unwrap_or_else(new_seed);
        let built = self.builder.build(BuildRequest {
            locked: &locked,
            dynamic: &outcome.state,
            trigger,
            seed,
            max_chars: self.builder.max_prompt_chars(),
        });

        Ok(Some(Composed {
            built,
            locked,
            dynamic: outcome.state,
            trigger,
            heuristic: outcome.meta.source == ExtractionSource::Heuristic,
        }))
    }

    /// Store the new prompt under the lock. An image is due for every
    /// evolution, and for the first prompt only if this call wins the
    /// bootstrap guard. If another call cached the locked set or seed since
    /// this prompt was composed, the prompt is rebuilt from the cached values.
    async fn apply(&self, conversation_id: &str, composed: Composed) -> Result<Applied> {
        let Composed {
            built,
            locked,
            dynamic,
            trigger,
            ..
        } = composed;
        let builder = &self.builder;

        let (version, seed, first, bootstrap, built) = self
            .gate
            .update(conversation_id, move |state| {
                let first = state.current_scene_prompt.is_none();
                let stale = state
                    .locked_appearance
                    .as_ref()
                    .is_some_and(|cached| *cached != locked)
                    || state.seed.is_some_and(|seed| seed != built.seed);
                let cached = state.locked_appearance.get_or_insert(locked);
                let seed = *state.seed.get_or_insert(built.seed);
                let built = if stale {
                    tracing::debug!("Rebuilding scene prompt for {} from cached attributes", state.id);
                    builder.build(BuildRequest {
                        locked: cached,
                        dynamic: &dynamic,
                        trigger,
                        seed,
                        max_chars: builder.max_prompt_chars(),
                    })
                } else {
                    built
                };
                state.current_scene_prompt = Some(built.prompt.clone());
                state.current_negative_prompt = Some(built.negative_prompt.clone());
                state.scene_version += 1;
                let bootstrap = !state.pending_image_enqueued;
                state.pending_image_enqueued = true;
                (state.scene_version, seed, first, bootstrap, built)
            })
            .await?;
        let BuiltPrompt {
            prompt,
            negative_prompt: negative,
            ..
        } = built;

        let record = ScenePromptRecord {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            length: prompt.chars().count(),
            prompt: prompt.clone(),
            negative_prompt: negative,
            trigger,
            scene_version: version,
            seed,
            created_at: Utc::now(),
        };
        self.gate.store().append_scene_prompt(&record)?;
        tracing::info!(
            "Scene prompt for {} updated to v{} ({})",
            conversation_id,
            version,
            trigger.as_str()
        );
        self.events.emit(EngineEvent::ScenePromptUpdated {
            conversation_id: conversation_id.to_string(),
            scene_version: version,
            prompt,
        });
        Ok(Applied {
            version,
            enqueue: !first || bootstrap,
            bootstrap,
        })
    }

    /// Render the image for `scene_version` if it is still current. Failures
    /// are logged and swallowed.
    pub async fn handle_image_job(&self, conversation_id: &str, scene_version: u64) -> Result<()> {
        let state = self.gate.load(conversation_id)?;
        if state.scene_version != scene_version {
            tracing::debug!(
                "Dropping stale image job for {} (v{} < v{})",
                conversation_id,
                scene_version,
                state.scene_version
            );
            return Ok(());
        }
        let Some(prompt) = state.current_scene_prompt.clone() else {
            return Ok(());
        };
        let request = ImageRequest {
            prompt,
            negative_prompt: state.current_negative_prompt.clone().unwrap_or_default(),
            seed: state.seed.unwrap_or_default(),
            width: self.settings.width,
            height: self.settings.height,
        };

        let attempts = self.settings.image_attempts.max(1);
        for attempt in 1..=attempts {
            match self.images.generate_image(&request).await {
                Ok(image) => {
                    let path = save_scene_image(
                        &self.settings.image_output_dir,
                        conversation_id,
                        scene_version,
                        &image,
                    )?;
                    tracing::info!("Scene image for {} v{} saved to {:?}", conversation_id, scene_version, path);
                    self.events.emit(EngineEvent::SceneImageReady {
                        conversation_id: conversation_id.to_string(),
                        scene_version,
                        path,
                    });
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "Image generation for {} v{} failed (attempt {}/{}): {:#}",
                        conversation_id,
                        scene_version,
                        attempt,
                        attempts,
                        e
                    );
                }
            }
        }
        Ok(())
    }
}
