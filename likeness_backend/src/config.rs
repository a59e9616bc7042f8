use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::schedule::{RawSchedule, ScheduleDefinition};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub api_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_reply_temperature")]
    pub reply_temperature: f32,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_max_tokens() -> u32 {
    800
}

fn default_reply_temperature() -> f32 {
    0.8
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: default_llm_url(),
            model: default_llm_model(),
            api_key: None,
            timeout_secs: default_llm_timeout_secs(),
            max_tokens: default_max_tokens(),
            reply_temperature: default_reply_temperature(),
        }
    }
}

/// Bounded retry with temperature jitter for external generation calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_temperature_jitter")]
    pub temperature_jitter: f32,
}

/// Upper bound on retries for any external generation call.
pub const MAX_RETRIES: u32 = 2;

fn default_max_retries() -> u32 {
    MAX_RETRIES
}

fn default_temperature_jitter() -> f32 {
    0.15
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            temperature_jitter: default_temperature_jitter(),
        }
    }
}

impl RetryConfig {
    /// Total tries including the first one. Never more than `MAX_RETRIES + 1`.
    pub fn attempts(&self) -> u32 {
        self.max_retries.min(MAX_RETRIES) + 1
    }

    fn clamped(mut self) -> Self {
        if self.max_retries > MAX_RETRIES {
            tracing::warn!(
                "retry.max_retries = {} exceeds the limit, using {}",
                self.max_retries,
                MAX_RETRIES
            );
            self.max_retries = MAX_RETRIES;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComfyUIConfig {
    #[serde(default = "default_comfyui_url")]
    pub api_url: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,
    #[serde(default = "default_sampler")]
    pub sampler: String,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default = "default_image_timeout_secs")]
    pub timeout_secs: u64,
    /// Optional ComfyUI workflow (API JSON or PNG with embedded graph).
    #[serde(default)]
    pub workflow_path: Option<String>,
}

fn default_comfyui_url() -> String {
    "http://127.0.0.1:8188".to_string()
}

fn default_model_name() -> String {
    "v1-5-pruned-emaonly.safetensors".to_string()
}

fn default_width() -> u32 {
    512
}

fn default_height() -> u32 {
    768
}

fn default_steps() -> u32 {
    24
}

fn default_cfg_scale() -> f32 {
    7.0
}

fn default_sampler() -> String {
    "euler".to_string()
}

fn default_scheduler() -> String {
    "normal".to_string()
}

fn default_image_timeout_secs() -> u64 {
    300
}

impl Default for ComfyUIConfig {
    fn default() -> Self {
        Self {
            api_url: default_comfyui_url(),
            model_name: default_model_name(),
            width: default_width(),
            height: default_height(),
            steps: default_steps(),
            cfg_scale: default_cfg_scale(),
            sampler: default_sampler(),
            scheduler: default_scheduler(),
            timeout_secs: default_image_timeout_secs(),
            workflow_path: None,
        }
    }
}

/// Trigger windows. The defaults are empirical and deliberately configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    #[serde(default = "default_daily_dedup_minutes")]
    pub daily_dedup_minutes: i64,
    #[serde(default = "default_weekly_dedup_minutes")]
    pub weekly_dedup_minutes: i64,
    #[serde(default = "default_random_dedup_minutes")]
    pub random_dedup_minutes: i64,
}

fn default_window_minutes() -> i64 {
    5
}

fn default_daily_dedup_minutes() -> i64 {
    60
}

fn default_weekly_dedup_minutes() -> i64 {
    24 * 60
}

fn default_random_dedup_minutes() -> i64 {
    30
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            window_minutes: default_window_minutes(),
            daily_dedup_minutes: default_daily_dedup_minutes(),
            weekly_dedup_minutes: default_weekly_dedup_minutes(),
            random_dedup_minutes: default_random_dedup_minutes(),
        }
    }
}

impl TriggerConfig {
    /// Longest window any event is needed for; older events can be pruned.
    pub fn max_dedup_minutes(&self) -> i64 {
        self.daily_dedup_minutes
            .max(self.weekly_dedup_minutes)
            .max(self.random_dedup_minutes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_significance_threshold")]
    pub significance_threshold: u8,
    #[serde(default = "default_history_messages")]
    pub history_messages: usize,
    #[serde(default = "default_initial_temperature")]
    pub initial_temperature: f32,
    #[serde(default = "default_evolution_temperature")]
    pub evolution_temperature: f32,
}

fn default_significance_threshold() -> u8 {
    7
}

fn default_history_messages() -> usize {
    12
}

fn default_initial_temperature() -> f32 {
    0.5
}

fn default_evolution_temperature() -> f32 {
    0.2
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            significance_threshold: default_significance_threshold(),
            history_messages: default_history_messages(),
            initial_temperature: default_initial_temperature(),
            evolution_temperature: default_evolution_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_locked_weight")]
    pub locked_weight: f32,
    #[serde(default = "default_quality_prefix")]
    pub quality_prefix: String,
    #[serde(default = "default_locked_temperature")]
    pub locked_temperature: f32,
}

fn default_max_prompt_chars() -> usize {
    900
}

fn default_locked_weight() -> f32 {
    1.2
}

fn default_quality_prefix() -> String {
    "masterpiece, best quality, detailed".to_string()
}

fn default_locked_temperature() -> f32 {
    0.1
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            max_prompt_chars: default_max_prompt_chars(),
            locked_weight: default_locked_weight(),
            quality_prefix: default_quality_prefix(),
            locked_temperature: default_locked_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_away_minutes")]
    pub default_away_minutes: i64,
    #[serde(default = "default_max_away_minutes")]
    pub max_away_minutes: i64,
    #[serde(default = "default_follow_up_minutes")]
    pub default_follow_up_minutes: i64,
    #[serde(default = "default_max_drain_rounds")]
    pub max_drain_rounds: usize,
}

fn default_away_minutes() -> i64 {
    15
}

fn default_max_away_minutes() -> i64 {
    240
}

fn default_follow_up_minutes() -> i64 {
    5
}

fn default_max_drain_rounds() -> usize {
    3
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            default_away_minutes: default_away_minutes(),
            max_away_minutes: default_max_away_minutes(),
            default_follow_up_minutes: default_follow_up_minutes(),
            max_drain_rounds: default_max_drain_rounds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_tick_secs() -> u64 {
    300
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: default_tick_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_job_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_job_backoff_secs")]
    pub backoff_secs: u64,
}

fn default_job_attempts() -> u32 {
    4
}

fn default_job_backoff_secs() -> u64 {
    5
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_job_attempts(),
            backoff_secs: default_job_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub comfyui: ComfyUIConfig,
    #[serde(default)]
    pub triggers: TriggerConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub consistency: ConsistencyConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Empty path keeps everything in memory.
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_image_output_dir")]
    pub image_output_dir: String,
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,

    #[serde(default)]
    pub schedules: Vec<RawSchedule>,
}

fn default_database_path() -> String {
    "likeness.db".to_string()
}

fn default_image_output_dir() -> String {
    "scenes".to_string()
}

fn default_fallback_reply() -> String {
    "Sorry, I lost my train of thought for a moment. Could you say that again?".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            retry: RetryConfig::default(),
            comfyui: ComfyUIConfig::default(),
            triggers: TriggerConfig::default(),
            extraction: ExtractionConfig::default(),
            consistency: ConsistencyConfig::default(),
            presence: PresenceConfig::default(),
            scheduler: SchedulerConfig::default(),
            jobs: JobsConfig::default(),
            database_path: default_database_path(),
            image_output_dir: default_image_output_dir(),
            fallback_reply: default_fallback_reply(),
            schedules: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("likeness_config.toml")
    }

    /// Load config from likeness_config.toml (next to executable), falling back to defaults + env vars
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<EngineConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.normalized().with_env_overrides();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::default().with_env_overrides()
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).context("Failed to parse engine config")?;
        Ok(config.normalized())
    }

    /// Pull out-of-range values back inside their limits.
    fn normalized(mut self) -> Self {
        self.retry = self.retry.clamped();
        self
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Validate the configured schedules. Invalid entries are rejected here so
    /// they never reach trigger evaluation.
    pub fn validated_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        self.schedules
            .iter()
            .map(|raw| {
                ScheduleDefinition::try_from(raw.clone())
                    .with_context(|| format!("Schedule '{}' rejected", raw.id))
            })
            .collect()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm.api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm.model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            if !key.trim().is_empty() {
                self.llm.api_key = Some(key);
            }
        }

        if let Ok(url) = env::var("COMFYUI_API_URL") {
            self.comfyui.api_url = url;
        }

        if let Ok(path) = env::var("LIKENESS_DATABASE_PATH") {
            self.database_path = path;
        }

        if let Ok(dir) = env::var("LIKENESS_IMAGE_DIR") {
            if !dir.trim().is_empty() {
                self.image_output_dir = dir;
            }
        }

        if let Ok(interval) = env::var("LIKENESS_TICK_SECS") {
            if let Ok(seconds) = interval.parse() {
                self.scheduler.tick_secs = seconds;
            }
        }

        if let Ok(enabled) = env::var("LIKENESS_ENABLE_SCHEDULER") {
            self.scheduler.enabled = enabled.eq_ignore_ascii_case("1")
                || enabled.eq_ignore_ascii_case("true")
                || enabled.eq_ignore_ascii_case("yes");
        }

        self
    }
}
