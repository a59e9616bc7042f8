//! Recurring initiative loop. Each tick evaluates every conversation in its
//! own task and fires at most one schedule per conversation.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::evaluator::{TriggerContext, TriggerEvaluator};
use crate::config::{SchedulerConfig, TriggerConfig};
use crate::conversation::ConversationState;
use crate::presence::PresenceCoordinator;
use crate::store::Store;

pub struct InitiativeScheduler {
    store: Arc<dyn Store>,
    presence: Arc<PresenceCoordinator>,
    evaluator: Arc<TriggerEvaluator>,
    retention: ChronoDuration,
    tick: Duration,
    cancel: CancellationToken,
}

impl InitiativeScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        presence: Arc<PresenceCoordinator>,
        triggers: TriggerConfig,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            presence,
            retention: ChronoDuration::minutes(triggers.max_dedup_minutes()),
            evaluator: Arc::new(TriggerEvaluator::new(triggers)),
            tick: Duration::from_secs(config.tick_secs.max(1)),
            cancel: CancellationToken::new(),
        }
    }

    /// Run `tick` on an interval until [`stop`](Self::stop) is called.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tracing::info!("Initiative scheduler started (every {:?})", scheduler.tick);
            let mut interval = tokio::time::interval(scheduler.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.tick().await {
                            tracing::warn!("Initiative tick failed: {:#}", e);
                        }
                    }
                }
            }
            tracing::info!("Initiative scheduler stopped");
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Oldest InitiativeEvent age any schedule of these characters still needs.
    fn retention_for(&self, conversations: &[ConversationState]) -> Result<ChronoDuration> {
        let mut retention = self.retention;
        let characters: HashSet<&str> =
            conversations.iter().map(|c| c.character_id.as_str()).collect();
        for character_id in characters {
            for schedule in self.store.schedules_for_character(character_id)? {
                let window = ChronoDuration::minutes(self.evaluator.dedup_minutes(&schedule));
                retention = retention.max(window);
            }
        }
        Ok(retention)
    }

    /// One evaluation pass. Returns how many initiatives fired.
    pub async fn tick(&self) -> Result<usize> {
        let now = Utc::now();
        let conversations = self.store.list_conversations()?;
        let retention = self.retention_for(&conversations)?;
        let pruned = self.store.prune_initiative_events(now - retention)?;
        if pruned > 0 {
            tracing::debug!("Pruned {} initiative events", pruned);
        }

        let mut tasks = JoinSet::new();
        for state in conversations {
            if state.presence.is_away() || state.generating {
                continue;
            }
            let store = self.store.clone();
            let presence = self.presence.clone();
            let evaluator = self.evaluator.clone();
            tasks.spawn(async move {
                let id = state.id.clone();
                match evaluate_conversation(store, presence, evaluator, state).await {
                    Ok(fired) => fired,
                    Err(e) => {
                        tracing::warn!("Initiative evaluation for {} failed: {:#}", id, e);
                        false
                    }
                }
            });
        }

        let mut fired = 0;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => tracing::error!("Initiative task panicked: {}", e),
            }
        }
        Ok(fired)
    }
}

async fn evaluate_conversation(
    store: Arc<dyn Store>,
    presence: Arc<PresenceCoordinator>,
    evaluator: Arc<TriggerEvaluator>,
    state: ConversationState,
) -> Result<bool> {
    let schedules = store.schedules_for_character(&state.character_id)?;
    if schedules.is_empty() {
        return Ok(false);
    }

    let ctx = TriggerContext {
        now: Utc::now(),
        away: state.presence.is_away(),
        generating: state.generating,
        latest_message: store
            .recent_messages(&state.id, 1)?
            .pop()
            .map(|m| (m.role, m.created_at)),
        last_fired: store.last_initiative_events(&state.id)?,
    };
    let selected = {
        let mut rng = rand::rng();
        evaluator.select(&schedules, &ctx, &mut rng).cloned()
    };
    let Some(schedule) = selected else {
        return Ok(false);
    };

    tracing::debug!("Schedule {} selected for {}", schedule.id, state.id);
    presence.fire_initiative(&state.id, &schedule).await
}
