//! Decides whether a schedule should fire for a conversation right now.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDateTime, NaiveTime, Utc};
use rand::Rng;
use std::collections::HashMap;

use super::{ScheduleDefinition, TriggerConditions};
use crate::config::TriggerConfig;
use crate::conversation::Role;

/// Snapshot of what the evaluator needs to know about one conversation.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub now: DateTime<Utc>,
    pub away: bool,
    pub generating: bool,
    pub latest_message: Option<(Role, DateTime<Utc>)>,
    /// Most recent InitiativeEvent per schedule id for this conversation.
    pub last_fired: HashMap<String, DateTime<Utc>>,
}

impl TriggerContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            away: false,
            generating: false,
            latest_message: None,
            last_fired: HashMap::new(),
        }
    }
}

pub struct TriggerEvaluator {
    config: TriggerConfig,
}

impl TriggerEvaluator {
    pub fn new(config: TriggerConfig) -> Self {
        Self { config }
    }

    /// How long an InitiativeEvent blocks `schedule` from firing again.
    pub fn dedup_minutes(&self, schedule: &ScheduleDefinition) -> i64 {
        match &schedule.conditions {
            TriggerConditions::Daily { .. } => self.config.daily_dedup_minutes,
            TriggerConditions::Weekly { .. } => self.config.weekly_dedup_minutes,
            TriggerConditions::Random { .. } => self.config.random_dedup_minutes,
            TriggerConditions::Contextual { inactivity_minutes } => *inactivity_minutes,
        }
    }

    pub fn should_trigger<R: Rng>(
        &self,
        schedule: &ScheduleDefinition,
        ctx: &TriggerContext,
        rng: &mut R,
    ) -> bool {
        if !schedule.active || ctx.away || ctx.generating {
            return false;
        }

        let last_fired = ctx.last_fired.get(&schedule.id).copied();
        let dedup = ChronoDuration::minutes(self.dedup_minutes(schedule));
        if last_fired.is_some_and(|at| ctx.now - at < dedup) {
            return false;
        }

        match &schedule.conditions {
            TriggerConditions::Daily { times } => {
                let local = local_time(ctx.now, schedule.utc_offset_minutes);
                times
                    .iter()
                    .any(|t| matching_occurrence(local, *t, self.config.window_minutes).is_some())
            }
            TriggerConditions::Weekly { days, times } => {
                let local = local_time(ctx.now, schedule.utc_offset_minutes);
                times.iter().any(|t| {
                    matching_occurrence(local, *t, self.config.window_minutes)
                        .is_some_and(|occurrence| days.contains(&occurrence.weekday()))
                })
            }
            TriggerConditions::Random { probability } => rng.random::<f64>() < *probability,
            TriggerConditions::Contextual { inactivity_minutes } => {
                let Some((role, at)) = ctx.latest_message else {
                    return false;
                };
                if role != Role::User {
                    return false;
                }
                ctx.now - at >= ChronoDuration::minutes(*inactivity_minutes)
            }
        }
    }

    /// Pick the single schedule to fire this cycle: highest priority first,
    /// lowest id on ties. Schedules are evaluated in that order and the first
    /// eligible one wins, so lower-priority random rolls are never spent.
    pub fn select<'a, R: Rng>(
        &self,
        schedules: &'a [ScheduleDefinition],
        ctx: &TriggerContext,
        rng: &mut R,
    ) -> Option<&'a ScheduleDefinition> {
        let mut ordered: Vec<&ScheduleDefinition> = schedules.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        ordered
            .into_iter()
            .find(|schedule| self.should_trigger(schedule, ctx, rng))
    }
}

fn local_time(now: DateTime<Utc>, offset_minutes: i32) -> NaiveDateTime {
    now.naive_utc() + ChronoDuration::minutes(offset_minutes as i64)
}

/// The occurrence of `time` (yesterday, today or tomorrow) lying within
/// `window_minutes` of `local`, if any. Handles windows that wrap midnight.
fn matching_occurrence(
    local: NaiveDateTime,
    time: NaiveTime,
    window_minutes: i64,
) -> Option<NaiveDateTime> {
    let window = ChronoDuration::minutes(window_minutes);
    let today = local.date();
    [-1i64, 0, 1].into_iter().find_map(|day_offset| {
        let date = today + ChronoDuration::days(day_offset);
        let occurrence = date.and_time(time);
        let delta = local - occurrence;
        (delta <= window && delta >= -window).then_some(occurrence)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleKind;
    use chrono::{TimeZone, Weekday};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn schedule(id: &str, priority: u8, conditions: TriggerConditions) -> ScheduleDefinition {
        ScheduleDefinition {
            id: id.to_string(),
            character_id: "alice".to_string(),
            conditions,
            priority,
            active: true,
            utc_offset_minutes: 0,
            message_hint: None,
        }
    }

    fn daily_at(hour: u32, minute: u32) -> ScheduleDefinition {
        schedule(
            "daily",
            5,
            TriggerConditions::Daily {
                times: vec![NaiveTime::from_hms_opt(hour, minute, 0).expect("time")],
            },
        )
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().expect("valid date")
    }

    fn evaluator() -> TriggerEvaluator {
        TriggerEvaluator::new(TriggerConfig::default())
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn daily_fires_inside_window_only() {
        let eval = evaluator();
        let sched = daily_at(9, 0);
        let mut rng = rng();

        assert!(eval.should_trigger(&sched, &TriggerContext::at(utc(2026, 3, 2, 9, 4)), &mut rng));
        assert!(eval.should_trigger(&sched, &TriggerContext::at(utc(2026, 3, 2, 8, 55)), &mut rng));
        assert!(!eval.should_trigger(&sched, &TriggerContext::at(utc(2026, 3, 2, 9, 6)), &mut rng));
        assert!(!eval.should_trigger(&sched, &TriggerContext::at(utc(2026, 3, 2, 14, 0)), &mut rng));
    }

    #[test]
    fn daily_window_wraps_midnight() {
        let eval = evaluator();
        let sched = daily_at(23, 58);
        let ctx = TriggerContext::at(utc(2026, 3, 3, 0, 2));
        assert!(eval.should_trigger(&sched, &ctx, &mut rng()));
    }

    #[test]
    fn daily_dedup_window_blocks_recent_refire() {
        let eval = evaluator();
        let sched = daily_at(9, 0);
        let now = utc(2026, 3, 2, 9, 1);

        let mut ctx = TriggerContext::at(now);
        ctx.last_fired
            .insert(sched.id.clone(), now - ChronoDuration::minutes(10));
        assert!(!eval.should_trigger(&sched, &ctx, &mut rng()));

        ctx.last_fired
            .insert(sched.id.clone(), now - ChronoDuration::minutes(61));
        assert!(eval.should_trigger(&sched, &ctx, &mut rng()));
    }

    #[test]
    fn weekly_requires_matching_weekday() {
        let eval = evaluator();
        let sched = schedule(
            "weekly",
            5,
            TriggerConditions::Weekly {
                days: vec![Weekday::Mon],
                times: vec![NaiveTime::from_hms_opt(18, 0, 0).expect("time")],
            },
        );
        // 2026-03-02 is a Monday.
        assert!(eval.should_trigger(&sched, &TriggerContext::at(utc(2026, 3, 2, 18, 3)), &mut rng()));
        assert!(!eval.should_trigger(&sched, &TriggerContext::at(utc(2026, 3, 3, 18, 3)), &mut rng()));

        let mut ctx = TriggerContext::at(utc(2026, 3, 2, 18, 3));
        ctx.last_fired
            .insert(sched.id.clone(), utc(2026, 3, 2, 6, 0));
        assert!(!eval.should_trigger(&sched, &ctx, &mut rng()));
    }

    #[test]
    fn utc_offset_shifts_local_time() {
        let eval = evaluator();
        let mut sched = daily_at(9, 0);
        sched.utc_offset_minutes = 120;
        assert!(eval.should_trigger(&sched, &TriggerContext::at(utc(2026, 3, 2, 7, 0)), &mut rng()));
        assert!(!eval.should_trigger(&sched, &TriggerContext::at(utc(2026, 3, 2, 9, 0)), &mut rng()));
    }

    #[test]
    fn random_zero_probability_never_fires() {
        let eval = evaluator();
        let sched = schedule("never", 5, TriggerConditions::Random { probability: 0.0 });
        let ctx = TriggerContext::at(utc(2026, 3, 2, 12, 0));
        let mut rng = rng();
        for _ in 0..1000 {
            assert!(!eval.should_trigger(&sched, &ctx, &mut rng));
        }
    }

    #[test]
    fn random_certain_probability_fires_then_respects_window() {
        let eval = evaluator();
        let sched = schedule("always", 5, TriggerConditions::Random { probability: 1.0 });
        let now = utc(2026, 3, 2, 12, 0);
        let mut ctx = TriggerContext::at(now);
        assert!(eval.should_trigger(&sched, &ctx, &mut rng()));

        ctx.last_fired.insert(sched.id.clone(), now);
        ctx.now = now + ChronoDuration::minutes(29);
        assert!(!eval.should_trigger(&sched, &ctx, &mut rng()));

        ctx.now = now + ChronoDuration::minutes(31);
        assert!(eval.should_trigger(&sched, &ctx, &mut rng()));
    }

    #[test]
    fn contextual_requires_stale_user_message() {
        let eval = evaluator();
        let sched = schedule(
            "nudge",
            5,
            TriggerConditions::Contextual {
                inactivity_minutes: 60,
            },
        );
        let now = utc(2026, 3, 2, 12, 0);
        let mut ctx = TriggerContext::at(now);
        assert!(!eval.should_trigger(&sched, &ctx, &mut rng()), "no messages yet");

        ctx.latest_message = Some((Role::User, now - ChronoDuration::minutes(30)));
        assert!(!eval.should_trigger(&sched, &ctx, &mut rng()), "not inactive long enough");

        ctx.latest_message = Some((Role::Character, now - ChronoDuration::minutes(90)));
        assert!(!eval.should_trigger(&sched, &ctx, &mut rng()), "character spoke last");

        ctx.latest_message = Some((Role::User, now - ChronoDuration::minutes(90)));
        assert!(eval.should_trigger(&sched, &ctx, &mut rng()));

        ctx.last_fired
            .insert(sched.id.clone(), now - ChronoDuration::minutes(20));
        assert!(!eval.should_trigger(&sched, &ctx, &mut rng()), "fired recently");
    }

    #[test]
    fn contextual_dedup_follows_inactivity() {
        let eval = evaluator();
        let nudge = schedule(
            "nudge",
            5,
            TriggerConditions::Contextual {
                inactivity_minutes: 2880,
            },
        );
        assert_eq!(eval.dedup_minutes(&nudge), 2880);
        assert_eq!(eval.dedup_minutes(&daily_at(9, 0)), TriggerConfig::default().daily_dedup_minutes);
    }

    #[test]
    fn global_guards_block_every_type() {
        let eval = evaluator();
        let sched = schedule("always", 5, TriggerConditions::Random { probability: 1.0 });
        let now = utc(2026, 3, 2, 12, 0);

        let mut ctx = TriggerContext::at(now);
        ctx.away = true;
        assert!(!eval.should_trigger(&sched, &ctx, &mut rng()));

        let mut ctx = TriggerContext::at(now);
        ctx.generating = true;
        assert!(!eval.should_trigger(&sched, &ctx, &mut rng()));

        let mut inactive = sched.clone();
        inactive.active = false;
        assert!(!eval.should_trigger(&inactive, &TriggerContext::at(now), &mut rng()));
    }

    #[test]
    fn select_prefers_priority_then_lowest_id() {
        let eval = evaluator();
        let schedules = vec![
            schedule("b", 3, TriggerConditions::Random { probability: 1.0 }),
            schedule("c", 8, TriggerConditions::Random { probability: 1.0 }),
            schedule("a", 8, TriggerConditions::Random { probability: 1.0 }),
            schedule("z", 10, TriggerConditions::Random { probability: 0.0 }),
        ];
        let ctx = TriggerContext::at(utc(2026, 3, 2, 12, 0));
        let chosen = eval.select(&schedules, &ctx, &mut rng()).expect("one fires");
        assert_eq!(chosen.id, "a");
        assert_eq!(chosen.kind(), ScheduleKind::Random);
    }

    #[test]
    fn select_returns_none_when_nothing_eligible() {
        let eval = evaluator();
        let schedules = vec![daily_at(9, 0)];
        let ctx = TriggerContext::at(utc(2026, 3, 2, 15, 0));
        assert!(eval.select(&schedules, &ctx, &mut rng()).is_none());
    }
}
