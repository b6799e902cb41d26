//! Schedule evaluator — asks "what fires now" across all enabled schedules
//! for a tenant and turns due triggers into execution intents.
//!
//! Correctness rests on the execution ledger: the evaluator claims every
//! trigger before emitting intents, so concurrent or repeated evaluation
//! passes (several observers, a server timer plus a manual "check now")
//! produce each intent at most once. A claim conflict is a normal outcome,
//! not an error.

use crate::ledger::{ClaimKey, ExecutionLedger};
use crate::recurrence::{due_triggers, next_fire_time};
use crate::rotation::{FolderSettings, Rotator};
use crate::schedule::{Priority, Schedule, Timing};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;

/// Default evaluation cadence in seconds. The ledger's epoch bucketing and
/// the recurrence tick window both key off this.
pub const EVAL_TICK_SECS: i64 = 30;

/// Who initiated a playback intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOrigin {
    /// Produced by the evaluator/ledger path.
    Scheduled,
    /// Manual trigger, submitted straight to the arbiter.
    Instant,
}

impl fmt::Display for TriggerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerOrigin::Scheduled => write!(f, "scheduled"),
            TriggerOrigin::Instant => write!(f, "instant"),
        }
    }
}

impl TriggerOrigin {
    pub fn from_str_loose(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "scheduled" => Ok(TriggerOrigin::Scheduled),
            "instant" | "manual" => Ok(TriggerOrigin::Instant),
            _ => Err(format!(
                "Unknown trigger origin '{}'. Expected: scheduled, instant",
                s
            )),
        }
    }
}

/// A claimed trigger bound to one target zone, ready for arbitration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionIntent {
    pub schedule: u32,
    pub zone: String,
    pub clip: String,
    pub origin: TriggerOrigin,
    pub priority: Priority,
    /// From the owning folder's overlap-prevention flag.
    pub prevent_overlap: bool,
}

impl ExecutionIntent {
    /// A manual/instant intent. Bypasses recurrence and the ledger.
    pub fn instant(zone: &str, clip: &str) -> Self {
        ExecutionIntent {
            schedule: 0,
            zone: zone.to_string(),
            clip: clip.to_string(),
            origin: TriggerOrigin::Instant,
            priority: Priority::HIGH,
            prevent_overlap: false,
        }
    }
}

/// Tenant/zone directory collaborator. Schedule and folder CRUD live
/// elsewhere; this core only reads.
pub trait ScheduleDirectory: Send + Sync {
    fn enabled_schedules(&self, tenant: &str) -> Vec<Schedule>;

    /// Target zones for a schedule. Defaults to the schedule's own list.
    fn zones_for(&self, schedule: &Schedule) -> Vec<String> {
        schedule.zones.clone()
    }

    fn folder_settings(&self, folder: &str) -> Option<crate::rotation::FolderSettings>;
}

/// Observer-facing countdown row. Informational only: display code must
/// never treat a countdown reaching zero as an execution trigger — firing is
/// always driven by the evaluator/ledger path.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleCountdown {
    pub schedule: u32,
    pub name: String,
    pub seconds_remaining: i64,
}

/// Where a trigger's clip comes from.
enum ClipSource {
    /// The trigger names its clip (timeline and datetime slots).
    Fixed(String),
    /// Folder-backed interval rotation.
    Folder(FolderSettings),
    /// The schedule's inline clip list.
    Inline(Vec<String>, bool),
}

/// Polled orchestration core: recurrence, claim, clip selection.
pub struct Evaluator {
    directory: Arc<dyn ScheduleDirectory>,
    ledger: Arc<ExecutionLedger>,
    rotator: Arc<Rotator>,
    tick_secs: i64,
    /// Overlay of last-fired instants observed in this process. The
    /// directory is a read-only collaborator here, so the evaluator keeps
    /// its own freshness record on top of directory-provided values.
    last_fired: Mutex<HashMap<u32, NaiveDateTime>>,
}

impl Evaluator {
    pub fn new(
        directory: Arc<dyn ScheduleDirectory>,
        ledger: Arc<ExecutionLedger>,
        rotator: Arc<Rotator>,
    ) -> Self {
        Evaluator {
            directory,
            ledger,
            rotator,
            tick_secs: EVAL_TICK_SECS,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_tick(mut self, tick_secs: i64) -> Self {
        self.tick_secs = tick_secs;
        self
    }

    pub fn tick_secs(&self) -> i64 {
        self.tick_secs
    }

    pub fn directory(&self) -> Arc<dyn ScheduleDirectory> {
        self.directory.clone()
    }

    /// One evaluation pass. Re-entrant: a second call with no schedule state
    /// change yields zero new intents because all claims are already taken.
    /// A single schedule's failure never stops the pass.
    pub fn evaluate(&self, tenant: &str, now: NaiveDateTime) -> Vec<ExecutionIntent> {
        let mut intents = Vec::new();
        for schedule in self.directory.enabled_schedules(tenant) {
            let result = catch_unwind(AssertUnwindSafe(|| {
                self.evaluate_schedule(&schedule, now)
            }));
            match result {
                Ok(mut emitted) => intents.append(&mut emitted),
                Err(_) => {
                    warn!(
                        "schedule {} '{}' panicked during evaluation; skipping this pass",
                        schedule.id, schedule.name
                    );
                }
            }
        }
        intents
    }

    fn evaluate_schedule(&self, schedule: &Schedule, now: NaiveDateTime) -> Vec<ExecutionIntent> {
        let effective = self.with_observed_last_fired(schedule);
        let mut intents = Vec::new();

        for trigger in due_triggers(&effective, now, self.tick_secs) {
            let source = match &trigger.clip {
                Some(clip) => Some(ClipSource::Fixed(clip.clone())),
                None => self.interval_clip_source(&effective),
            };
            // A trigger with nothing to play is skipped without consuming
            // a claim.
            let Some(source) = source else { continue };

            // Rotation-driven triggers claim on the trigger itself (empty
            // clip component); the clip is chosen only after the claim is
            // won, so a lost or restored claim leaves the rotation cursor
            // untouched and the epoch can never re-fire with another clip.
            let claim_clip = match &source {
                ClipSource::Fixed(clip) => clip.as_str(),
                _ => "",
            };
            let key = ClaimKey::new(effective.id, claim_clip, trigger.epoch);
            if !self.ledger.try_claim(key, now) {
                // Duplicate trigger correctly suppressed.
                debug!(
                    "schedule {} epoch {} already claimed",
                    effective.id, trigger.epoch
                );
                continue;
            }
            self.last_fired
                .lock()
                .unwrap()
                .insert(effective.id, now);

            let (clip, prevent_overlap) = match source {
                ClipSource::Fixed(clip) => (clip, false),
                ClipSource::Folder(settings) => {
                    match self.rotator.select_next(&settings, trigger.epoch) {
                        Some(clip) => (clip, settings.prevent_overlap),
                        None => continue,
                    }
                }
                ClipSource::Inline(clips, avoid_repeat) => {
                    match self.rotator.select_inline(
                        &effective.id.to_string(),
                        &clips,
                        avoid_repeat,
                        trigger.epoch,
                    ) {
                        Some(clip) => (clip, false),
                        None => continue,
                    }
                }
            };

            for zone in self.directory.zones_for(&effective) {
                intents.push(ExecutionIntent {
                    schedule: effective.id,
                    zone,
                    clip: clip.clone(),
                    origin: TriggerOrigin::Scheduled,
                    priority: effective.priority,
                    prevent_overlap,
                });
            }
        }
        intents
    }

    /// Where an interval trigger's clip will come from: folder rotation when
    /// the schedule is folder-backed, inline rotation otherwise. `None` when
    /// nothing could play (missing or inert folder, empty inline list).
    fn interval_clip_source(&self, schedule: &Schedule) -> Option<ClipSource> {
        let Timing::Interval(iv) = &schedule.timing else {
            return None;
        };
        if let Some(folder) = &iv.folder {
            let settings = self.directory.folder_settings(folder)?;
            if settings.is_inert() {
                return None;
            }
            return Some(ClipSource::Folder(settings));
        }
        if iv.clips.is_empty() {
            return None;
        }
        Some(ClipSource::Inline(iv.clips.clone(), iv.avoid_repeat))
    }

    fn with_observed_last_fired(&self, schedule: &Schedule) -> Schedule {
        let observed = self.last_fired.lock().unwrap().get(&schedule.id).copied();
        let mut effective = schedule.clone();
        effective.last_fired = match (effective.last_fired, observed) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        effective
    }

    /// Read-only countdown projection for observers, computed purely from
    /// schedule definitions and `now`. Claims nothing, fires nothing.
    pub fn countdowns(&self, tenant: &str, now: NaiveDateTime) -> Vec<ScheduleCountdown> {
        self.directory
            .enabled_schedules(tenant)
            .iter()
            .filter_map(|schedule| {
                let effective = self.with_observed_last_fired(schedule);
                let next = next_fire_time(&effective, now)?;
                Some(ScheduleCountdown {
                    schedule: effective.id,
                    name: effective.name.clone(),
                    seconds_remaining: (next - now).num_seconds().max(0),
                })
            })
            .collect()
    }
}
