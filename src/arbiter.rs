//! Playback arbiter — per-zone ownership of "what is playing right now".
//!
//! Each zone runs its own `Idle -> Playing -> Idle` state machine behind its
//! own mutex, so zones proceed independently. The arbiter hands out
//! monotonically increasing session tokens; completion callbacks carrying a
//! stale token are discarded, which is what makes preemption and manual stop
//! race-free without holding locks across playback.

use crate::evaluator::{ExecutionIntent, TriggerOrigin};
use crate::schedule::Priority;
use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Observer-facing zone state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneStatus {
    Idle,
    /// A scheduled announcement owns the zone.
    Playing,
    /// An instant announcement owns the zone, playing over whatever the zone
    /// would otherwise be doing.
    Ducking,
}

/// Why a scheduled intent was turned away. Rejection is a normal outcome;
/// the ledger claim behind the intent stays consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Overlap,
}

/// Outcome of submitting an intent for a zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The intent owns the zone. `preempted` carries the token of the session
    /// that was displaced, if any; the caller must stop its playback.
    Admitted { token: u64, preempted: Option<u64> },
    /// Playback in progress; the intent waits and is promoted on completion.
    Queued,
    Rejected(RejectReason),
}

#[derive(Debug, Clone)]
struct CurrentSession {
    token: u64,
    clip: String,
    origin: TriggerOrigin,
    priority: Priority,
}

#[derive(Debug, Default)]
struct ZoneState {
    current: Option<CurrentSession>,
    queued: Option<ExecutionIntent>,
}

impl ZoneState {
    fn status(&self) -> ZoneStatus {
        match &self.current {
            None => ZoneStatus::Idle,
            Some(session) => match session.origin {
                TriggerOrigin::Scheduled => ZoneStatus::Playing,
                TriggerOrigin::Instant => ZoneStatus::Ducking,
            },
        }
    }
}

/// One row of the observer snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneSnapshot {
    pub zone: String,
    pub status: ZoneStatus,
    pub clip: Option<String>,
    pub origin: Option<TriggerOrigin>,
    pub priority: Option<Priority>,
    pub queued_clip: Option<String>,
}

/// Grants and revokes playback ownership per zone.
pub struct PlaybackArbiter {
    zones: Mutex<HashMap<String, Arc<Mutex<ZoneState>>>>,
    next_token: AtomicU64,
}

impl PlaybackArbiter {
    pub fn new() -> Self {
        PlaybackArbiter {
            zones: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    fn zone_state(&self, zone: &str) -> Arc<Mutex<ZoneState>> {
        let mut zones = self.zones.lock().unwrap();
        zones
            .entry(zone.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ZoneState::default())))
            .clone()
    }

    fn issue_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::SeqCst)
    }

    /// Submit an intent for its target zone.
    ///
    /// Instant intents always win, displacing any current session. A second
    /// scheduled intent while the zone is busy is rejected when the intent
    /// carries `prevent_overlap`, queued otherwise. The queue holds a single
    /// intent: a later scheduled intent replaces an already-queued one, and
    /// the displaced intent is dropped — its trigger already counted as
    /// fired when the ledger claim was taken.
    pub fn admit(&self, intent: &ExecutionIntent) -> Admission {
        let state = self.zone_state(&intent.zone);
        let mut state = state.lock().unwrap();

        match intent.origin {
            TriggerOrigin::Instant => {
                let preempted = state.current.as_ref().map(|s| s.token);
                if let Some(token) = preempted {
                    info!(
                        "zone '{}': instant clip '{}' preempts session {}",
                        intent.zone, intent.clip, token
                    );
                }
                let token = self.issue_token();
                state.current = Some(CurrentSession {
                    token,
                    clip: intent.clip.clone(),
                    origin: TriggerOrigin::Instant,
                    priority: intent.priority,
                });
                Admission::Admitted { token, preempted }
            }
            TriggerOrigin::Scheduled => {
                if state.current.is_some() {
                    if intent.prevent_overlap {
                        debug!(
                            "zone '{}': clip '{}' rejected, zone busy and overlap prevention on",
                            intent.zone, intent.clip
                        );
                        return Admission::Rejected(RejectReason::Overlap);
                    }
                    debug!(
                        "zone '{}': clip '{}' queued behind current session",
                        intent.zone, intent.clip
                    );
                    if let Some(displaced) = state.queued.replace(intent.clone()) {
                        debug!(
                            "zone '{}': queued clip '{}' displaced; its trigger stays fired",
                            intent.zone, displaced.clip
                        );
                    }
                    return Admission::Queued;
                }
                let token = self.issue_token();
                state.current = Some(CurrentSession {
                    token,
                    clip: intent.clip.clone(),
                    origin: TriggerOrigin::Scheduled,
                    priority: intent.priority,
                });
                Admission::Admitted { token, preempted: None }
            }
        }
    }

    /// Record natural completion of the session holding `token`. Stale tokens
    /// (preempted or stopped sessions) are discarded. Returns the queued
    /// intent, if any, for the caller to resubmit now that the zone is idle.
    pub fn complete(&self, zone: &str, token: u64) -> Option<ExecutionIntent> {
        let state = self.zone_state(zone);
        let mut state = state.lock().unwrap();

        match &state.current {
            Some(session) if session.token == token => {
                state.current = None;
                state.queued.take()
            }
            _ => {
                debug!("zone '{}': stale completion for token {}", zone, token);
                None
            }
        }
    }

    /// Reset the zone immediately: the current token becomes stale and any
    /// queued intent is dropped. Returns the invalidated token so the caller
    /// can stop its playback.
    pub fn stop(&self, zone: &str) -> Option<u64> {
        let state = self.zone_state(zone);
        let mut state = state.lock().unwrap();
        state.queued = None;
        state.current.take().map(|session| session.token)
    }

    /// Token of the session currently owning `zone`, if any.
    pub fn current_token(&self, zone: &str) -> Option<u64> {
        let state = self.zone_state(zone);
        let token = state.lock().unwrap().current.as_ref().map(|s| s.token);
        token
    }

    /// Snapshot of every zone the arbiter has seen, sorted by name.
    pub fn zone_snapshot(&self) -> Vec<ZoneSnapshot> {
        let zones = self.zones.lock().unwrap();
        let mut rows: Vec<ZoneSnapshot> = zones
            .iter()
            .map(|(zone, state)| {
                let state = state.lock().unwrap();
                ZoneSnapshot {
                    zone: zone.clone(),
                    status: state.status(),
                    clip: state.current.as_ref().map(|s| s.clip.clone()),
                    origin: state.current.as_ref().map(|s| s.origin),
                    priority: state.current.as_ref().map(|s| s.priority),
                    queued_clip: state.queued.as_ref().map(|i| i.clip.clone()),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.zone.cmp(&b.zone));
        rows
    }
}

impl Default for PlaybackArbiter {
    fn default() -> Self {
        Self::new()
    }
}
