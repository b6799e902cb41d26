//! Playlist rotation — per-folder clip selection for interval schedules.
//!
//! Rotation state (cursor, previous pick, last trigger epoch) lives behind a
//! mutex keyed by folder, and can be exported for persistence so sequential
//! cursors survive a restart.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// How a folder rotates through its eligible clips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationMode {
    /// Advance a persisted cursor through the list in stored order.
    Sequential,
    /// Uniform random pick, excluding the immediately previous selection.
    Random,
    /// Sequential, but advances at most once per distinct trigger.
    #[serde(rename = "single-rotate")]
    SingleRotate,
}

impl Default for RotationMode {
    fn default() -> Self {
        RotationMode::Sequential
    }
}

impl fmt::Display for RotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationMode::Sequential => write!(f, "sequential"),
            RotationMode::Random => write!(f, "random"),
            RotationMode::SingleRotate => write!(f, "single-rotate"),
        }
    }
}

impl RotationMode {
    /// Parse a mode from a string (case-insensitive, accepts hyphens or underscores).
    pub fn from_str_loose(s: &str) -> Result<Self, String> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "sequential" => Ok(RotationMode::Sequential),
            "random" | "shuffle" => Ok(RotationMode::Random),
            "single-rotate" | "single" => Ok(RotationMode::SingleRotate),
            _ => Err(format!(
                "Unknown rotation mode '{}'. Expected: sequential, random, single-rotate",
                s
            )),
        }
    }
}

/// Per-folder playlist settings, owned by the tenant/zone configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSettings {
    pub folder: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between folder-driven triggers, minutes part.
    #[serde(default)]
    pub interval_minutes: u32,
    /// Interval between folder-driven triggers, seconds part.
    #[serde(default)]
    pub interval_seconds: u32,
    #[serde(default)]
    pub mode: RotationMode,
    /// Eligible clips, a subset of the folder's contents.
    #[serde(default)]
    pub clips: Vec<String>,
    /// Reject concurrent scheduled playback in the target zone.
    #[serde(default)]
    pub prevent_overlap: bool,
}

fn default_true() -> bool {
    true
}

impl FolderSettings {
    pub fn new(folder: &str, mode: RotationMode, clips: &[&str]) -> Self {
        FolderSettings {
            folder: folder.to_string(),
            enabled: true,
            interval_minutes: 0,
            interval_seconds: 0,
            mode,
            clips: clips.iter().map(|c| c.to_string()).collect(),
            prevent_overlap: false,
        }
    }

    /// Minutes and seconds combined into one integer-seconds period.
    pub fn period_secs(&self) -> i64 {
        self.interval_minutes as i64 * 60 + self.interval_seconds as i64
    }

    /// An enabled folder with an empty clip set is inert.
    pub fn is_inert(&self) -> bool {
        !self.enabled || self.clips.is_empty()
    }
}

/// Mutable rotation position for one folder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotationState {
    pub cursor: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_clip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_epoch: Option<i64>,
}

/// Selects the next clip per folder, maintaining rotation state.
pub struct Rotator {
    states: Mutex<HashMap<String, RotationState>>,
}

impl Rotator {
    pub fn new() -> Self {
        Rotator {
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Pick the next clip for a folder. Returns `None` when the folder is
    /// disabled or its eligible set is empty; callers treat that as "nothing
    /// to play" and skip silently.
    pub fn select_next(&self, settings: &FolderSettings, trigger_epoch: i64) -> Option<String> {
        if settings.is_inert() {
            return None;
        }
        let mut states = self.states.lock().unwrap();
        let state = states.entry(settings.folder.clone()).or_default();
        let clip = pick(settings.mode, &settings.clips, state, trigger_epoch);
        state.last_clip = Some(clip.clone());
        state.last_epoch = Some(trigger_epoch);
        Some(clip)
    }

    /// Rotation for an interval schedule's inline clip list. Keyed separately
    /// from folders; `avoid_repeat` selects random-without-repeat, otherwise
    /// the list rotates sequentially.
    pub fn select_inline(
        &self,
        key: &str,
        clips: &[String],
        avoid_repeat: bool,
        trigger_epoch: i64,
    ) -> Option<String> {
        if clips.is_empty() {
            return None;
        }
        let mode = if avoid_repeat {
            RotationMode::Random
        } else {
            RotationMode::Sequential
        };
        let mut states = self.states.lock().unwrap();
        let state = states.entry(format!("inline:{}", key)).or_default();
        let clip = pick(mode, clips, state, trigger_epoch);
        state.last_clip = Some(clip.clone());
        state.last_epoch = Some(trigger_epoch);
        Some(clip)
    }

    /// Snapshot all rotation state for persistence.
    pub fn export(&self) -> HashMap<String, RotationState> {
        self.states.lock().unwrap().clone()
    }

    /// Restore rotation state from a persisted snapshot.
    pub fn import(&self, states: HashMap<String, RotationState>) {
        let mut current = self.states.lock().unwrap();
        for (folder, state) in states {
            current.entry(folder).or_insert(state);
        }
    }
}

impl Default for Rotator {
    fn default() -> Self {
        Self::new()
    }
}

fn pick(
    mode: RotationMode,
    clips: &[String],
    state: &mut RotationState,
    trigger_epoch: i64,
) -> String {
    match mode {
        RotationMode::Sequential => advance(clips, state),
        RotationMode::Random => {
            if clips.len() == 1 {
                return clips[0].clone();
            }
            let candidates: Vec<&String> = clips
                .iter()
                .filter(|c| Some(c.as_str()) != state.last_clip.as_deref())
                .collect();
            // A list of duplicates can leave nothing to exclude against;
            // fall back to the full list rather than panic on an empty range.
            if candidates.is_empty() {
                return clips[fastrand::usize(..clips.len())].clone();
            }
            candidates[fastrand::usize(..candidates.len())].clone()
        }
        RotationMode::SingleRotate => {
            // Idempotent within one trigger: repeated calls for the same
            // epoch return the previous pick without advancing.
            if state.last_epoch == Some(trigger_epoch) {
                if let Some(last) = &state.last_clip {
                    return last.clone();
                }
            }
            advance(clips, state)
        }
    }
}

fn advance(clips: &[String], state: &mut RotationState) -> String {
    let index = state.cursor % clips.len();
    state.cursor = (index + 1) % clips.len();
    clips[index].clone()
}
