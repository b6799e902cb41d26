//! Playback session — the state machine that actually attempts to render
//! audio for an admitted intent.
//!
//! A session resolves its clip to playable audio (with one regeneration
//! attempt and a bounded poll budget), then plays it through the zone's
//! output. When the environment refuses to render, an explicit ordered list
//! of unlock strategies is tried, each at most once per session. All waits
//! are bounded; nothing here blocks indefinitely.

use crate::content::{ClipAudio, ContentStore};
use crate::evaluator::TriggerOrigin;
use crate::output::{PlayError, ZoneOutput};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

/// Default number of short polls while waiting for regeneration.
pub const CONTENT_POLL_BUDGET: u32 = 5;

/// Default delay between content polls.
pub const CONTENT_POLL_DELAY: Duration = Duration::from_millis(400);

/// User-visible session failure. The two variants demand different
/// remediation, so they are surfaced distinctly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    /// The clip has no audio and regeneration did not produce one in time.
    /// Retryable later.
    ContentUnavailable,
    /// The output environment refused to render; requires external
    /// remediation such as a user gesture.
    PlaybackBlocked,
    /// Device-level failure unrelated to autoplay policy.
    Output(String),
}

impl std::fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionFailure::ContentUnavailable => write!(f, "content unavailable"),
            SessionFailure::PlaybackBlocked => {
                write!(f, "playback blocked — user interaction required")
            }
            SessionFailure::Output(msg) => write!(f, "output error: {}", msg),
        }
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    ResolvingContent,
    Playing,
    Completed,
    Failed(SessionFailure),
}

/// One playback attempt for one zone. Created when the arbiter admits an
/// intent; the token invalidates stale completion callbacks.
#[derive(Debug, Clone)]
pub struct PlaybackSession {
    pub zone: String,
    pub clip: String,
    pub token: u64,
    pub origin: TriggerOrigin,
    state: SessionState,
}

impl PlaybackSession {
    pub fn new(zone: &str, clip: &str, token: u64, origin: TriggerOrigin) -> Self {
        PlaybackSession {
            zone: zone.to_string(),
            clip: clip.to_string(),
            token,
            origin,
            state: SessionState::ResolvingContent,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SessionState::ResolvingContent | SessionState::Playing
        )
    }

    pub fn complete(&mut self) {
        self.state = SessionState::Completed;
    }

    fn fail(&mut self, reason: SessionFailure) {
        self.state = SessionState::Failed(reason);
    }
}

// ── Unlock ladder ────────────────────────────────────────────────────────────

/// One strategy for satisfying the output environment's gesture requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStep {
    /// Resume the shared audio output context.
    ResumeContext,
    /// Play a near-silent primer clip.
    PlayPrimer,
    /// Reload and retry the target clip.
    ReloadClip,
    /// Construct a fresh playback handle and retry once more.
    FreshHandle,
}

/// The ladder, in the order attempted. Each step runs at most once per
/// session.
pub const UNLOCK_LADDER: [UnlockStep; 4] = [
    UnlockStep::ResumeContext,
    UnlockStep::PlayPrimer,
    UnlockStep::ReloadClip,
    UnlockStep::FreshHandle,
];

/// Apply one unlock step and retry playback.
fn attempt_unlock(
    output: &dyn ZoneOutput,
    step: UnlockStep,
    zone: &str,
    url: &str,
) -> Result<u64, PlayError> {
    match step {
        UnlockStep::ResumeContext => {
            // A failed resume still gets its retry; the next rung handles it.
            let _ = output.resume_context();
            output.play(zone, url)
        }
        UnlockStep::PlayPrimer => {
            let _ = output.play_primer(zone);
            output.play(zone, url)
        }
        UnlockStep::ReloadClip => output.reload(zone, url),
        UnlockStep::FreshHandle => output.play_fresh(zone, url),
    }
}

// ── Runner ───────────────────────────────────────────────────────────────────

/// Drives sessions against a content store and a zone output.
pub struct SessionRunner {
    content: Arc<dyn ContentStore>,
    output: Arc<dyn ZoneOutput>,
    poll_budget: u32,
    poll_delay: Duration,
}

impl SessionRunner {
    pub fn new(content: Arc<dyn ContentStore>, output: Arc<dyn ZoneOutput>) -> Self {
        SessionRunner {
            content,
            output,
            poll_budget: CONTENT_POLL_BUDGET,
            poll_delay: CONTENT_POLL_DELAY,
        }
    }

    /// Override the poll budget and delay (tests use tiny values).
    pub fn with_poll(mut self, budget: u32, delay: Duration) -> Self {
        self.poll_budget = budget;
        self.poll_delay = delay;
        self
    }

    /// Resolve a clip to a playable URL. Missing or pending audio triggers
    /// exactly one regeneration request followed by a bounded number of
    /// short polls.
    pub fn resolve_content(&self, clip: &str) -> Result<String, SessionFailure> {
        match self.content.resolve_clip_audio(clip) {
            ClipAudio::Url(url) => return Ok(url),
            ClipAudio::Pending | ClipAudio::Missing => {
                let accepted = self.content.request_regeneration(clip);
                debug!(
                    "clip '{}' has no audio yet; regeneration {}",
                    clip,
                    if accepted { "requested" } else { "rejected" }
                );
            }
        }
        for _ in 0..self.poll_budget {
            std::thread::sleep(self.poll_delay);
            if let ClipAudio::Url(url) = self.content.resolve_clip_audio(clip) {
                return Ok(url);
            }
        }
        Err(SessionFailure::ContentUnavailable)
    }

    /// Run a session up to the playing state. Returns the output handle on
    /// success; on failure the session records the reason.
    pub fn start(&self, session: &mut PlaybackSession) -> Result<u64, SessionFailure> {
        let url = match self.resolve_content(&session.clip) {
            Ok(url) => url,
            Err(reason) => {
                warn!(
                    "session {} in zone '{}': clip '{}' failed: {}",
                    session.token, session.zone, session.clip, reason
                );
                session.fail(reason.clone());
                return Err(reason);
            }
        };

        match self.output.play(&session.zone, &url) {
            Ok(handle) => {
                session.state = SessionState::Playing;
                Ok(handle)
            }
            Err(PlayError::Blocked) => self.climb_ladder(session, &url),
            Err(PlayError::Other(msg)) => {
                let reason = SessionFailure::Output(msg);
                session.fail(reason.clone());
                Err(reason)
            }
        }
    }

    fn climb_ladder(
        &self,
        session: &mut PlaybackSession,
        url: &str,
    ) -> Result<u64, SessionFailure> {
        for step in UNLOCK_LADDER {
            debug!(
                "session {} in zone '{}': playback blocked, trying {:?}",
                session.token, session.zone, step
            );
            match attempt_unlock(self.output.as_ref(), step, &session.zone, url) {
                Ok(handle) => {
                    session.state = SessionState::Playing;
                    return Ok(handle);
                }
                Err(PlayError::Blocked) => continue,
                Err(PlayError::Other(msg)) => {
                    let reason = SessionFailure::Output(msg);
                    session.fail(reason.clone());
                    return Err(reason);
                }
            }
        }
        warn!(
            "session {} in zone '{}': unlock ladder exhausted",
            session.token, session.zone
        );
        session.fail(SessionFailure::PlaybackBlocked);
        Err(SessionFailure::PlaybackBlocked)
    }
}
