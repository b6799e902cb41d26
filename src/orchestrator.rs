//! Top-level orchestration facade.
//!
//! Ties the evaluator, arbiter, and session runner together behind one
//! object: `tick` runs an evaluation pass and starts admitted sessions,
//! output completion events flow back in through `on_output_event`, and
//! manual triggers enter through `trigger_instant`. Rotation cursors and
//! ledger claims are persisted to a JSON state file so sequential rotation
//! and the at-most-once guarantee survive a restart.

use crate::arbiter::{Admission, PlaybackArbiter, ZoneSnapshot};
use crate::content::ContentStore;
use crate::evaluator::{Evaluator, ExecutionIntent, ScheduleCountdown, ScheduleDirectory};
use crate::ledger::{ClaimKey, ExecutionLedger};
use crate::output::{OutputEvent, ZoneOutput};
use crate::rotation::{RotationState, Rotator};
use crate::session::{PlaybackSession, SessionFailure, SessionRunner};
use chrono::{Local, NaiveDateTime};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Seconds to back off after a panicked evaluation pass.
const ERROR_RETRY_SECS: u64 = 5;

#[derive(Debug, Clone, Copy)]
struct ActivePlayback {
    token: u64,
    handle: u64,
}

/// Persisted process state: everything that must survive a restart.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    rotation: HashMap<String, RotationState>,
    #[serde(default)]
    claims: Vec<(ClaimKey, i64)>,
}

/// Default location of the state file, under the platform data directory.
pub fn default_state_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("zonecast").join("state.json"))
}

/// The orchestration core. Safe to share behind an `Arc`; all interior
/// state is behind its own lock.
pub struct Orchestrator {
    content: Arc<dyn ContentStore>,
    output: Arc<dyn ZoneOutput>,
    ledger: Arc<ExecutionLedger>,
    rotator: Arc<Rotator>,
    evaluator: Evaluator,
    arbiter: PlaybackArbiter,
    runner: SessionRunner,
    /// Current playback per zone, mapping the arbiter token to the output
    /// handle so stale completion events can be told apart.
    active: Mutex<HashMap<String, ActivePlayback>>,
    state_path: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        directory: Arc<dyn ScheduleDirectory>,
        content: Arc<dyn ContentStore>,
        output: Arc<dyn ZoneOutput>,
    ) -> Self {
        let ledger = Arc::new(ExecutionLedger::new());
        let rotator = Arc::new(Rotator::new());
        let evaluator = Evaluator::new(directory, ledger.clone(), rotator.clone());
        let runner = SessionRunner::new(content.clone(), output.clone());
        Orchestrator {
            content,
            output,
            ledger,
            rotator,
            evaluator,
            arbiter: PlaybackArbiter::new(),
            runner,
            active: Mutex::new(HashMap::new()),
            state_path: None,
        }
    }

    /// Persist and restore state at the given path. Without this the
    /// orchestrator is purely in-memory.
    pub fn with_state_path(mut self, path: PathBuf) -> Self {
        self.state_path = Some(path);
        self
    }

    /// Override the evaluation tick (tests use small values).
    pub fn with_tick_secs(mut self, tick_secs: i64) -> Self {
        let directory = self.evaluator_directory();
        self.evaluator = Evaluator::new(directory, self.ledger.clone(), self.rotator.clone())
            .with_tick(tick_secs);
        self
    }

    /// Override the content poll budget and delay (tests use tiny values).
    pub fn with_poll(mut self, budget: u32, delay: Duration) -> Self {
        self.runner =
            SessionRunner::new(self.content.clone(), self.output.clone()).with_poll(budget, delay);
        self
    }

    fn evaluator_directory(&self) -> Arc<dyn ScheduleDirectory> {
        self.evaluator.directory()
    }

    pub fn tick_secs(&self) -> i64 {
        self.evaluator.tick_secs()
    }

    /// One orchestration pass: evaluate, arbitrate, start sessions, prune
    /// the ledger, persist state.
    pub fn tick(&self, tenant: &str, now: NaiveDateTime) {
        for intent in self.evaluator.evaluate(tenant, now) {
            self.submit(intent);
        }
        self.ledger.prune(now);
        if self.state_path.is_some() {
            if let Err(e) = self.save_state() {
                warn!("state save failed: {}", e);
            }
        }
    }

    /// Submit one intent to its zone. Queued and rejected intents are
    /// normal outcomes; the ledger claim behind a rejected intent stays
    /// consumed.
    pub fn submit(&self, intent: ExecutionIntent) {
        match self.arbiter.admit(&intent) {
            Admission::Admitted { token, preempted } => {
                if let Some(stale) = preempted {
                    self.stop_playback(&intent.zone, stale);
                }
                if let Err(reason) = self.start_session(&intent, token) {
                    warn!(
                        "zone '{}': clip '{}' failed to start: {}",
                        intent.zone, intent.clip, reason
                    );
                }
            }
            Admission::Queued => {
                debug!("zone '{}': clip '{}' queued", intent.zone, intent.clip);
            }
            Admission::Rejected(reason) => {
                debug!(
                    "zone '{}': clip '{}' rejected ({:?}); trigger counts as fired",
                    intent.zone, intent.clip, reason
                );
            }
        }
    }

    fn start_session(&self, intent: &ExecutionIntent, token: u64) -> Result<u64, SessionFailure> {
        let mut session = PlaybackSession::new(&intent.zone, &intent.clip, token, intent.origin);
        match self.runner.start(&mut session) {
            Ok(handle) => {
                self.active
                    .lock()
                    .unwrap()
                    .insert(intent.zone.clone(), ActivePlayback { token, handle });
                info!(
                    "zone '{}': playing '{}' (session {})",
                    intent.zone, intent.clip, token
                );
                Ok(handle)
            }
            Err(reason) => {
                // The zone goes back to idle; a queued intent gets its turn.
                if let Some(promoted) = self.arbiter.complete(&intent.zone, token) {
                    self.submit(promoted);
                }
                Err(reason)
            }
        }
    }

    /// Manual trigger for a zone: builds a preempting intent and submits it
    /// straight to the arbiter, bypassing recurrence and the ledger.
    pub fn trigger_instant(&self, zone: &str, clip: &str) -> Result<u64, String> {
        let intent = ExecutionIntent::instant(zone, clip);
        match self.arbiter.admit(&intent) {
            Admission::Admitted { token, preempted } => {
                if let Some(stale) = preempted {
                    self.stop_playback(zone, stale);
                }
                self.start_session(&intent, token)
                    .map(|_| token)
                    .map_err(|reason| format!("instant playback failed: {}", reason))
            }
            other => Err(format!("zone '{}' refused instant intent: {:?}", zone, other)),
        }
    }

    /// Route a completion or error event from the output backend. Events
    /// for handles that are no longer current are discarded.
    pub fn on_output_event(&self, event: OutputEvent) {
        match event {
            OutputEvent::Finished { zone, handle } => self.finish(&zone, handle, None),
            OutputEvent::Error { zone, handle, message } => {
                self.finish(&zone, handle, Some(message))
            }
        }
    }

    fn finish(&self, zone: &str, handle: u64, error: Option<String>) {
        let token = {
            let mut active = self.active.lock().unwrap();
            match active.get(zone) {
                Some(current) if current.handle == handle => {
                    let token = current.token;
                    active.remove(zone);
                    Some(token)
                }
                _ => None,
            }
        };
        let Some(token) = token else {
            debug!("zone '{}': stale output event for handle {}", zone, handle);
            return;
        };
        if let Some(message) = error {
            warn!("zone '{}': playback error: {}", zone, message);
        }
        if let Some(promoted) = self.arbiter.complete(zone, token) {
            self.submit(promoted);
        }
    }

    /// Stop whatever the zone is doing, dropping any queued intent.
    pub fn stop_zone(&self, zone: &str) {
        if let Some(token) = self.arbiter.stop(zone) {
            self.stop_playback(zone, token);
        }
    }

    fn stop_playback(&self, zone: &str, token: u64) {
        let handle = {
            let mut active = self.active.lock().unwrap();
            match active.get(zone) {
                Some(current) if current.token == token => {
                    let handle = current.handle;
                    active.remove(zone);
                    Some(handle)
                }
                _ => None,
            }
        };
        if let Some(handle) = handle {
            self.output.stop(handle);
        }
    }

    /// Read-only countdown projection for observers.
    pub fn countdowns(&self, tenant: &str, now: NaiveDateTime) -> Vec<ScheduleCountdown> {
        self.evaluator.countdowns(tenant, now)
    }

    /// Observer snapshot of every zone's playback state.
    pub fn zone_snapshot(&self) -> Vec<ZoneSnapshot> {
        self.arbiter.zone_snapshot()
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    /// Restore rotation cursors and ledger claims from the state file.
    /// A missing or corrupt file means starting fresh.
    pub fn load_state(&self) {
        let Some(path) = &self.state_path else { return };
        if !path.exists() {
            return;
        }
        match fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<PersistedState>(&data) {
                Ok(state) => {
                    self.rotator.import(state.rotation);
                    self.ledger.import(state.claims);
                    info!("restored state from {}", path.display());
                }
                Err(e) => warn!("corrupt state file, starting fresh: {}", e),
            },
            Err(e) => warn!("could not read state file: {}", e),
        }
    }

    /// Persist rotation cursors and ledger claims to the state file.
    pub fn save_state(&self) -> Result<(), String> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let state = PersistedState {
            rotation: self.rotator.export(),
            claims: self.ledger.export(),
        };
        let json =
            serde_json::to_string_pretty(&state).map_err(|e| format!("Serialize error: {}", e))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("Create dir error: {}", e))?;
        }
        fs::write(path, json).map_err(|e| format!("Write error: {}", e))?;
        Ok(())
    }
}

// ── Background loop ──────────────────────────────────────────────────────────

/// Runs the orchestrator's tick on a background thread.
pub struct OrchestratorHandler {
    running: Arc<AtomicBool>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl OrchestratorHandler {
    /// Create a new handler (not yet started).
    pub fn new() -> Self {
        OrchestratorHandler {
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Whether the evaluation loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Start the evaluation loop for one tenant.
    pub fn start(&mut self, orchestrator: Arc<Orchestrator>, tenant: &str) {
        if self.is_running() {
            return;
        }
        self.running.store(true, Ordering::Relaxed);

        let running = self.running.clone();
        let tenant = tenant.to_string();

        let handle = thread::Builder::new()
            .name("zonecast-evaluator".into())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        orchestrator.tick(&tenant, Local::now().naive_local());
                    }));

                    if result.is_err() {
                        warn!(
                            "evaluation pass panicked, retrying in {}s",
                            ERROR_RETRY_SECS
                        );
                        thread::sleep(Duration::from_secs(ERROR_RETRY_SECS));
                        continue;
                    }

                    // Sleep in short slices so stop() is prompt.
                    let tick = orchestrator.tick_secs().max(1) as u64;
                    let deadline = Instant::now() + Duration::from_secs(tick);
                    while running.load(Ordering::Relaxed) && Instant::now() < deadline {
                        thread::sleep(Duration::from_millis(200));
                    }
                }
            })
            .expect("failed to spawn zonecast-evaluator thread");

        self.thread_handle = Some(handle);
    }

    /// Stop the loop and wait for the thread to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for OrchestratorHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Default for OrchestratorHandler {
    fn default() -> Self {
        Self::new()
    }
}
