//! zonecast — Scheduling and playback-orchestration core for multi-zone
//! announcement playback.
//!
//! Decides per zone what plays when, guarantees each scheduled trigger fires
//! at most once, arbitrates playback ownership, and recovers when a clip has
//! no usable audio. Tenant management, upload/storage, speech generation,
//! and presentation are external collaborators behind the `ContentStore`,
//! `ScheduleDirectory`, and `ZoneOutput` traits.

pub mod arbiter;
pub mod content;
pub mod evaluator;
pub mod ledger;
pub mod orchestrator;
pub mod output;
pub mod recurrence;
pub mod rotation;
pub mod schedule;
pub mod session;
