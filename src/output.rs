//! Device/output abstraction consumed by playback sessions.
//!
//! `ZoneOutput` is the seam between the orchestration core and whatever
//! actually renders audio for a zone. The in-crate implementation drives
//! rodio on a dedicated audio thread with channel-based command dispatch;
//! the thread owns the `OutputStream` (not `Send`) and external code talks
//! to it through a cloneable handle. Completion and error events come back
//! through a callback so the arbiter can advance its per-zone state machine.

use rodio::source::Zero;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::mpsc;
use std::time::Duration;

/// Why a play attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayError {
    /// The output environment refused to render; remediation is external
    /// (user gesture, device becoming available). Triggers the unlock ladder.
    Blocked,
    /// Anything else: unreadable file, decode failure, dead runtime.
    Other(String),
}

impl std::fmt::Display for PlayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayError::Blocked => write!(f, "playback blocked"),
            PlayError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Events emitted by the output backend.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Finished { zone: String, handle: u64 },
    Error { zone: String, handle: u64, message: String },
}

/// Playback output for zones. Implementations must be safe to call from the
/// evaluator thread and from callers reacting to completion events.
pub trait ZoneOutput: Send + Sync {
    /// Start rendering `url` in `zone`. Returns an opaque playback handle.
    fn play(&self, zone: &str, url: &str) -> Result<u64, PlayError>;

    /// Re-fetch and retry the clip (unlock ladder step).
    fn reload(&self, zone: &str, url: &str) -> Result<u64, PlayError>;

    /// Retry on a freshly constructed playback handle (unlock ladder step).
    fn play_fresh(&self, zone: &str, url: &str) -> Result<u64, PlayError>;

    /// Render a near-silent primer to satisfy gesture requirements.
    fn play_primer(&self, zone: &str) -> Result<(), PlayError>;

    /// Resume / recreate the shared audio output context.
    fn resume_context(&self) -> Result<(), PlayError>;

    /// Stop and dispose the playback behind `handle`. Unknown handles are a
    /// no-op.
    fn stop(&self, handle: u64);
}

// ── Rodio backend ────────────────────────────────────────────────────────────

enum OutputCmd {
    Play {
        zone: String,
        path: String,
        fresh: bool,
        reply: mpsc::Sender<Result<u64, PlayError>>,
    },
    Primer {
        reply: mpsc::Sender<Result<(), PlayError>>,
    },
    ResumeContext {
        reply: mpsc::Sender<Result<(), PlayError>>,
    },
    Stop {
        handle: u64,
    },
    Shutdown,
}

/// Thread-safe handle to the rodio audio thread. Wraps an `mpsc::Sender`,
/// which is naturally `Send + Sync`.
#[derive(Clone)]
pub struct RodioOutput {
    tx: mpsc::Sender<OutputCmd>,
}

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

impl RodioOutput {
    fn request_play(&self, zone: &str, path: &str, fresh: bool) -> Result<u64, PlayError> {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(OutputCmd::Play {
                zone: zone.to_string(),
                path: path.to_string(),
                fresh,
                reply,
            })
            .map_err(|_| PlayError::Other("audio runtime is gone".into()))?;
        rx.recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| PlayError::Other("audio runtime unresponsive".into()))?
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(OutputCmd::Shutdown);
    }
}

impl ZoneOutput for RodioOutput {
    fn play(&self, zone: &str, url: &str) -> Result<u64, PlayError> {
        self.request_play(zone, url, false)
    }

    fn reload(&self, zone: &str, url: &str) -> Result<u64, PlayError> {
        // Re-opening the file is implicit: every play decodes from scratch.
        self.request_play(zone, url, false)
    }

    fn play_fresh(&self, zone: &str, url: &str) -> Result<u64, PlayError> {
        self.request_play(zone, url, true)
    }

    fn play_primer(&self, _zone: &str) -> Result<(), PlayError> {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(OutputCmd::Primer { reply })
            .map_err(|_| PlayError::Other("audio runtime is gone".into()))?;
        rx.recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| PlayError::Other("audio runtime unresponsive".into()))?
    }

    fn resume_context(&self) -> Result<(), PlayError> {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(OutputCmd::ResumeContext { reply })
            .map_err(|_| PlayError::Other("audio runtime is gone".into()))?;
        rx.recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| PlayError::Other("audio runtime unresponsive".into()))?
    }

    fn stop(&self, handle: u64) {
        let _ = self.tx.send(OutputCmd::Stop { handle });
    }
}

/// Spawn the rodio output runtime on a dedicated thread.
///
/// `on_event` is invoked from the audio thread on natural completion and
/// on playback errors; route it to the arbiter's completion path.
pub fn spawn_rodio_output<F>(on_event: F) -> RodioOutput
where
    F: Fn(OutputEvent) + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<OutputCmd>();

    std::thread::Builder::new()
        .name("zone-output".into())
        .spawn(move || output_thread_loop(rx, on_event))
        .expect("failed to spawn zone-output thread");

    RodioOutput { tx }
}

struct ActiveSink {
    zone: String,
    sink: Sink,
}

fn output_thread_loop<F>(rx: mpsc::Receiver<OutputCmd>, on_event: F)
where
    F: Fn(OutputEvent),
{
    // The stream is !Send, so it lives and dies on this thread.
    let mut stream: Option<(OutputStream, OutputStreamHandle)> = None;
    let mut sinks: HashMap<u64, ActiveSink> = HashMap::new();
    let mut next_handle: u64 = 1;

    loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(OutputCmd::Play { zone, path, fresh, reply }) => {
                if fresh || stream.is_none() {
                    // Fresh handle: tear the zone's sink down before rebuilding.
                    sinks.retain(|_, active| {
                        if active.zone == zone {
                            active.sink.stop();
                            false
                        } else {
                            true
                        }
                    });
                }
                let result = ensure_stream(&mut stream)
                    .and_then(|handle| start_sink(handle, &path))
                    .map(|sink| {
                        // Single-flight per zone at the device level.
                        sinks.retain(|_, active| {
                            if active.zone == zone {
                                active.sink.stop();
                                false
                            } else {
                                true
                            }
                        });
                        let handle = next_handle;
                        next_handle += 1;
                        sinks.insert(handle, ActiveSink { zone: zone.clone(), sink });
                        handle
                    });
                let _ = reply.send(result);
            }

            Ok(OutputCmd::Primer { reply }) => {
                let result = ensure_stream(&mut stream).and_then(|handle| {
                    let sink = Sink::try_new(handle)
                        .map_err(|e| PlayError::Other(format!("Failed to create sink: {}", e)))?;
                    let silence = Zero::<f32>::new(2, 44_100)
                        .take_duration(Duration::from_millis(150));
                    sink.append(silence);
                    sink.detach();
                    Ok(())
                });
                let _ = reply.send(result);
            }

            Ok(OutputCmd::ResumeContext { reply }) => {
                // Recreate the output stream; existing sinks on the old
                // stream are dead, so drop them.
                for active in sinks.values() {
                    active.sink.stop();
                }
                sinks.clear();
                stream = None;
                let result = ensure_stream(&mut stream).map(|_| ());
                let _ = reply.send(result);
            }

            Ok(OutputCmd::Stop { handle }) => {
                if let Some(active) = sinks.remove(&handle) {
                    active.sink.stop();
                }
            }

            Ok(OutputCmd::Shutdown) => {
                for active in sinks.values() {
                    active.sink.stop();
                }
                break;
            }

            Err(mpsc::RecvTimeoutError::Timeout) => {
                // Natural completion detection.
                let finished: Vec<u64> = sinks
                    .iter()
                    .filter(|(_, active)| active.sink.empty())
                    .map(|(handle, _)| *handle)
                    .collect();
                for handle in finished {
                    if let Some(active) = sinks.remove(&handle) {
                        on_event(OutputEvent::Finished { zone: active.zone, handle });
                    }
                }
            }

            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn ensure_stream(
    stream: &mut Option<(OutputStream, OutputStreamHandle)>,
) -> Result<&OutputStreamHandle, PlayError> {
    if stream.is_none() {
        // No usable output context maps to Blocked: the unlock ladder's
        // resume step retries this exact initialization.
        let (s, handle) = OutputStream::try_default().map_err(|_| PlayError::Blocked)?;
        *stream = Some((s, handle));
    }
    Ok(&stream.as_ref().unwrap().1)
}

fn start_sink(handle: &OutputStreamHandle, path: &str) -> Result<Sink, PlayError> {
    let sink = Sink::try_new(handle)
        .map_err(|e| PlayError::Other(format!("Failed to create sink: {}", e)))?;
    let file = File::open(path)
        .map_err(|e| PlayError::Other(format!("Cannot open '{}': {}", path, e)))?;
    let source = Decoder::new(BufReader::new(file))
        .map_err(|e| PlayError::Other(format!("Cannot decode '{}': {}", path, e)))?;
    sink.append(source);
    sink.play();
    Ok(sink)
}
