//! Content store boundary. Upload, storage, and speech generation live in an
//! external collaborator; the playback session only asks whether a clip has
//! renderable audio and, failing that, requests regeneration once.

/// Outcome of resolving a clip to playable audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipAudio {
    /// Renderable audio is available at this URL (or local path).
    Url(String),
    /// Generation is in progress; worth polling briefly.
    Pending,
    /// No audio exists for this clip.
    Missing,
}

/// External audio asset resolver.
pub trait ContentStore: Send + Sync {
    fn resolve_clip_audio(&self, clip: &str) -> ClipAudio;

    /// Ask the collaborator to (re)generate audio for the clip.
    /// Returns whether the request was accepted.
    fn request_regeneration(&self, clip: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedStore;

    impl ContentStore for FixedStore {
        fn resolve_clip_audio(&self, clip: &str) -> ClipAudio {
            match clip {
                "ready" => ClipAudio::Url("/audio/ready.mp3".into()),
                "generating" => ClipAudio::Pending,
                _ => ClipAudio::Missing,
            }
        }

        fn request_regeneration(&self, _clip: &str) -> bool {
            true
        }
    }

    #[test]
    fn resolve_variants() {
        let store = FixedStore;
        assert_eq!(
            store.resolve_clip_audio("ready"),
            ClipAudio::Url("/audio/ready.mp3".into())
        );
        assert_eq!(store.resolve_clip_audio("generating"), ClipAudio::Pending);
        assert_eq!(store.resolve_clip_audio("ghost"), ClipAudio::Missing);
    }
}
