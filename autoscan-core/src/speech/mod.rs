//! Spoken status announcements.
//!
//! `Announcer` never queues: while the backend reports an utterance in
//! progress, new phrases are dropped. A backlog of stale counts read out
//! seconds late is worse than silence.
//!
//! Speech is best-effort. Backend failures are logged here and never reach
//! the caller as errors.

pub mod command;

pub use command::CommandSpeaker;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;

pub const CAMERA_STARTED: &str = "Cámara iniciada.";
pub const PROCESSING_ERROR: &str = "Error al procesar la imagen.";

/// Phrase announcing a new vehicle count.
pub fn count_phrase(count: usize) -> String {
    if count == 1 {
        "1 auto detectado.".to_string()
    } else {
        format!("{count} autos detectados.")
    }
}

/// Which voice preset a phrase is spoken with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechCategory {
    /// Detection results.
    Detection,
    /// System status and alerts.
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicePreset {
    /// Backend-specific voice name. `None` uses the backend default for `lang`.
    pub voice: Option<String>,
    pub lang: String,
    pub pitch: f32,
    pub rate: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub detection: VoicePreset,
    pub system: VoicePreset,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            detection: VoicePreset {
                voice: None,
                lang: "es-MX".into(),
                pitch: 1.0,
                rate: 1.1,
            },
            system: VoicePreset {
                voice: None,
                lang: "es-MX".into(),
                pitch: 1.2,
                rate: 1.0,
            },
        }
    }
}

impl VoiceConfig {
    pub fn preset(&self, category: SpeechCategory) -> &VoicePreset {
        match category {
            SpeechCategory::Detection => &self.detection,
            SpeechCategory::System => &self.system,
        }
    }
}

/// One phrase ready for a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub category: SpeechCategory,
    pub preset: VoicePreset,
}

/// Local text-to-speech output.
pub trait SpeechBackend: Send + Sync + 'static {
    /// Whether an utterance is still being spoken.
    fn is_speaking(&self) -> bool;

    /// Start speaking `utterance` without waiting for it to finish.
    ///
    /// # Errors
    /// Any failure to start playback.
    fn speak(&self, utterance: &Utterance) -> Result<()>;
}

/// What happened to an `announce` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    Spoken,
    /// Dropped because a previous utterance is still playing.
    Busy,
    /// Empty phrase; nothing to say.
    Empty,
    /// Backend failed; already logged.
    Failed,
}

#[derive(Clone)]
pub struct Announcer {
    backend: Arc<dyn SpeechBackend>,
    voices: VoiceConfig,
}

impl Announcer {
    pub fn new(backend: Arc<dyn SpeechBackend>, voices: VoiceConfig) -> Self {
        Self { backend, voices }
    }

    /// Announcer that only logs.
    pub fn silent() -> Self {
        Self::new(Arc::new(LogSpeaker), VoiceConfig::default())
    }

    pub fn announce(&self, phrase: &str, category: SpeechCategory) -> AnnounceOutcome {
        let text = phrase.trim();
        if text.is_empty() {
            return AnnounceOutcome::Empty;
        }
        if self.backend.is_speaking() {
            debug!(phrase = text, "speech busy; announcement dropped");
            return AnnounceOutcome::Busy;
        }
        let utterance = Utterance {
            text: text.to_string(),
            category,
            preset: self.voices.preset(category).clone(),
        };
        match self.backend.speak(&utterance) {
            Ok(()) => AnnounceOutcome::Spoken,
            Err(e) => {
                warn!(phrase = text, error = %e, "speech failed");
                AnnounceOutcome::Failed
            }
        }
    }
}

impl std::fmt::Debug for Announcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Announcer")
            .field("voices", &self.voices)
            .finish_non_exhaustive()
    }
}

/// Backend that writes phrases to the log and is never busy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSpeaker;

impl SpeechBackend for LogSpeaker {
    fn is_speaking(&self) -> bool {
        false
    }

    fn speak(&self, utterance: &Utterance) -> Result<()> {
        info!(
            category = ?utterance.category,
            lang = %utterance.preset.lang,
            "speaking: {}",
            utterance.text
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AutoscanError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeSpeaker {
        speaking: AtomicBool,
        fail: bool,
        spoken: Mutex<Vec<Utterance>>,
    }

    impl SpeechBackend for FakeSpeaker {
        fn is_speaking(&self) -> bool {
            self.speaking.load(Ordering::SeqCst)
        }

        fn speak(&self, utterance: &Utterance) -> Result<()> {
            if self.fail {
                return Err(AutoscanError::Speech("no audio device".into()));
            }
            self.speaking.store(true, Ordering::SeqCst);
            self.spoken.lock().push(utterance.clone());
            Ok(())
        }
    }

    #[test]
    fn count_phrase_uses_singular_only_for_one() {
        assert_eq!(count_phrase(0), "0 autos detectados.");
        assert_eq!(count_phrase(1), "1 auto detectado.");
        assert_eq!(count_phrase(3), "3 autos detectados.");
    }

    #[test]
    fn second_announcement_is_dropped_while_speaking() {
        let speaker = Arc::new(FakeSpeaker::default());
        let announcer = Announcer::new(speaker.clone(), VoiceConfig::default());

        assert_eq!(
            announcer.announce("2 autos detectados.", SpeechCategory::Detection),
            AnnounceOutcome::Spoken
        );
        assert_eq!(
            announcer.announce("3 autos detectados.", SpeechCategory::Detection),
            AnnounceOutcome::Busy
        );
        assert_eq!(speaker.spoken.lock().len(), 1);

        speaker.speaking.store(false, Ordering::SeqCst);
        assert_eq!(
            announcer.announce(CAMERA_STARTED, SpeechCategory::System),
            AnnounceOutcome::Spoken
        );
        let spoken = speaker.spoken.lock();
        assert_eq!(spoken[1].preset.pitch, 1.2);
        assert_eq!(spoken[1].text, CAMERA_STARTED);
    }

    #[test]
    fn empty_phrase_is_a_no_op() {
        let speaker = Arc::new(FakeSpeaker::default());
        let announcer = Announcer::new(speaker.clone(), VoiceConfig::default());
        assert_eq!(
            announcer.announce("   ", SpeechCategory::System),
            AnnounceOutcome::Empty
        );
        assert!(speaker.spoken.lock().is_empty());
    }

    #[test]
    fn backend_failure_is_swallowed() {
        let speaker = Arc::new(FakeSpeaker {
            fail: true,
            ..FakeSpeaker::default()
        });
        let announcer = Announcer::new(speaker, VoiceConfig::default());
        assert_eq!(
            announcer.announce(PROCESSING_ERROR, SpeechCategory::System),
            AnnounceOutcome::Failed
        );
    }
}
