//! Speech through a local TTS program (`espeak-ng` by default).
//!
//! Each utterance spawns one child process. The speaker counts as busy while
//! the most recent child is still alive; the child is reaped lazily on the
//! next `is_speaking` check.

use std::process::{Child, Command, Stdio};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{AutoscanError, Result};
use crate::speech::{SpeechBackend, Utterance, VoicePreset};

/// espeak-ng default speed in words per minute (rate 1.0).
const BASE_WPM: f32 = 175.0;
/// espeak-ng default pitch on its 0..=99 scale (pitch 1.0).
const BASE_PITCH: f32 = 50.0;

pub struct CommandSpeaker {
    program: String,
    child: Mutex<Option<Child>>,
}

impl CommandSpeaker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            child: Mutex::new(None),
        }
    }

    /// Speaker backed by `espeak-ng`.
    pub fn espeak() -> Self {
        Self::new("espeak-ng")
    }

    /// Arguments passed to the TTS program for one utterance.
    pub fn args_for(utterance: &Utterance) -> Vec<String> {
        let preset = &utterance.preset;
        vec![
            "-v".into(),
            voice_name(preset),
            "-s".into(),
            format!("{}", (BASE_WPM * preset.rate.clamp(0.5, 2.0)).round() as u32),
            "-p".into(),
            format!("{}", (BASE_PITCH * preset.pitch.clamp(0.0, 1.98)).round() as u32),
            utterance.text.clone(),
        ]
    }
}

impl Drop for CommandSpeaker {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl SpeechBackend for CommandSpeaker {
    fn is_speaking(&self) -> bool {
        let mut guard = self.child.lock();
        let Some(child) = guard.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    warn!(program = %self.program, %status, "speech process exited with failure");
                }
                *guard = None;
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(program = %self.program, error = %e, "failed to poll speech process");
                *guard = None;
                false
            }
        }
    }

    fn speak(&self, utterance: &Utterance) -> Result<()> {
        let args = Self::args_for(utterance);
        debug!(program = %self.program, ?args, "spawning speech process");
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AutoscanError::Speech(format!("spawn {}: {e}", self.program)))?;
        *self.child.lock() = Some(child);
        Ok(())
    }
}

/// Map a BCP-47 tag onto an espeak-ng voice name unless one is configured.
fn voice_name(preset: &VoicePreset) -> String {
    if let Some(voice) = preset.voice.as_deref().filter(|v| !v.trim().is_empty()) {
        return voice.trim().to_string();
    }
    match preset.lang.to_ascii_lowercase().as_str() {
        "es-es" | "es" => "es".into(),
        lang if lang.starts_with("es-") => "es-419".into(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::{SpeechCategory, VoiceConfig};

    fn utterance(category: SpeechCategory) -> Utterance {
        Utterance {
            text: "1 auto detectado.".into(),
            category,
            preset: VoiceConfig::default().preset(category).clone(),
        }
    }

    #[test]
    fn latin_american_spanish_maps_to_es_419() {
        let args = CommandSpeaker::args_for(&utterance(SpeechCategory::Detection));
        assert_eq!(args[0..2], ["-v".to_string(), "es-419".to_string()]);
        assert_eq!(args[3], "193"); // 175 * 1.1
        assert_eq!(args[5], "50");
        assert_eq!(args.last().map(String::as_str), Some("1 auto detectado."));
    }

    #[test]
    fn system_preset_raises_pitch() {
        let args = CommandSpeaker::args_for(&utterance(SpeechCategory::System));
        assert_eq!(args[3], "175");
        assert_eq!(args[5], "60");
    }

    #[test]
    fn explicit_voice_wins_over_language() {
        let mut u = utterance(SpeechCategory::System);
        u.preset.voice = Some("es+f3".into());
        assert_eq!(CommandSpeaker::args_for(&u)[1], "es+f3");
    }

    #[test]
    fn missing_program_is_a_speech_error_and_not_busy() {
        let speaker = CommandSpeaker::new("autoscan-no-such-tts-binary");
        let err = speaker
            .speak(&utterance(SpeechCategory::System))
            .expect_err("spawn should fail");
        assert!(matches!(err, AutoscanError::Speech(_)));
        assert!(!speaker.is_speaking());
    }
}
