//! Entry point for synthesis: routes each request to the local engine or to
//! a remote worker, depending on the device policy in the settings snapshot.

use std::sync::Arc;

use crate::audio::{SynthesisResult, SAMPLE_RATE};
use crate::engine::{InferenceEngine, Voice};
use crate::error::{Result, TtsError};
use crate::lifecycle::ModelLifecycleManager;
use crate::remote::RemoteWorkerClient;
use crate::settings::TtsSettings;
use crate::voice::BlendSpec;

/// One synthesis request.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    /// Sentences in playback order. Blank entries are skipped.
    pub sentences: Vec<String>,
    /// Voice id, or a blend spec such as `"af_heart:0.7,am_puck:0.3"`.
    pub primary_voice: String,
    /// Voice blended with the primary one, if any.
    pub secondary_voice: Option<String>,
    /// Speed multiplier; must be positive.
    pub speed: f32,
}

impl SynthesisRequest {
    /// Request using the voices and speed from `settings`.
    pub fn from_settings<I, S>(sentences: I, settings: &TtsSettings) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sentences: sentences.into_iter().map(Into::into).collect(),
            primary_voice: settings.voice.clone(),
            secondary_voice: settings.secondary_voice().map(str::to_string),
            speed: settings.speed,
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.primary_voice = voice.into();
        self
    }

    pub fn with_secondary_voice(mut self, voice: Option<String>) -> Self {
        self.secondary_voice = voice.filter(|v| !v.trim().is_empty());
        self
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.speed.is_finite() && self.speed > 0.0) {
            return Err(TtsError::Validation(format!(
                "speed must be positive, got {}",
                self.speed
            )));
        }
        if self.primary_voice.trim().is_empty() {
            return Err(TtsError::Validation("no voice selected".to_string()));
        }
        self.blend_spec()?;
        Ok(())
    }

    /// The requested blend, or `None` for a plain voice id.
    fn blend_spec(&self) -> Result<Option<BlendSpec>> {
        let primary = self.primary_voice.trim();
        match self.secondary_voice.as_deref().map(str::trim) {
            Some(secondary) if !secondary.is_empty() => BlendSpec::pair(primary, secondary).map(Some),
            _ if primary.contains([',', ':']) => BlendSpec::parse(primary).map(Some),
            _ => Ok(None),
        }
    }

    /// Non-blank sentences, trimmed, in input order.
    fn spoken_sentences(&self) -> impl Iterator<Item = &str> {
        self.sentences
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

/// Routes requests between the local model and a remote worker.
///
/// Voices are blended at embedding level: the engine's style vectors are
/// averaged with the blend weights and the engine renders once with the
/// result. Every local request goes through this path.
pub struct SynthesisDispatcher {
    manager: Arc<ModelLifecycleManager>,
}

impl SynthesisDispatcher {
    pub fn new(manager: Arc<ModelLifecycleManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ModelLifecycleManager> {
        &self.manager
    }

    /// Synthesize `request` and return a 24 kHz mono WAV.
    ///
    /// With a remote policy the request is forwarded as-is and the worker's
    /// result or error is returned unchanged. There is no retry.
    pub fn synthesize(&self, request: &SynthesisRequest, settings: &TtsSettings) -> Result<SynthesisResult> {
        request.validate()?;

        if settings.is_remote() {
            log::info!("Delegating synthesis to remote worker");
            let client = RemoteWorkerClient::from_settings(settings)?;
            return client.synthesize(request);
        }

        self.synthesize_local(request, settings)
    }

    /// Same as [`synthesize`](Self::synthesize), base64-encoded for text transport.
    pub fn synthesize_base64(&self, request: &SynthesisRequest, settings: &TtsSettings) -> Result<String> {
        Ok(self.synthesize(request, settings)?.to_base64())
    }

    /// Check that the configured remote worker answers its health endpoint.
    pub fn verify_remote(&self, settings: &TtsSettings) -> bool {
        match RemoteWorkerClient::from_settings(settings) {
            Ok(client) => client.verify(),
            Err(e) => {
                log::warn!("{e}");
                false
            }
        }
    }

    fn synthesize_local(&self, request: &SynthesisRequest, settings: &TtsSettings) -> Result<SynthesisResult> {
        self.ensure_model(settings)?;
        let device = self
            .manager
            .status()
            .device
            .map(|d| d.to_string())
            .unwrap_or_default();

        let samples = self.manager.with_engine(|engine| {
            let mut sentences = request.spoken_sentences().peekable();
            if sentences.peek().is_none() {
                return Ok(Vec::new());
            }

            let voice = resolve_voice(engine, request)?;
            let mut combined = Vec::new();
            for (i, text) in sentences.enumerate() {
                let audio = engine
                    .synthesize(text, &voice, request.speed)
                    .map_err(|e| TtsError::resource(&device, e))?;
                log::debug!("Sentence {i}: {} samples", audio.len());
                combined.extend_from_slice(&audio);
            }
            Ok(combined)
        })?;

        SynthesisResult::from_samples(&samples, SAMPLE_RATE)
    }

    /// Bring the manager in line with the settings' policy and load if needed.
    fn ensure_model(&self, settings: &TtsSettings) -> Result<()> {
        let wanted = settings.device_policy.trim().to_ascii_lowercase();
        if self.manager.policy() != wanted {
            log::info!("Device policy changed to '{wanted}'");
            self.manager.reload(&wanted)?;
        }
        self.manager.preload()?;
        Ok(())
    }
}

/// Pick the voice to render with, blending when more than one is requested.
///
/// If the engine cannot provide an embedding for a blended voice, the first
/// voice of the blend is used on its own.
fn resolve_voice(engine: &dyn InferenceEngine, request: &SynthesisRequest) -> Result<Voice> {
    let Some(spec) = request.blend_spec()? else {
        return Ok(Voice::named(request.primary_voice.trim()));
    };

    let voices: Vec<&str> = spec.voices().collect();
    if spec.is_single() {
        return Ok(Voice::named(voices[0]));
    }

    let embeddings = voices
        .iter()
        .map(|voice| engine.load_voice(voice))
        .collect::<std::result::Result<Vec<_>, _>>();
    match embeddings {
        Ok(embeddings) => {
            log::debug!("Blending voices {voices:?} with weights {:?}", spec.weights());
            Ok(Voice::Embedding(spec.blend(&embeddings)?))
        }
        Err(e) => {
            log::error!("Failed to blend voices {voices:?}: {e}; using '{}'", voices[0]);
            Ok(Voice::named(voices[0]))
        }
    }
}
