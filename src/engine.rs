//! The inference capability this crate drives but does not implement.
//!
//! An [`InferenceBackend`] is resolved once at startup and handed to the
//! [`ModelLifecycleManager`](crate::lifecycle::ModelLifecycleManager), which
//! asks it to build an [`InferenceEngine`] bound to a device. The engine turns
//! text plus a voice into raw samples at [`SAMPLE_RATE`](crate::audio::SAMPLE_RATE).

use crate::device::Device;

/// Error type returned by backend implementations.
pub type EngineError = Box<dyn std::error::Error + Send + Sync>;

/// A voice style vector as stored by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceEmbedding(pub Vec<f32>);

impl VoiceEmbedding {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// The voice passed to a synthesis call.
#[derive(Debug, Clone, PartialEq)]
pub enum Voice {
    /// A voice the engine knows by name (e.g. `"af_heart"`).
    Named(String),
    /// A precomputed style vector, e.g. a blend of several voices.
    Embedding(VoiceEmbedding),
}

impl Voice {
    pub fn named(id: impl Into<String>) -> Self {
        Voice::Named(id.into())
    }
}

/// A loaded model bound to one device.
///
/// Engines are shared between concurrent synthesis calls, so methods take
/// `&self`; engines that need mutable state must lock internally.
pub trait InferenceEngine: Send + Sync {
    /// Synthesize one sentence. Returns mono samples at 24 kHz.
    fn synthesize(&self, text: &str, voice: &Voice, speed: f32) -> Result<Vec<f32>, EngineError>;

    /// Load the style vector for a named voice, used for embedding-level blending.
    fn load_voice(&self, voice_id: &str) -> Result<VoiceEmbedding, EngineError>;

    /// Free device memory held by the engine.
    ///
    /// Called before a replacement engine is built. Failures are logged by
    /// the caller and never block the next load.
    fn release(self: Box<Self>) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Builds engines. Construction is the expensive step the lifecycle manager
/// guards with its single-flight lock.
pub trait InferenceBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "kokoro"
    }

    fn load(&self, device: Device) -> Result<Box<dyn InferenceEngine>, EngineError>;
}
