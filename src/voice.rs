//! Weighted voice blending.
//!
//! A blend spec is a comma-separated list of `voice` or `voice:weight`
//! entries, e.g. `"af_heart:0.7,am_puck:0.3"`. Weights default to 1.0 and are
//! normalized to sum to 1.0.

use crate::engine::VoiceEmbedding;
use crate::error::{Result, TtsError};

/// A parsed blend: at least one voice, weights non-negative and summing to 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendSpec {
    entries: Vec<(String, f64)>,
}

impl BlendSpec {
    /// Parse and normalize a blend spec.
    ///
    /// Fails when the spec is empty, an entry has no voice id or an
    /// unparsable weight, a weight is negative, or all weights are zero.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(TtsError::Validation("voice blend spec is empty".to_string()));
        }

        let mut entries = Vec::new();
        for raw in spec.split(',') {
            let (voice, weight) = match raw.split_once(':') {
                Some((voice, weight)) => {
                    let weight = weight.trim().parse::<f64>().map_err(|_| {
                        TtsError::Validation(format!("invalid weight in blend entry '{}'", raw.trim()))
                    })?;
                    (voice.trim(), weight)
                }
                None => (raw.trim(), 1.0),
            };

            if voice.is_empty() {
                return Err(TtsError::Validation(format!(
                    "blend entry '{}' has no voice id",
                    raw.trim()
                )));
            }
            if !weight.is_finite() || weight < 0.0 {
                return Err(TtsError::Validation(format!(
                    "weight for voice '{voice}' must be non-negative, got {weight}"
                )));
            }
            entries.push((voice.to_string(), weight));
        }

        let total: f64 = entries.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return Err(TtsError::Validation("voice blend weights sum to zero".to_string()));
        }
        if !total.is_finite() {
            return Err(TtsError::Validation("voice blend weights are too large".to_string()));
        }
        for (_, weight) in &mut entries {
            *weight /= total;
        }

        Ok(Self { entries })
    }

    /// Equal blend of a primary and a secondary voice spec.
    ///
    /// Either side may carry its own weight (`"am_puck:0.3"`).
    pub fn pair(primary: &str, secondary: &str) -> Result<Self> {
        Self::parse(&format!("{primary},{secondary}"))
    }

    pub fn entries(&self) -> &[(String, f64)] {
        &self.entries
    }

    pub fn weights(&self) -> Vec<f64> {
        self.entries.iter().map(|(_, w)| *w).collect()
    }

    pub fn voices(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(voice, _)| voice.as_str())
    }

    /// True for a blend of a single voice.
    pub fn is_single(&self) -> bool {
        self.entries.len() == 1
    }

    /// Weighted average of one embedding per entry, in entry order.
    pub fn blend(&self, embeddings: &[VoiceEmbedding]) -> Result<VoiceEmbedding> {
        if embeddings.len() != self.entries.len() {
            return Err(TtsError::Validation(format!(
                "expected {} voice embeddings, got {}",
                self.entries.len(),
                embeddings.len()
            )));
        }

        let dim = embeddings[0].len();
        if let Some(other) = embeddings.iter().find(|e| e.len() != dim) {
            return Err(TtsError::Validation(format!(
                "voice embeddings differ in size ({dim} vs {})",
                other.len()
            )));
        }

        let mut blended = vec![0f32; dim];
        for (embedding, (_, weight)) in embeddings.iter().zip(&self.entries) {
            for (out, value) in blended.iter_mut().zip(embedding.as_slice()) {
                *out += value * (*weight as f32);
            }
        }
        Ok(VoiceEmbedding(blended))
    }
}
