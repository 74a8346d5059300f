use std::io::Cursor;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};

use crate::error::Result;

/// Output sample rate of the Kokoro model.
pub const SAMPLE_RATE: u32 = 24000;

/// Audio container of a [`SynthesisResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Wav,
}

/// The result of a synthesis request: a complete mono WAV file.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisResult {
    /// WAV file bytes, header included.
    pub audio_bytes: Vec<u8>,
    pub sample_rate: u32,
    pub container: ContainerFormat,
}

impl SynthesisResult {
    /// Encode f32 samples as a 16-bit PCM mono WAV.
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for &sample in samples {
                let clamped = sample.clamp(-1.0, 1.0);
                writer.write_sample((clamped * i16::MAX as f32) as i16)?;
            }
            writer.finalize()?;
        }

        Ok(Self {
            audio_bytes: cursor.into_inner(),
            sample_rate,
            container: ContainerFormat::Wav,
        })
    }

    /// Wrap WAV bytes produced elsewhere, taking the sample rate from the header.
    pub fn from_wav_bytes(audio_bytes: Vec<u8>) -> Result<Self> {
        let reader = hound::WavReader::new(Cursor::new(audio_bytes.as_slice()))?;
        let sample_rate = reader.spec().sample_rate;
        Ok(Self {
            audio_bytes,
            sample_rate,
            container: ContainerFormat::Wav,
        })
    }

    /// Base64 form used when the audio travels as text.
    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.audio_bytes)
    }

    /// Decode samples back to f32 in `[-1.0, 1.0]`.
    pub fn samples(&self) -> Result<Vec<f32>> {
        let mut reader = hound::WavReader::new(Cursor::new(self.audio_bytes.as_slice()))?;
        let spec = reader.spec();
        match spec.sample_format {
            hound::SampleFormat::Float => {
                let samples = reader
                    .samples::<f32>()
                    .collect::<std::result::Result<Vec<f32>, hound::Error>>()?;
                Ok(samples)
            }
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                let samples = reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<Vec<f32>, hound::Error>>()?;
                Ok(samples)
            }
        }
    }

    /// Duration of the audio in seconds.
    pub fn duration_secs(&self) -> f64 {
        hound::WavReader::new(Cursor::new(self.audio_bytes.as_slice()))
            .map(|reader| reader.duration() as f64 / reader.spec().sample_rate as f64)
            .unwrap_or(0.0)
    }

    /// Write the WAV bytes to a file.
    pub fn write_wav(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.audio_bytes)?;
        Ok(())
    }
}
