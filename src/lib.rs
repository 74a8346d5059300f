//! # tts-dispatch
//!
//! Lifecycle and dispatch layer in front of a Kokoro text-to-speech engine.
//!
//! ## Features
//!
//! - **Device policies**: `auto`, `cpu`, `accelerator:auto`, `accelerator:<n>` and
//!   `remote` resolve to a concrete device, falling back to CPU with warnings
//! - **Single-flight loading**: one engine, built at most once per load no matter
//!   how many callers ask for it concurrently
//! - **Remote workers**: requests under a `remote` policy go to an HTTP worker
//! - **Voice blending**: weighted blends of voice style vectors
//!
//! The inference engine itself is supplied by the caller through
//! [`InferenceBackend`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tts_dispatch::{
//!     device::{DeviceResolver, SysfsProbe},
//!     ModelLifecycleManager, SynthesisDispatcher, SynthesisRequest, TtsSettings,
//! };
//!
//! let settings = TtsSettings::load("settings.json".as_ref())?;
//! let resolver = DeviceResolver::detect(&SysfsProbe::new());
//! let manager = Arc::new(ModelLifecycleManager::new(backend, resolver, &settings.device_policy));
//! let dispatcher = SynthesisDispatcher::new(manager);
//!
//! let request = SynthesisRequest::from_settings(["Hello, world!"], &settings);
//! let result = dispatcher.synthesize(&request, &settings)?;
//! result.write_wav("output.wav".as_ref())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod audio;
pub mod device;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod remote;
pub mod settings;
pub mod voice;

pub use audio::{ContainerFormat, SynthesisResult, SAMPLE_RATE};
pub use device::{is_remote_policy, Device, DeviceResolver, DeviceWarning, ResolvedDevice};
pub use dispatcher::{SynthesisDispatcher, SynthesisRequest};
pub use engine::{InferenceBackend, InferenceEngine, Voice, VoiceEmbedding};
pub use error::{RemoteError, Result, TtsError};
pub use lifecycle::{LifecycleEvent, LifecycleStatus, ModelLifecycleManager, Phase, ReloadOutcome};
pub use remote::{RemoteEndpoint, RemoteWorkerClient, WorkerHealth};
pub use settings::{TtsSettings, TtsSettingsBuilder};
pub use voice::BlendSpec;
