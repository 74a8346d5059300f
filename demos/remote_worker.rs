use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tts_dispatch::{
    device::SysfsProbe, engine::EngineError, Device, DeviceResolver, InferenceBackend,
    InferenceEngine, ModelLifecycleManager, RemoteWorkerClient, SynthesisDispatcher,
    SynthesisRequest, TtsSettings,
};

/// This demo only talks to a remote worker; local loads are refused.
struct NoLocalBackend;

impl InferenceBackend for NoLocalBackend {
    fn load(&self, device: Device) -> Result<Box<dyn InferenceEngine>, EngineError> {
        Err(format!("no local engine available for {device}; use a remote policy").into())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // usage: remote_worker [settings.json]
    let settings = match std::env::args().nth(1) {
        Some(path) => TtsSettings::load(&PathBuf::from(path))?,
        None => TtsSettings {
            device_policy: "remote".to_string(),
            remote_url: std::env::var("KOKORO_WORKER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8891".to_string()),
            remote_token: std::env::var("KOKORO_WORKER_TOKEN").unwrap_or_default(),
            ..Default::default()
        },
    };

    let resolver = DeviceResolver::detect(&SysfsProbe::new());
    println!("Devices: {:?}", resolver.inventory());

    let client = RemoteWorkerClient::from_settings(&settings)?;
    let health = client.health()?;
    println!(
        "Worker at {} on {} (pipeline loaded: {})",
        client.endpoint().url,
        health.device.as_deref().unwrap_or("unknown"),
        health.pipeline_loaded
    );

    let manager = Arc::new(ModelLifecycleManager::new(
        Arc::new(NoLocalBackend),
        resolver,
        &settings.device_policy,
    ));
    let dispatcher = SynthesisDispatcher::new(manager);

    let request = SynthesisRequest::from_settings(
        [
            "Hello! This is Kokoro, running on a remote worker.",
            "",
            "Blank sentences are skipped.",
        ],
        &settings,
    );

    let synth_start = Instant::now();
    let result = dispatcher.synthesize(&request, &settings)?;
    let synth_dur = synth_start.elapsed();

    let audio_duration = result.duration_secs();
    println!(
        "Synthesized {:.2}s audio in {:.2?} ({:.1}x real-time)",
        audio_duration,
        synth_dur,
        audio_duration / synth_dur.as_secs_f64()
    );

    result.write_wav(&PathBuf::from("output.wav"))?;
    println!("Saved to output.wav");
    Ok(())
}
