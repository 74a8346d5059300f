//! HTTP client for a remote synthesis worker.
//!
//! The worker exposes two endpoints:
//!
//! - `GET /health` → `{"success": bool, "device": string, "pipeline_loaded": bool}`
//! - `POST /synthesize` with `{"sentences": [...], "voice": string, "voice2": string?,
//!   "speed": number?}` → `{"success": true, "audio": "<base64 wav>"}` or
//!   `{"success": false, "error": string}`
//!
//! Every call is a single attempt bounded by the endpoint timeout. Failures
//! are returned as [`RemoteError`] with the worker's message untouched.

use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::audio::SynthesisResult;
use crate::dispatcher::SynthesisRequest;
use crate::error::{RemoteError, Result, TtsError};
use crate::settings::TtsSettings;

/// Default cap on a worker reply; about an hour of 24 kHz 16-bit audio in base64.
pub const DEFAULT_MAX_REPLY_BYTES: u64 = 256 * 1024 * 1024;

/// Where the worker lives and how to talk to it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEndpoint {
    /// Base URL without a trailing slash.
    pub url: String,
    /// Sent as `Authorization: Bearer <token>`.
    pub token: Option<String>,
    pub timeout: Duration,
    /// Largest reply body accepted from the worker.
    pub max_reply_bytes: u64,
}

impl RemoteEndpoint {
    pub fn new(url: impl AsRef<str>) -> Self {
        Self {
            url: url.as_ref().trim().trim_end_matches('/').to_string(),
            token: None,
            timeout: Duration::from_secs_f64(crate::settings::DEFAULT_REMOTE_TIMEOUT_SECS),
            max_reply_bytes: DEFAULT_MAX_REPLY_BYTES,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_reply_bytes(mut self, limit: u64) -> Self {
        self.max_reply_bytes = limit;
        self
    }

    /// Build the endpoint from settings; an unset URL is a configuration error.
    pub fn from_settings(settings: &TtsSettings) -> Result<Self> {
        let endpoint = Self::new(&settings.remote_url);
        if endpoint.url.is_empty() {
            return Err(TtsError::Configuration(
                "Remote worker URL is not configured".to_string(),
            ));
        }
        let endpoint = endpoint.with_timeout(settings.remote_timeout());
        Ok(match settings.remote_token() {
            Some(token) => endpoint.with_token(token),
            None => endpoint,
        })
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    #[serde(default)]
    pub success: bool,
    /// Device the worker's pipeline runs on; absent until it has loaded.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub pipeline_loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
struct SynthesizePayload<'a> {
    sentences: &'a [String],
    voice: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice2: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f32>,
}

#[derive(Deserialize)]
struct SynthesizeReply {
    #[serde(default)]
    success: bool,
    audio: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct ErrorReply {
    error: Option<String>,
}

pub struct RemoteWorkerClient {
    endpoint: RemoteEndpoint,
    agent: ureq::Agent,
}

impl RemoteWorkerClient {
    pub fn new(endpoint: RemoteEndpoint) -> Self {
        // status codes are inspected by hand so the worker's error body survives
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(endpoint.timeout))
            .http_status_as_error(false)
            .build();
        Self {
            endpoint,
            agent: config.into(),
        }
    }

    pub fn from_settings(settings: &TtsSettings) -> Result<Self> {
        Ok(Self::new(RemoteEndpoint::from_settings(settings)?))
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    /// Query `/health`. Used to verify connectivity, never on the synthesis path.
    pub fn health(&self) -> Result<WorkerHealth> {
        let url = format!("{}/health", self.endpoint.url);
        let response = self
            .authorize(self.agent.get(&url))
            .call()
            .map_err(|e| self.request_error(e))?;
        let body = self.success_body(response)?;

        let health: WorkerHealth = serde_json::from_str(&body)
            .map_err(|e| RemoteError::InvalidResponse(format!("health reply: {e}")))?;
        if !health.success {
            let message = health
                .error
                .unwrap_or_else(|| "Remote worker reported failure".to_string());
            return Err(RemoteError::Worker(message).into());
        }
        Ok(health)
    }

    /// Health check that only reports whether the worker answered successfully.
    pub fn verify(&self) -> bool {
        match self.health() {
            Ok(health) => {
                log::info!(
                    "Connected to remote worker at {} (device: {}, pipeline loaded: {})",
                    self.endpoint.url,
                    health.device.as_deref().unwrap_or("unknown"),
                    health.pipeline_loaded
                );
                true
            }
            Err(e) => {
                log::warn!("Failed to reach remote worker at {}: {e}", self.endpoint.url);
                false
            }
        }
    }

    /// Send the whole request to `/synthesize` and decode the returned WAV.
    pub fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResult> {
        let url = format!("{}/synthesize", self.endpoint.url);
        let payload = SynthesizePayload {
            sentences: &request.sentences,
            voice: &request.primary_voice,
            voice2: request.secondary_voice.as_deref(),
            speed: Some(request.speed),
        };
        log::debug!(
            "Sending {} sentence(s) to remote worker at {}",
            request.sentences.len(),
            self.endpoint.url
        );

        let response = self
            .authorize(self.agent.post(&url))
            .send_json(&payload)
            .map_err(|e| self.request_error(e))?;
        let body = self.success_body(response)?;

        let reply: SynthesizeReply = serde_json::from_str(&body)
            .map_err(|e| RemoteError::InvalidResponse(format!("synthesize reply: {e}")))?;
        if !reply.success {
            let message = reply
                .error
                .unwrap_or_else(|| "Remote worker error".to_string());
            return Err(RemoteError::Worker(message).into());
        }

        let encoded = reply
            .audio
            .ok_or_else(|| RemoteError::InvalidResponse("reply has no audio".to_string()))?;
        let audio_bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| RemoteError::InvalidResponse(format!("audio is not base64: {e}")))?;
        SynthesisResult::from_wav_bytes(audio_bytes)
            .map_err(|e| RemoteError::InvalidResponse(format!("audio is not a WAV file: {e}")).into())
    }

    fn authorize<B>(&self, request: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        match &self.endpoint.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token.trim())),
            None => request,
        }
    }

    /// Read the body of a 2xx response; anything else becomes a status error.
    fn success_body(&self, mut response: ureq::http::Response<ureq::Body>) -> Result<String> {
        let status = response.status();
        let body = response
            .body_mut()
            .with_config()
            .limit(self.endpoint.max_reply_bytes)
            .read_to_string()
            .map_err(|e| self.body_error(e))?;

        if status.is_success() {
            return Ok(body);
        }

        let message = serde_json::from_str::<ErrorReply>(&body)
            .ok()
            .and_then(|reply| reply.error)
            .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_default();
        Err(RemoteError::Status {
            status: status.as_u16(),
            message,
        }
        .into())
    }

    fn request_error(&self, error: ureq::Error) -> TtsError {
        let error = match error {
            ureq::Error::Timeout(_) => RemoteError::Timeout(self.endpoint.timeout.as_secs_f64()),
            other => RemoteError::Transport(other.to_string()),
        };
        error.into()
    }

    /// The worker answered but its body could not be read in full.
    fn body_error(&self, error: ureq::Error) -> TtsError {
        let error = match error {
            ureq::Error::Timeout(_) => RemoteError::Timeout(self.endpoint.timeout.as_secs_f64()),
            ureq::Error::BodyExceedsLimit(limit) => {
                RemoteError::InvalidResponse(format!("reply body exceeds {limit} bytes"))
            }
            other => RemoteError::InvalidResponse(format!("reading reply body: {other}")),
        };
        error.into()
    }
}
