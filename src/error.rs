//! Error taxonomy shared by the lifecycle manager, dispatcher and remote client.
//!
//! Device resolution never produces an error: it degrades to CPU with a
//! warning instead (see [`crate::device::DeviceResolver`]).

#[derive(thiserror::Error, Debug)]
pub enum TtsError {
    /// Settings do not allow the requested operation (e.g. remote policy with no URL).
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// The local inference resource could not be built or is not available.
    #[error("Model resource error on {device}: {message}")]
    Resource { device: String, message: String },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Malformed blend spec, non-positive speed and similar request errors.
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("WAV encoding error: {0}")]
    Audio(#[from] hound::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TtsError {
    pub(crate) fn resource(device: impl ToString, message: impl ToString) -> Self {
        TtsError::Resource {
            device: device.to_string(),
            message: message.to_string(),
        }
    }
}

/// Failures talking to a remote worker. Upstream messages are carried verbatim.
#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    #[error("Remote worker unreachable: {0}")]
    Transport(String),
    #[error("Remote worker timed out after {0:.1}s")]
    Timeout(f64),
    #[error("Remote worker returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Remote worker error: {0}")]
    Worker(String),
    #[error("Invalid response from remote worker: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, TtsError>;
