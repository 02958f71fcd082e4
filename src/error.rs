//! Error types for the audio subsystem.
//!
//! Only stream lifecycle failures are fatal. Calibration and listener
//! failures are recorded and logged, never propagated to the capture path.

use std::time::Duration;

use thiserror::Error;

use crate::audio::{Direction, StreamState};

/// Fatal errors surfaced to whoever called `initialize()` or `play()`.
#[derive(Debug, Error)]
pub enum AudioError {
    /// No usable device could be resolved for one direction.
    #[error("no usable {direction} device: {reason}")]
    DeviceUnavailable { direction: Direction, reason: String },

    /// A stream failed to open after devices were resolved.
    #[error("initialization failed while opening {stage}: {reason}")]
    Initialization { stage: &'static str, reason: String },

    /// The output device is already held by another playback.
    #[error("playback device is busy")]
    Busy,

    /// The operation was interrupted by `close()`.
    #[error("operation cancelled")]
    Cancelled,

    #[error("operation not allowed in state {0:?}")]
    InvalidState(StreamState),

    /// Read/write failure on an open stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// Failure reported by the platform audio layer.
    #[error("audio backend error: {0}")]
    Backend(String),
}

impl AudioError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    /// Wrap an `anyhow` chain so that every context layer ends up in the message.
    pub fn backend_chain(err: anyhow::Error) -> Self {
        Self::Backend(format!("{:#}", err))
    }
}

pub type AudioResult<T> = Result<T, AudioError>;

/// Why a single mixer register write failed.
#[derive(Debug, Error)]
pub enum MixerError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("mixer backend error: {0}")]
    Backend(String),

    #[error("unsupported control: {0}")]
    Unsupported(String),
}

/// Error returned by an [`AudioListener`](crate::audio::AudioListener) callback.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("{0}")]
    Failed(String),

    /// The consumer is gone (e.g. its receiving channel was dropped).
    #[error("listener disconnected")]
    Disconnected,
}

impl ListenerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// A compile-time configuration value that could not be parsed.
#[derive(Debug, Error)]
#[error("invalid configuration value for {key}: {value:?}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}
