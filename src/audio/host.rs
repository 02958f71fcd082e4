//! Platform audio layer seam.
//!
//! The stream manager never talks to ALSA directly; it goes through
//! [`AudioHost`] so that device enumeration and stream I/O can be replaced
//! (see [`crate::audio::mock`]).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AudioResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Resolved identity and native capability of a physical audio device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Handle understood by the platform layer (e.g. "plughw:3,0", "default")
    pub id: String,
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub direction: Direction,
}

impl DeviceDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        sample_rate: u32,
        channels: u16,
        direction: Direction,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            sample_rate,
            channels,
            direction,
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} \"{}\" ({} Hz, {} ch)",
            self.id, self.name, self.sample_rate, self.channels
        )
    }
}

/// Enumerates devices and opens streams.
///
/// Every method may block briefly (device open, capability probing) and
/// must not be called from a latency-sensitive context.
pub trait AudioHost: Send + Sync {
    /// All devices usable in `direction`, re-read on every call.
    fn devices(&self, direction: Direction) -> AudioResult<Vec<DeviceDescriptor>>;

    /// Probe a device that is not necessarily listed (ALSA accepts arbitrary
    /// PCM names such as "plughw:2,0"). `Ok(None)` means it cannot be opened.
    fn probe(&self, id: &str, direction: Direction) -> AudioResult<Option<DeviceDescriptor>>;

    fn default_device(&self, direction: Direction) -> AudioResult<Option<DeviceDescriptor>>;

    fn open_capture(&self, device: &DeviceDescriptor) -> AudioResult<Box<dyn CaptureStream>>;

    fn open_playback(&self, device: &DeviceDescriptor) -> AudioResult<Box<dyn PlaybackStream>>;
}

/// An open capture stream delivering interleaved i16 samples.
pub trait CaptureStream: Send {
    /// Negotiated sample rate.
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Read up to `buf.len() / channels` frames. Returns the number of frames
    /// read; `Ok(0)` means nothing arrived within the stream's poll interval.
    /// An `Err` is unrecoverable.
    fn read(&mut self, buf: &mut [i16]) -> AudioResult<usize>;
}

/// An open playback stream accepting interleaved i16 samples.
pub trait PlaybackStream: Send {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Write all of `samples`, blocking until the device accepted them.
    fn write(&mut self, samples: &[i16]) -> AudioResult<()>;

    /// Block until everything written has been played.
    fn drain(&mut self) -> AudioResult<()>;

    /// Throw away anything still queued in the device.
    fn discard(&mut self);
}
