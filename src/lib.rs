//! Audio device I/O and hardware calibration for the xiaozhi edge board.

pub mod audio;
pub mod config;
pub mod display;
pub mod error;
pub mod sensor;

pub use audio::{AudioCodec, AudioFrame, AudioListener, DeviceDescriptor, Direction, StreamState};
pub use config::Config;
pub use error::{AudioError, AudioResult, ListenerError, MixerError};
