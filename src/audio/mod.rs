//! audio - Device I/O and codec calibration for the board's sound card
//!
//! Locates the codec's card, brings its mixer into a calibrated state,
//! resolves capture/playback devices at their native rates and fans captured
//! frames out to any number of listeners. ALSA is reached through
//! [`AudioHost`]; [`mock`] provides an in-memory host for tests.

mod alsa_device;
mod audio_codec;
mod calibrator;
mod card_locator;
mod command;
mod convert;
mod fanout;
mod host;
mod mixer;
pub mod mock;
mod play;
mod record;
mod resolver;
pub mod tone;
pub mod wav;

pub use alsa_device::AlsaHost;
pub use audio_codec::{AudioCodec, StreamState};
pub use calibrator::{CalibrationReport, CalibrationStep, MixerCalibrator, StepOutcome};
pub use card_locator::{
    parse_card_listing, AlsaCardProbe, CardLocator, CardProbe, CommandCardProbe, FallbackCardProbe,
    SoundCard,
};
pub use command::run_command;
pub use convert::{downmix_to_mono, prepare_playback, resample, upmix_mono};
pub use fanout::{AudioFrame, AudioListener, FrameForwarder, ListenerFanout, ListenerId};
pub use host::{AudioHost, CaptureStream, DeviceDescriptor, Direction, PlaybackStream};
pub use mixer::{build_card_probe, build_mixer, AlsaMixer, CommandMixer, FallbackMixer, MixerControl};
pub use resolver::{DeviceResolver, ResolvedDevices};
