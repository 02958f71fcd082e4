//! ALSA PCM device wrappers for audio capture and playback.

use alsa::device_name::HintIter;
use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::ValueOr;
use anyhow::{Context, Result};

use super::host::{AudioHost, CaptureStream, DeviceDescriptor, Direction, PlaybackStream};
use crate::error::{AudioError, AudioResult};

/// Rates tried in order when picking a device's native rate.
const NATIVE_RATES: [u32; 7] = [48000, 44100, 32000, 24000, 22050, 16000, 8000];

/// How long a capture read waits for data before returning to the caller.
const CAPTURE_POLL_MS: u32 = 200;

/// Consecutive failed recoveries before a playback write gives up.
const MAX_WRITE_RETRIES: u32 = 3;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
}

fn alsa_direction(direction: Direction) -> alsa::Direction {
    match direction {
        Direction::Input => alsa::Direction::Capture,
        Direction::Output => alsa::Direction::Playback,
    }
}

/// Open a PCM device for capture (recording).
pub fn open_capture(device: &str, sample_rate: u32, channels: u32) -> Result<(PCM, AlsaParams)> {
    let (pcm, params) = open_pcm(device, Direction::Input, sample_rate, channels)?;
    // capture 在 PREPARED 状态下不会自动开始，poll 会一直等不到数据
    pcm.start().context("Failed to start capture")?;
    Ok((pcm, params))
}

/// Open a PCM device for playback.
pub fn open_playback(device: &str, sample_rate: u32, channels: u32) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Output, sample_rate, channels)
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, alsa_direction(direction), false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, direction))?;

    // Configure hardware parameters
    {
        let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let (actual_rate, actual_channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        let rate = hwp.get_rate()?;
        let ch = hwp.get_channels()?;
        let ps = hwp.get_period_size()? as usize;
        (rate, ch, ps)
    };

    let params = AlsaParams {
        sample_rate: actual_rate,
        channels: actual_channels,
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        direction,
        device,
        actual_rate,
        actual_channels,
        period_size,
    );

    Ok((pcm, params))
}

/// Query the hardware ranges of a device without configuring it.
///
/// Opened non-blocking so that a device held by another process fails fast
/// instead of stalling enumeration.
fn probe_params(device: &str, direction: Direction) -> Result<(u32, u32)> {
    let pcm = PCM::new(device, alsa_direction(direction), true)
        .with_context(|| format!("Failed to open PCM device '{}' for probing", device))?;
    let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;

    let (rate_min, rate_max) = (hwp.get_rate_min()?, hwp.get_rate_max()?);
    let rate = NATIVE_RATES
        .iter()
        .copied()
        .find(|r| (rate_min..=rate_max).contains(r))
        .unwrap_or(rate_max);

    let (ch_min, ch_max) = (hwp.get_channels_min()?, hwp.get_channels_max()?);
    let preferred = match direction {
        Direction::Input => 1,
        Direction::Output => 2,
    };
    let channels = if (ch_min..=ch_max).contains(&preferred) {
        preferred
    } else {
        ch_min
    };

    Ok((rate, channels))
}

/// [`AudioHost`] backed by ALSA.
#[derive(Debug, Default)]
pub struct AlsaHost;

impl AlsaHost {
    pub fn new() -> Self {
        Self
    }

    fn describe(&self, id: &str, name: &str, direction: Direction) -> Option<DeviceDescriptor> {
        match probe_params(id, direction) {
            Ok((rate, channels)) => Some(DeviceDescriptor::new(
                id,
                name,
                rate,
                channels as u16,
                direction,
            )),
            Err(e) => {
                log::debug!("Skipping {} device {}: {:#}", direction, id, e);
                None
            }
        }
    }
}

impl AudioHost for AlsaHost {
    fn devices(&self, direction: Direction) -> AudioResult<Vec<DeviceDescriptor>> {
        let hints = HintIter::new_str(None, "pcm").map_err(AudioError::backend)?;

        let mut devices = Vec::new();
        for hint in hints {
            let Some(id) = hint.name else { continue };
            if id == "null" {
                continue;
            }
            // direction 为 None 表示同时支持录音和播放
            if let Some(d) = hint.direction {
                if d != alsa_direction(direction) {
                    continue;
                }
            }
            let name = hint
                .desc
                .as_deref()
                .and_then(|d| d.lines().next())
                .unwrap_or(&id)
                .to_string();
            if let Some(desc) = self.describe(&id, &name, direction) {
                devices.push(desc);
            }
        }
        log::debug!("Found {} {} devices", devices.len(), direction);
        Ok(devices)
    }

    fn probe(&self, id: &str, direction: Direction) -> AudioResult<Option<DeviceDescriptor>> {
        Ok(self.describe(id, id, direction))
    }

    fn default_device(&self, direction: Direction) -> AudioResult<Option<DeviceDescriptor>> {
        Ok(self.describe("default", "default", direction))
    }

    fn open_capture(&self, device: &DeviceDescriptor) -> AudioResult<Box<dyn CaptureStream>> {
        let (pcm, params) = open_capture(&device.id, device.sample_rate, u32::from(device.channels))
            .map_err(AudioError::backend_chain)?;
        Ok(Box::new(AlsaCapture { pcm, params }))
    }

    fn open_playback(&self, device: &DeviceDescriptor) -> AudioResult<Box<dyn PlaybackStream>> {
        let (pcm, params) = open_playback(&device.id, device.sample_rate, u32::from(device.channels))
            .map_err(AudioError::backend_chain)?;
        Ok(Box::new(AlsaPlayback { pcm, params }))
    }
}

pub struct AlsaCapture {
    pcm: PCM,
    params: AlsaParams,
}

impl CaptureStream for AlsaCapture {
    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn channels(&self) -> u16 {
        self.params.channels as u16
    }

    fn read(&mut self, buf: &mut [i16]) -> AudioResult<usize> {
        match self.pcm.wait(Some(CAPTURE_POLL_MS)) {
            Ok(true) => {}
            Ok(false) => return Ok(0),
            Err(e) => log::warn!("ALSA capture wait error: {}, recovering...", e),
        }

        let io = self.pcm.io_i16().map_err(AudioError::backend)?;
        match io.readi(buf) {
            Ok(frames) => Ok(frames),
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                self.pcm
                    .prepare()
                    .and_then(|_| self.pcm.start())
                    .map_err(|e2| AudioError::Stream(format!("Failed to recover PCM capture: {}", e2)))?;
                Ok(0)
            }
        }
    }
}

pub struct AlsaPlayback {
    pcm: PCM,
    params: AlsaParams,
}

impl PlaybackStream for AlsaPlayback {
    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn channels(&self) -> u16 {
        self.params.channels as u16
    }

    fn write(&mut self, samples: &[i16]) -> AudioResult<()> {
        let channels = self.params.channels.max(1) as usize;
        let io = self.pcm.io_i16().map_err(AudioError::backend)?;

        // Retry short writes and XRUN recovery without losing frames.
        let total_frames = samples.len() / channels;
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        while frames_written < total_frames {
            let offset = frames_written * channels;
            match io.writei(&samples[offset..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;

                    if let Err(e2) = self.pcm.prepare() {
                        return Err(AudioError::Stream(format!(
                            "Failed to recover PCM playback: {}",
                            e2
                        )));
                    }

                    // 底层持续跟不上写入速度时放弃，避免死循环
                    if retry_count >= MAX_WRITE_RETRIES {
                        return Err(AudioError::Stream(format!(
                            "Max recovery retries ({}) reached with {} frames unwritten",
                            retry_count,
                            total_frames - frames_written
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> AudioResult<()> {
        self.pcm
            .drain()
            .map_err(|e| AudioError::Stream(format!("Failed to drain PCM playback: {}", e)))
    }

    fn discard(&mut self) {
        if let Err(e) = self.pcm.drop() {
            log::debug!("Failed to drop pending playback frames: {}", e);
        }
    }
}
