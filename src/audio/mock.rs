//! In-memory stand-ins for the platform layer and the mixer, for tests.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::card_locator::{CardProbe, SoundCard};
use super::host::{AudioHost, CaptureStream, DeviceDescriptor, Direction, PlaybackStream};
use super::mixer::MixerControl;
use crate::error::{AudioError, AudioResult, MixerError};

#[derive(Default)]
struct Shared {
    capture_feed: Mutex<VecDeque<Vec<i16>>>,
    fail_capture_when_drained: AtomicBool,
    fail_playback_write: AtomicBool,
    open_streams: AtomicUsize,
    played: Mutex<Vec<(String, Vec<i16>)>>,
    write_delay: Mutex<Duration>,
    discards: AtomicUsize,
}

/// Scriptable [`AudioHost`].
///
/// Capture streams replay whatever was queued with
/// [`push_capture`](MockHost::push_capture); playback streams record what
/// they were given.
#[derive(Default)]
pub struct MockHost {
    inputs: Vec<DeviceDescriptor>,
    outputs: Vec<DeviceDescriptor>,
    default_input: Option<DeviceDescriptor>,
    default_output: Option<DeviceDescriptor>,
    fail_capture_open: AtomicBool,
    fail_playback_open: AtomicBool,
    shared: Arc<Shared>,
}

impl MockHost {
    /// A host with no devices at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// The board's es8388 card on index 3 plus a system default for both directions.
    pub fn es8388() -> Self {
        Self::new()
            .with_device(DeviceDescriptor::new("plughw:3,0", "rockchip-es8388", 16000, 1, Direction::Input))
            .with_device(DeviceDescriptor::new("plughw:3,0", "rockchip-es8388", 48000, 2, Direction::Output))
            .with_default(DeviceDescriptor::new("default", "default", 16000, 1, Direction::Input))
            .with_default(DeviceDescriptor::new("default", "default", 48000, 2, Direction::Output))
    }

    pub fn with_device(mut self, device: DeviceDescriptor) -> Self {
        match device.direction {
            Direction::Input => self.inputs.push(device),
            Direction::Output => self.outputs.push(device),
        }
        self
    }

    pub fn with_default(mut self, device: DeviceDescriptor) -> Self {
        match device.direction {
            Direction::Input => self.default_input = Some(device),
            Direction::Output => self.default_output = Some(device),
        }
        self
    }

    /// Queue interleaved samples for the next capture reads.
    pub fn push_capture(&self, samples: Vec<i16>) {
        self.shared.capture_feed.lock().push_back(samples);
    }

    /// Once the capture queue is empty, reads fail as if the device vanished.
    pub fn fail_capture_when_drained(&self) {
        self.shared.fail_capture_when_drained.store(true, Ordering::SeqCst);
    }

    /// Every playback write from now on fails as if the device vanished.
    pub fn fail_playback_write(&self) {
        self.shared.fail_playback_write.store(true, Ordering::SeqCst);
    }

    pub fn fail_capture_open(&self) {
        self.fail_capture_open.store(true, Ordering::SeqCst);
    }

    pub fn fail_playback_open(&self) {
        self.fail_playback_open.store(true, Ordering::SeqCst);
    }

    /// Delay applied to every playback write.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.shared.write_delay.lock() = delay;
    }

    /// Streams opened and not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.shared.open_streams.load(Ordering::SeqCst)
    }

    /// Everything written to device `id`, concatenated.
    pub fn played_on(&self, id: &str) -> Vec<i16> {
        self.shared
            .played
            .lock()
            .iter()
            .filter(|(dev, _)| dev == id)
            .flat_map(|(_, samples)| samples.iter().copied())
            .collect()
    }

    /// How many times a playback stream threw away queued audio.
    pub fn discards(&self) -> usize {
        self.shared.discards.load(Ordering::SeqCst)
    }

    fn list(&self, direction: Direction) -> &[DeviceDescriptor] {
        match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        }
    }
}

impl AudioHost for MockHost {
    fn devices(&self, direction: Direction) -> AudioResult<Vec<DeviceDescriptor>> {
        Ok(self.list(direction).to_vec())
    }

    fn probe(&self, id: &str, direction: Direction) -> AudioResult<Option<DeviceDescriptor>> {
        Ok(self.list(direction).iter().find(|d| d.id == id).cloned())
    }

    fn default_device(&self, direction: Direction) -> AudioResult<Option<DeviceDescriptor>> {
        Ok(match direction {
            Direction::Input => self.default_input.clone(),
            Direction::Output => self.default_output.clone(),
        })
    }

    fn open_capture(&self, device: &DeviceDescriptor) -> AudioResult<Box<dyn CaptureStream>> {
        if self.fail_capture_open.load(Ordering::SeqCst) {
            return Err(AudioError::Backend(format!("cannot open {} for capture", device.id)));
        }
        self.shared.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockCapture {
            rate: device.sample_rate,
            channels: device.channels,
            shared: self.shared.clone(),
        }))
    }

    fn open_playback(&self, device: &DeviceDescriptor) -> AudioResult<Box<dyn PlaybackStream>> {
        if self.fail_playback_open.load(Ordering::SeqCst) {
            return Err(AudioError::Backend(format!("cannot open {} for playback", device.id)));
        }
        self.shared.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPlayback {
            id: device.id.clone(),
            rate: device.sample_rate,
            channels: device.channels,
            shared: self.shared.clone(),
        }))
    }
}

struct MockCapture {
    rate: u32,
    channels: u16,
    shared: Arc<Shared>,
}

impl CaptureStream for MockCapture {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, buf: &mut [i16]) -> AudioResult<usize> {
        let channels = usize::from(self.channels.max(1));
        let next = self.shared.capture_feed.lock().pop_front();
        let Some(mut chunk) = next else {
            if self.shared.fail_capture_when_drained.load(Ordering::SeqCst) {
                return Err(AudioError::Stream("capture device disappeared".to_string()));
            }
            thread::sleep(Duration::from_millis(2));
            return Ok(0);
        };

        let frames = (chunk.len() / channels).min(buf.len() / channels);
        let taken = frames * channels;
        buf[..taken].copy_from_slice(&chunk[..taken]);
        if chunk.len() > taken {
            let rest = chunk.split_off(taken);
            self.shared.capture_feed.lock().push_front(rest);
        }
        Ok(frames)
    }
}

impl Drop for MockCapture {
    fn drop(&mut self) {
        self.shared.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockPlayback {
    id: String,
    rate: u32,
    channels: u16,
    shared: Arc<Shared>,
}

impl PlaybackStream for MockPlayback {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn write(&mut self, samples: &[i16]) -> AudioResult<()> {
        if self.shared.fail_playback_write.load(Ordering::SeqCst) {
            return Err(AudioError::Stream("playback device disappeared".to_string()));
        }
        let delay = *self.shared.write_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.shared
            .played
            .lock()
            .push((self.id.clone(), samples.to_vec()));
        Ok(())
    }

    fn drain(&mut self) -> AudioResult<()> {
        Ok(())
    }

    fn discard(&mut self) {
        self.shared.discards.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for MockPlayback {
    fn drop(&mut self) {
        self.shared.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Register file keyed by `(card, control)`.
#[derive(Default)]
pub struct MockMixer {
    values: Mutex<BTreeMap<(u32, u32), i64>>,
    writes: Mutex<Vec<(u32, u32, i64)>>,
    failing: Mutex<HashSet<u32>>,
    delay: Mutex<Duration>,
}

impl MockMixer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes to `control` fail from now on.
    pub fn fail_control(&self, control: u32) {
        self.failing.lock().insert(control);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn value(&self, card: u32, control: u32) -> Option<i64> {
        self.values.lock().get(&(card, control)).copied()
    }

    /// Successful writes as `(card, control, value)`, in order.
    pub fn writes(&self) -> Vec<(u32, u32, i64)> {
        self.writes.lock().clone()
    }

    pub fn snapshot(&self) -> BTreeMap<(u32, u32), i64> {
        self.values.lock().clone()
    }
}

#[async_trait]
impl MixerControl for MockMixer {
    fn name(&self) -> &str {
        "mock"
    }

    async fn set_control(&self, card: u32, control: u32, value: i64) -> Result<(), MixerError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&control) {
            return Err(MixerError::Backend(format!("control {} rejected the write", control)));
        }
        self.values.lock().insert((card, control), value);
        self.writes.lock().push((card, control, value));
        Ok(())
    }

    async fn get_control(&self, card: u32, control: u32) -> Result<i64, MixerError> {
        self.value(card, control)
            .ok_or_else(|| MixerError::Unsupported(format!("control {} was never written", control)))
    }
}

/// Fixed card listing, or a listing that always fails.
pub struct MockCardProbe {
    result: Result<Vec<SoundCard>, String>,
}

impl MockCardProbe {
    pub fn listing(cards: Vec<SoundCard>) -> Self {
        Self { result: Ok(cards) }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            result: Err(reason.into()),
        }
    }
}

#[async_trait]
impl CardProbe for MockCardProbe {
    fn name(&self) -> &str {
        "mock"
    }

    async fn cards(&self) -> anyhow::Result<Vec<SoundCard>> {
        self.result.clone().map_err(|reason| anyhow!(reason))
    }
}
