//! Stream manager: owns the capture and playback streams of one session.
//!
//! `initialize()` runs calibration, device resolution and stream setup in that
//! order; `close()` tears everything down again. Both can be called from any
//! task and are serialized against each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use super::alsa_device::AlsaHost;
use super::calibrator::{CalibrationReport, MixerCalibrator};
use super::card_locator::CardLocator;
use super::convert::prepare_playback;
use super::fanout::{AudioListener, ListenerFanout, ListenerId};
use super::host::{AudioHost, CaptureStream, DeviceDescriptor, Direction, PlaybackStream};
use super::mixer::{build_card_probe, build_mixer};
use super::play::{write_cancellable, PlaybackCommand, PlaybackJob, PlaybackWorker};
use super::record::{CaptureWorker, FailureHook};
use super::resolver::{DeviceResolver, ResolvedDevices};
use crate::config::{AudioConfig, Config};
use crate::error::{AudioError, AudioResult};

/// How long close() waits for listeners to work through queued frames.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How long teardown waits on a single listener callback that is running.
const CALLBACK_WAIT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamState {
    Uninitialized,
    Calibrating,
    Open,
    Closing,
    Closed,
    Failed,
}

struct Session {
    capture: CaptureWorker,
    playback: PlaybackWorker,
    shutdown: watch::Sender<bool>,
}

/// What play() needs from the session, cloned out of the lock.
#[derive(Clone)]
struct PlaybackHandle {
    jobs: mpsc::Sender<PlaybackCommand>,
    cancel: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
    output: DeviceDescriptor,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct AudioCodec {
    config: AudioConfig,
    host: Arc<dyn AudioHost>,
    locator: CardLocator,
    calibrator: MixerCalibrator,
    resolver: DeviceResolver,
    fanout: Arc<ListenerFanout>,
    state: Arc<Mutex<StreamState>>,
    devices: RwLock<Option<ResolvedDevices>>,
    session: tokio::sync::Mutex<Option<Session>>,
    playback: Mutex<Option<PlaybackHandle>>,
    playback_busy: AtomicBool,
    calibration: Mutex<Option<CalibrationReport>>,
}

impl AudioCodec {
    /// ALSA-backed codec using the configured mixer backend.
    pub fn new(config: &Config) -> Self {
        let locator = CardLocator::new(
            build_card_probe(&config.mixer),
            config.mixer.card_identifier.clone(),
            config.mixer.default_card,
        );
        let calibrator = MixerCalibrator::new(
            build_mixer(&config.mixer),
            config.mixer.steps.clone(),
            config.mixer.step_timeout,
        );
        Self::with_parts(config.audio.clone(), Arc::new(AlsaHost::new()), locator, calibrator)
    }

    pub fn with_parts(
        config: AudioConfig,
        host: Arc<dyn AudioHost>,
        locator: CardLocator,
        calibrator: MixerCalibrator,
    ) -> Self {
        let resolver = DeviceResolver::new(host.clone(), &config);
        let fanout = Arc::new(ListenerFanout::new(config.listener_backlog_warn));
        Self {
            config,
            host,
            locator,
            calibrator,
            resolver,
            fanout,
            state: Arc::new(Mutex::new(StreamState::Uninitialized)),
            devices: RwLock::new(None),
            session: tokio::sync::Mutex::new(None),
            playback: Mutex::new(None),
            playback_busy: AtomicBool::new(false),
            calibration: Mutex::new(None),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    fn set_state(&self, state: StreamState) {
        let mut current = self.state.lock();
        if *current != state {
            log::debug!("Audio stream state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Calibrate the codec, resolve devices and open both streams.
    ///
    /// Calling it while already open is a no-op. On error the state is
    /// `Failed` and no stream is left open.
    pub async fn initialize(&self) -> AudioResult<()> {
        let mut session = self.session.lock().await;
        if self.state() == StreamState::Open {
            log::warn!("Audio streams already open, ignoring initialize()");
            return Ok(());
        }
        // 上一次会话因硬件故障进入 Failed，先回收残留线程
        if let Some(stale) = session.take() {
            self.shutdown_session(stale, false).await;
        }

        self.set_state(StreamState::Calibrating);
        let card = self.locator.locate().await;
        let report = self.calibrator.calibrate(card).await;
        *self.calibration.lock() = Some(report);

        match self.open_session(card).await {
            Ok(opened) => {
                *session = Some(opened);
                Ok(())
            }
            Err(e) => {
                log::error!("Audio initialization failed: {}", e);
                *self.devices.write() = None;
                self.set_state(StreamState::Failed);
                Err(e)
            }
        }
    }

    async fn open_session(&self, card: u32) -> AudioResult<Session> {
        let resolver = self.resolver.clone();
        let mut devices = tokio::task::spawn_blocking(move || resolver.resolve(Some(card)))
            .await
            .map_err(AudioError::backend)??;

        let host = self.host.clone();
        let wanted = devices.clone();
        let (capture_stream, playback_stream) =
            tokio::task::spawn_blocking(move || open_streams(host.as_ref(), &wanted))
                .await
                .map_err(AudioError::backend)??;

        adopt_negotiated(&mut devices.input, capture_stream.sample_rate(), capture_stream.channels());
        adopt_negotiated(&mut devices.output, playback_stream.sample_rate(), playback_stream.channels());
        log::info!(
            "Audio streams open: input {} @ {} Hz, output {} @ {} Hz",
            devices.input.id,
            devices.input.sample_rate,
            devices.output.id,
            devices.output.sample_rate
        );

        let playback = PlaybackWorker::spawn(
            playback_stream,
            self.config.playback_chunk_frames,
            self.failure_hook("playback"),
        )
        .map_err(|e| AudioError::Initialization {
            stage: "playback thread",
            reason: e.to_string(),
        })?;
        let jobs = playback.jobs().ok_or_else(|| AudioError::Initialization {
            stage: "playback thread",
            reason: "job queue closed".to_string(),
        })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        *self.playback.lock() = Some(PlaybackHandle {
            jobs,
            cancel: playback.cancel_flag(),
            shutdown: shutdown_rx,
            output: devices.output.clone(),
        });
        *self.devices.write() = Some(devices.clone());

        let session_id = self.fanout.begin_session(&devices.input);
        self.set_state(StreamState::Open);

        let capture = match CaptureWorker::spawn(
            capture_stream,
            self.config.frame_duration_ms,
            session_id,
            self.fanout.clone(),
            self.failure_hook("capture"),
        ) {
            Ok(capture) => capture,
            Err(e) => {
                self.playback.lock().take();
                let fanout = self.fanout.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    fanout.end_session(CALLBACK_WAIT);
                    playback.stop();
                })
                .await;
                return Err(AudioError::Initialization {
                    stage: "capture thread",
                    reason: e.to_string(),
                });
            }
        };

        Ok(Session {
            capture,
            playback,
            shutdown,
        })
    }

    /// Moves an open session to `Failed`. The gate closes first so that no
    /// listener sees a frame once the state has changed.
    fn failure_hook(&self, stream: &'static str) -> FailureHook {
        let state = self.state.clone();
        let fanout = self.fanout.clone();
        Box::new(move |err: &AudioError| {
            fanout.close_gate(CALLBACK_WAIT);
            let mut state = state.lock();
            if *state == StreamState::Open {
                *state = StreamState::Failed;
            }
            log::error!("Audio {} stopped by hardware failure: {}", stream, err);
        })
    }

    /// Stop capture and playback and release both devices.
    ///
    /// No frame reaches a listener once this returns. An in-flight `play()`
    /// resolves with [`AudioError::Cancelled`]. Calling it again is a no-op.
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        let Some(active) = session.take() else {
            let mut state = self.state.lock();
            if *state == StreamState::Failed {
                *state = StreamState::Closed;
            }
            return;
        };

        self.shutdown_session(active, true).await;
        *self.devices.write() = None;
        self.set_state(StreamState::Closed);
        log::info!("Audio streams closed");
    }

    /// Stop capture and let listeners work through queued frames while the
    /// state is still what it was, then close the gate. Only after that does
    /// the state move to `Closing` (when `closing` is set).
    async fn shutdown_session(&self, session: Session, closing: bool) {
        let Session {
            capture,
            playback,
            shutdown,
        } = session;

        shutdown.send_replace(true);
        playback.cancel_flag().store(true, Ordering::Relaxed);

        if tokio::task::spawn_blocking(move || capture.stop()).await.is_err() {
            log::error!("Failed to join capture thread");
        }
        self.fanout.drain(DRAIN_TIMEOUT).await;

        let fanout = self.fanout.clone();
        if tokio::task::spawn_blocking(move || fanout.close_gate(CALLBACK_WAIT))
            .await
            .is_err()
        {
            log::error!("Failed to close listener gate");
        }
        if closing {
            self.set_state(StreamState::Closing);
        }
        self.playback.lock().take();

        let fanout = self.fanout.clone();
        if tokio::task::spawn_blocking(move || fanout.end_session(CALLBACK_WAIT))
            .await
            .is_err()
        {
            log::error!("Failed to notify listeners of capture stop");
        }
        if tokio::task::spawn_blocking(move || playback.stop()).await.is_err() {
            log::error!("Failed to join playback thread");
        }
    }

    /// Play mono `samples` recorded at `sample_rate` and wait until they
    /// have been written and drained.
    ///
    /// `device: None` (or the session's own output id) uses the open output
    /// stream; any other id opens a transient stream on that device. Only one
    /// playback runs at a time, a concurrent call fails with
    /// [`AudioError::Busy`].
    pub async fn play(&self, samples: &[i16], sample_rate: u32, device: Option<&str>) -> AudioResult<()> {
        let state = self.state();
        if state != StreamState::Open {
            return Err(AudioError::InvalidState(state));
        }
        let handle = self
            .playback
            .lock()
            .clone()
            .ok_or_else(|| AudioError::InvalidState(self.state()))?;
        let _busy = BusyGuard::acquire(&self.playback_busy).ok_or(AudioError::Busy)?;

        let mut shutdown = handle.shutdown.clone();
        if *shutdown.borrow() {
            return Err(AudioError::Cancelled);
        }

        let work = async {
            match device.filter(|id| *id != handle.output.id) {
                None => self.play_on_session(&handle, samples, sample_rate).await,
                Some(id) => self.play_transient(id, &handle, samples, sample_rate).await,
            }
        };

        tokio::select! {
            result = work => result,
            _ = closed(&mut shutdown) => {
                log::info!("Playback cancelled by close()");
                Err(AudioError::Cancelled)
            }
        }
    }

    async fn play_on_session(&self, handle: &PlaybackHandle, samples: &[i16], sample_rate: u32) -> AudioResult<()> {
        let out = &handle.output;
        let data = prepare_playback(samples, sample_rate, out.sample_rate, out.channels);
        let (done, result) = oneshot::channel();
        handle
            .jobs
            .send(PlaybackCommand::Play(PlaybackJob { samples: data, done }))
            .await
            .map_err(|_| AudioError::Cancelled)?;
        result.await.unwrap_or(Err(AudioError::Cancelled))
    }

    async fn play_transient(
        &self,
        id: &str,
        handle: &PlaybackHandle,
        samples: &[i16],
        sample_rate: u32,
    ) -> AudioResult<()> {
        let resolver = self.resolver.clone();
        let host = self.host.clone();
        let cancel = handle.cancel.clone();
        let chunk_frames = self.config.playback_chunk_frames;
        let id = id.to_string();
        let samples = samples.to_vec();

        tokio::task::spawn_blocking(move || {
            let device = resolver
                .lookup(&id, Direction::Output)?
                .ok_or_else(|| AudioError::DeviceUnavailable {
                    direction: Direction::Output,
                    reason: format!("device '{}' not found", id),
                })?;
            let mut stream = host.open_playback(&device)?;
            let data = prepare_playback(&samples, sample_rate, stream.sample_rate(), stream.channels());
            log::info!("Playing {} samples on {}", samples.len(), device);
            write_cancellable(stream.as_mut(), &data, chunk_frames, &cancel)
        })
        .await
        .map_err(AudioError::backend)?
    }

    /// Register a consumer of captured frames. Allowed in any state,
    /// including while frames are being delivered.
    pub fn add_audio_listener(&self, listener: Arc<dyn AudioListener>) -> AudioResult<ListenerId> {
        self.fanout
            .add(listener)
            .map_err(|e| AudioError::Backend(format!("cannot start listener delivery thread: {}", e)))
    }

    pub fn remove_audio_listener(&self, id: ListenerId) -> bool {
        self.fanout.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.fanout.len()
    }

    pub fn input_device(&self) -> Option<DeviceDescriptor> {
        self.devices.read().as_ref().map(|d| d.input.clone())
    }

    pub fn output_device(&self) -> Option<DeviceDescriptor> {
        self.devices.read().as_ref().map(|d| d.output.clone())
    }

    pub fn input_sample_rate(&self) -> Option<u32> {
        self.devices.read().as_ref().map(|d| d.input.sample_rate)
    }

    pub fn output_sample_rate(&self) -> Option<u32> {
        self.devices.read().as_ref().map(|d| d.output.sample_rate)
    }

    /// Outcome of the most recent calibration run.
    pub fn calibration_report(&self) -> Option<CalibrationReport> {
        self.calibration.lock().clone()
    }
}

impl Drop for AudioCodec {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.get_mut().take() {
            log::warn!("AudioCodec dropped while open, stopping streams without waiting");
            session.shutdown.send_replace(true);
            session.capture.signal_stop();
            session.playback.signal_stop();
            self.fanout.abort_session();
        }
    }
}

async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

fn adopt_negotiated(device: &mut DeviceDescriptor, rate: u32, channels: u16) {
    if device.sample_rate != rate {
        log::warn!(
            "{} device {} runs at {} Hz instead of {} Hz",
            device.direction,
            device.id,
            rate,
            device.sample_rate
        );
    }
    device.sample_rate = rate;
    device.channels = channels;
}

/// Open capture, then playback. A capture stream is closed again if the
/// playback stream cannot be opened.
fn open_streams(
    host: &dyn AudioHost,
    devices: &ResolvedDevices,
) -> AudioResult<(Box<dyn CaptureStream>, Box<dyn PlaybackStream>)> {
    let capture = host
        .open_capture(&devices.input)
        .map_err(|e| AudioError::Initialization {
            stage: "capture stream",
            reason: e.to_string(),
        })?;

    match host.open_playback(&devices.output) {
        Ok(playback) => Ok((capture, playback)),
        Err(e) => {
            drop(capture);
            log::info!("Closed capture stream on {} after playback open failure", devices.input.id);
            Err(AudioError::Initialization {
                stage: "playback stream",
                reason: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::calibrator::CalibrationStep;
    use crate::audio::card_locator::SoundCard;
    use crate::audio::mock::{MockCardProbe, MockHost, MockMixer};

    fn codec(host: Arc<MockHost>) -> AudioCodec {
        let probe = Arc::new(MockCardProbe::listing(vec![SoundCard {
            index: 3,
            description: "rockchipes8388 [rockchip-es8388]".to_string(),
        }]));
        let calibrator = MixerCalibrator::new(
            Arc::new(MockMixer::new()),
            vec![CalibrationStep::new(3, 4, "ALC Capture Max PGA")],
            Duration::from_secs(1),
        );
        AudioCodec::with_parts(
            AudioConfig::default(),
            host,
            CardLocator::new(probe, "es8388", 0),
            calibrator,
        )
    }

    #[tokio::test]
    async fn initialize_then_close() {
        let host = Arc::new(MockHost::es8388());
        let codec = codec(host.clone());
        assert_eq!(codec.state(), StreamState::Uninitialized);

        codec.initialize().await.unwrap();
        assert_eq!(codec.state(), StreamState::Open);
        assert_eq!(codec.input_sample_rate(), Some(16000));
        assert_eq!(codec.output_sample_rate(), Some(48000));
        assert_eq!(codec.calibration_report().unwrap().card, 3);
        assert_eq!(host.open_streams(), 2);

        codec.close().await;
        assert_eq!(codec.state(), StreamState::Closed);
        assert_eq!(codec.input_device(), None);
        assert_eq!(host.open_streams(), 0);
    }

    #[tokio::test]
    async fn playback_open_failure_rolls_back_capture() {
        let host = Arc::new(MockHost::es8388());
        host.fail_playback_open();
        let codec = codec(host.clone());

        let err = codec.initialize().await.unwrap_err();
        assert!(matches!(err, AudioError::Initialization { stage: "playback stream", .. }));
        assert_eq!(codec.state(), StreamState::Failed);
        assert_eq!(host.open_streams(), 0);
    }

    #[tokio::test]
    async fn play_requires_open_streams() {
        let codec = codec(Arc::new(MockHost::es8388()));
        let err = codec.play(&[0; 16], 16000, None).await.unwrap_err();
        assert!(matches!(err, AudioError::InvalidState(StreamState::Uninitialized)));
    }

    #[tokio::test]
    async fn play_converts_to_device_layout() {
        let host = Arc::new(MockHost::es8388());
        let codec = codec(host.clone());
        codec.initialize().await.unwrap();

        codec.play(&[100; 160], 16000, None).await.unwrap();
        // 16 kHz mono -> 48 kHz stereo
        assert_eq!(host.played_on("default").len(), 960);

        codec.close().await;
    }

    #[test]
    fn busy_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let first = BusyGuard::acquire(&flag);
        assert!(first.is_some());
        assert!(BusyGuard::acquire(&flag).is_none());
        drop(first);
        assert!(BusyGuard::acquire(&flag).is_some());
    }
}
