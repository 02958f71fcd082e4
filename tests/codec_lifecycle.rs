use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use xiaozhi_audio::audio::mock::{MockCardProbe, MockHost, MockMixer};
use xiaozhi_audio::audio::{
    AudioCodec, AudioFrame, AudioListener, CalibrationStep, CardLocator, DeviceDescriptor,
    MixerCalibrator, SoundCard, StreamState,
};
use xiaozhi_audio::config::AudioConfig;
use xiaozhi_audio::{AudioError, ListenerError};

struct Recorder {
    name: &'static str,
    fail_on: Option<u64>,
    frames: Mutex<Vec<(u64, i16)>>,
    started: AtomicUsize,
    stopped: AtomicUsize,
}

impl Recorder {
    fn new(name: &'static str, fail_on: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail_on,
            frames: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
        })
    }

    fn sequences(&self) -> Vec<u64> {
        self.frames.lock().unwrap().iter().map(|(seq, _)| *seq).collect()
    }

    fn count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl AudioListener for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn on_audio_frame(&self, frame: &AudioFrame) -> Result<(), ListenerError> {
        self.frames
            .lock()
            .unwrap()
            .push((frame.sequence(), frame.samples()[0]));
        if self.fail_on == Some(frame.sequence()) {
            return Err(ListenerError::failed("wake word model crashed"));
        }
        Ok(())
    }

    fn on_capture_started(&self, _input: &DeviceDescriptor) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_capture_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Slow consumer that notes the manager state every time it gets a frame.
#[derive(Default)]
struct StateWatcher {
    codec: OnceLock<Weak<AudioCodec>>,
    states: Mutex<Vec<StreamState>>,
}

impl AudioListener for StateWatcher {
    fn on_audio_frame(&self, _frame: &AudioFrame) -> Result<(), ListenerError> {
        if let Some(codec) = self.codec.get().and_then(Weak::upgrade) {
            self.states.lock().unwrap().push(codec.state());
        }
        std::thread::sleep(Duration::from_millis(20));
        Ok(())
    }
}

struct Rig {
    host: Arc<MockHost>,
    mixer: Arc<MockMixer>,
    codec: Arc<AudioCodec>,
}

fn rig_with(host: MockHost, config: AudioConfig) -> Rig {
    let host = Arc::new(host);
    let mixer = Arc::new(MockMixer::new());
    let probe = Arc::new(MockCardProbe::listing(vec![
        SoundCard {
            index: 0,
            description: "rockchiphdmi [rockchip-hdmi]".to_string(),
        },
        SoundCard {
            index: 3,
            description: "rockchipes8388 [rockchip-es8388]".to_string(),
        },
    ]));
    let calibrator = MixerCalibrator::new(
        mixer.clone(),
        vec![
            CalibrationStep::new(3, 4, "ALC Capture Max PGA"),
            CalibrationStep::new(4, 2, "ALC Capture Min PGA"),
            CalibrationStep::new(14, 192, "Capture Digital Volume"),
            CalibrationStep::new(31, 1, "Left PGA Mux"),
        ],
        Duration::from_secs(1),
    );
    let codec = AudioCodec::with_parts(
        config,
        host.clone(),
        CardLocator::new(probe, "es8388", 3),
        calibrator,
    );
    Rig {
        host,
        mixer,
        codec: Arc::new(codec),
    }
}

fn rig() -> Rig {
    rig_with(MockHost::es8388(), AudioConfig::default())
}

/// 20 ms at 16 kHz mono, every sample set to `marker`.
fn chunk(marker: i16) -> Vec<i16> {
    vec![marker; 320]
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn close_is_idempotent() {
    let rig = rig();
    rig.codec.close().await;
    assert_eq!(rig.codec.state(), StreamState::Uninitialized);

    rig.codec.initialize().await.unwrap();
    rig.codec.close().await;
    rig.codec.close().await;

    assert_eq!(rig.codec.state(), StreamState::Closed);
    assert_eq!(rig.host.open_streams(), 0);
}

#[tokio::test]
async fn no_devices_is_device_unavailable() {
    let rig = rig_with(MockHost::new(), AudioConfig::default());

    let err = rig.codec.initialize().await.unwrap_err();

    assert!(matches!(err, AudioError::DeviceUnavailable { .. }));
    assert_eq!(rig.codec.state(), StreamState::Failed);
    assert_eq!(rig.host.open_streams(), 0);
    assert_eq!(rig.codec.input_device(), None);
}

#[tokio::test]
async fn capture_open_failure_leaves_nothing_open() {
    let rig = rig();
    rig.host.fail_capture_open();

    let err = rig.codec.initialize().await.unwrap_err();

    assert!(matches!(err, AudioError::Initialization { stage: "capture stream", .. }));
    assert_eq!(rig.host.open_streams(), 0);
    rig.codec.close().await;
    assert_eq!(rig.codec.state(), StreamState::Closed);
}

#[tokio::test]
async fn calibration_runs_before_open_and_is_repeatable() {
    let rig = rig();

    rig.codec.initialize().await.unwrap();
    let first = rig.mixer.snapshot();
    rig.codec.close().await;
    rig.codec.initialize().await.unwrap();

    assert_eq!(rig.mixer.snapshot(), first);
    assert_eq!(rig.mixer.value(3, 14), Some(192));
    let report = rig.codec.calibration_report().unwrap();
    assert_eq!(report.card, 3);
    assert!(report.is_complete());
    rig.codec.close().await;
}

#[tokio::test]
async fn partial_calibration_still_opens_streams() {
    let rig = rig();
    rig.mixer.fail_control(31);

    rig.codec.initialize().await.unwrap();

    assert_eq!(rig.codec.state(), StreamState::Open);
    assert_eq!(rig.codec.calibration_report().unwrap().applied(), 3);
    rig.codec.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_reach_every_listener_in_order() {
    let rig = rig();
    let good = Recorder::new("good", None);
    let flaky = Recorder::new("flaky", Some(2));
    rig.codec.add_audio_listener(good.clone()).unwrap();
    rig.codec.add_audio_listener(flaky.clone()).unwrap();

    rig.codec.initialize().await.unwrap();
    for marker in 0..6 {
        rig.host.push_capture(chunk(marker));
    }
    wait_until("six frames", || good.count() == 6 && flaky.count() == 6).await;
    rig.codec.close().await;

    let expected: Vec<u64> = (0..6).collect();
    assert_eq!(good.sequences(), expected);
    assert_eq!(flaky.sequences(), expected);
    let markers: Vec<i16> = good.frames.lock().unwrap().iter().map(|(_, m)| *m).collect();
    assert_eq!(markers, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(good.started.load(Ordering::SeqCst), 1);
    assert_eq!(good.stopped.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_listener_gets_everything_after_registration() {
    let rig = rig();
    let early = Recorder::new("early", None);
    rig.codec.add_audio_listener(early.clone()).unwrap();
    rig.codec.initialize().await.unwrap();

    for marker in 0..3 {
        rig.host.push_capture(chunk(marker));
    }
    wait_until("first frames", || early.count() == 3).await;

    let late = Recorder::new("late", None);
    rig.codec.add_audio_listener(late.clone()).unwrap();
    for marker in 3..6 {
        rig.host.push_capture(chunk(marker));
    }
    wait_until("late frames", || late.count() == 3).await;
    rig.codec.close().await;

    assert_eq!(late.sequences(), vec![3, 4, 5]);
    assert_eq!(late.started.load(Ordering::SeqCst), 1);
    assert_eq!(early.count(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nothing_is_delivered_after_close() {
    let rig = rig();
    let rec = Recorder::new("rec", None);
    rig.codec.add_audio_listener(rec.clone()).unwrap();
    rig.codec.initialize().await.unwrap();

    rig.host.push_capture(chunk(1));
    wait_until("one frame", || rec.count() == 1).await;
    rig.codec.close().await;

    rig.host.push_capture(chunk(2));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rec.count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removed_listener_is_not_called_again() {
    let rig = rig();
    let rec = Recorder::new("rec", None);
    let id = rig.codec.add_audio_listener(rec.clone()).unwrap();
    rig.codec.initialize().await.unwrap();

    rig.host.push_capture(chunk(1));
    wait_until("one frame", || rec.count() == 1).await;
    assert!(rig.codec.remove_audio_listener(id));

    let other = Recorder::new("other", None);
    rig.codec.add_audio_listener(other.clone()).unwrap();
    rig.host.push_capture(chunk(2));
    wait_until("frame for other", || other.count() == 1).await;
    rig.codec.close().await;

    assert_eq!(rec.count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn capture_failure_marks_stream_failed() {
    let rig = rig();
    let rec = Recorder::new("rec", None);
    rig.codec.add_audio_listener(rec.clone()).unwrap();
    rig.host.fail_capture_when_drained();

    rig.codec.initialize().await.unwrap();
    let codec = rig.codec.clone();
    wait_until("failure", || codec.state() == StreamState::Failed).await;

    let err = rig.codec.play(&[0; 160], 16000, None).await.unwrap_err();
    assert!(matches!(err, AudioError::InvalidState(StreamState::Failed)));

    rig.codec.close().await;
    assert_eq!(rig.codec.state(), StreamState::Closed);
    assert_eq!(rig.host.open_streams(), 0);
    assert_eq!(rec.stopped.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_playback_is_busy_and_close_cancels() {
    let config = AudioConfig {
        playback_chunk_frames: 160,
        ..AudioConfig::default()
    };
    let rig = rig_with(MockHost::es8388(), config);
    rig.host.set_write_delay(Duration::from_millis(20));
    rig.codec.initialize().await.unwrap();

    let codec = rig.codec.clone();
    let long_play = tokio::spawn(async move {
        let one_second = vec![1000i16; 16000];
        codec.play(&one_second, 16000, None).await
    });

    let codec = rig.codec.clone();
    let host = rig.host.clone();
    wait_until("playback to start", || !host.played_on("default").is_empty()).await;
    let err = codec.play(&[0; 160], 16000, None).await.unwrap_err();
    assert!(matches!(err, AudioError::Busy));

    let started = tokio::time::Instant::now();
    rig.codec.close().await;
    let result = tokio::time::timeout(Duration::from_secs(1), long_play)
        .await
        .expect("play() should return promptly after close()")
        .unwrap();

    assert!(matches!(result, Err(AudioError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(rig.host.played_on("default").len() < 96000);
}

#[tokio::test]
async fn playback_can_target_another_device() {
    let rig = rig();
    rig.codec.initialize().await.unwrap();

    rig.codec.play(&[5; 160], 16000, Some("plughw:3,0")).await.unwrap();
    assert_eq!(rig.host.played_on("plughw:3,0").len(), 960);
    assert!(rig.host.played_on("default").is_empty());

    let err = rig.codec.play(&[5; 160], 16000, Some("hw:7,0")).await.unwrap_err();
    assert!(matches!(err, AudioError::DeviceUnavailable { .. }));
    rig.codec.close().await;
}

#[tokio::test]
async fn configured_device_is_used_at_native_rate() {
    let host = MockHost::es8388().with_device(DeviceDescriptor::new(
        "hw:2,0",
        "usb mic",
        48000,
        1,
        xiaozhi_audio::Direction::Input,
    ));
    let config = AudioConfig {
        input_device: Some("hw:2,0".to_string()),
        ..AudioConfig::default()
    };
    let rig = rig_with(host, config);

    rig.codec.initialize().await.unwrap();
    assert_eq!(rig.codec.input_device().unwrap().id, "hw:2,0");
    assert_eq!(rig.codec.input_sample_rate(), Some(48000));
    rig.codec.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_listener_only_sees_frames_while_open() {
    let rig = rig();
    let watcher = Arc::new(StateWatcher::default());
    watcher.codec.set(Arc::downgrade(&rig.codec)).unwrap();
    rig.codec.add_audio_listener(watcher.clone()).unwrap();
    rig.codec.initialize().await.unwrap();

    for marker in 0..10 {
        rig.host.push_capture(chunk(marker));
    }
    wait_until("first frame", || !watcher.states.lock().unwrap().is_empty()).await;
    rig.codec.close().await;

    let states = watcher.states.lock().unwrap().clone();
    assert!(
        states.iter().all(|s| *s == StreamState::Open),
        "states seen by listener: {:?}",
        states
    );
    assert_eq!(rig.codec.state(), StreamState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn playback_device_failure_marks_stream_failed() {
    let rig = rig();
    rig.codec.initialize().await.unwrap();
    rig.host.fail_playback_write();

    let err = rig.codec.play(&[0; 160], 16000, None).await.unwrap_err();
    assert!(matches!(err, AudioError::Stream(_)));
    assert_eq!(rig.codec.state(), StreamState::Failed);

    let err = rig.codec.play(&[0; 160], 16000, None).await.unwrap_err();
    assert!(matches!(err, AudioError::InvalidState(StreamState::Failed)));

    rig.codec.close().await;
    assert_eq!(rig.codec.state(), StreamState::Closed);
    assert_eq!(rig.host.open_streams(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listeners_added_during_delivery_get_a_gapless_tail() {
    const FRAMES: i16 = 200;
    let rig = rig();
    rig.codec.initialize().await.unwrap();

    let host = rig.host.clone();
    let feeder = tokio::task::spawn_blocking(move || {
        for marker in 0..FRAMES {
            host.push_capture(chunk(marker));
            std::thread::sleep(Duration::from_millis(1));
        }
    });
    let codec = rig.codec.clone();
    let registrar = tokio::spawn(async move {
        let mut joiners = Vec::new();
        for _ in 0..20 {
            let rec = Recorder::new("joiner", None);
            codec.add_audio_listener(rec.clone()).unwrap();
            joiners.push(rec);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        joiners
    });

    feeder.await.unwrap();
    let joiners = registrar.await.unwrap();
    let last = FRAMES as u64 - 1;
    wait_until("first joiner to reach the last frame", || {
        joiners[0].sequences().last() == Some(&last)
    })
    .await;
    rig.codec.close().await;

    assert!(!joiners[0].sequences().is_empty());
    for rec in &joiners {
        let seen = rec.sequences();
        let Some(&first) = seen.first() else {
            // registered after the last frame was dispatched
            continue;
        };
        let expected: Vec<u64> = (first..=last).collect();
        assert_eq!(seen, expected);
        assert_eq!(rec.started.load(Ordering::SeqCst), 1);
        assert_eq!(rec.stopped.load(Ordering::SeqCst), 1);
    }
}
