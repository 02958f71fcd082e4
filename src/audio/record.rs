use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::convert::downmix_to_mono;
use super::fanout::{AudioFrame, ListenerFanout};
use super::host::CaptureStream;
use crate::error::AudioError;

/// Called once, from the stream's own thread, when the device fails for good.
pub(crate) type FailureHook = Box<dyn FnOnce(&AudioError) + Send>;

/// Handle to the running capture thread.
pub(crate) struct CaptureWorker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    pub(crate) fn spawn(
        stream: Box<dyn CaptureStream>,
        frame_duration_ms: u32,
        session: u64,
        fanout: Arc<ListenerFanout>,
        on_failure: FailureHook,
    ) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("audio-record".into())
            .spawn(move || {
                record_thread(stream, frame_duration_ms, session, &fanout, &flag, on_failure)
            })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Ask the thread to stop without waiting for it.
    pub(crate) fn signal_stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Stop and join. Blocks for at most one device poll interval.
    pub(crate) fn stop(mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

fn record_thread(
    mut stream: Box<dyn CaptureStream>,
    frame_duration_ms: u32,
    session: u64,
    fanout: &ListenerFanout,
    running: &AtomicBool,
    on_failure: FailureHook,
) {
    let rate = stream.sample_rate();
    let channels = usize::from(stream.channels().max(1));
    let frame_samples = (rate as usize * frame_duration_ms as usize / 1000).max(1);

    let mut read_buf = vec![0i16; frame_samples * channels];
    let mut accum: Vec<i16> = Vec::with_capacity(frame_samples * 2);
    let mut sequence = 0u64;

    log::info!(
        "Recording started: rate={}, ch={}, frame_samples={}",
        rate,
        channels,
        frame_samples
    );

    while running.load(Ordering::Relaxed) {
        let frames = match stream.read(&mut read_buf) {
            Ok(0) => continue,
            Ok(frames) => frames,
            Err(e) => {
                log::error!("Capture device failed: {}", e);
                on_failure(&e);
                return;
            }
        };

        accum.extend(downmix_to_mono(&read_buf[..frames * channels], channels));

        while accum.len() >= frame_samples {
            let samples: Vec<i16> = accum.drain(..frame_samples).collect();
            fanout.dispatch(AudioFrame::new(samples, rate, sequence, session));
            sequence += 1;
        }
    }

    log::info!("Recording stopped after {} frames", sequence);
}
