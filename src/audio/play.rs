use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};

use super::host::PlaybackStream;
use super::record::FailureHook;
use crate::error::{AudioError, AudioResult};

/// Samples already in the device's layout, plus where to report completion.
pub(crate) struct PlaybackJob {
    pub samples: Vec<i16>,
    pub done: oneshot::Sender<AudioResult<()>>,
}

pub(crate) enum PlaybackCommand {
    Play(PlaybackJob),
    Shutdown,
}

/// Owns the session's output stream on a dedicated thread.
pub(crate) struct PlaybackWorker {
    jobs: Option<mpsc::Sender<PlaybackCommand>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PlaybackWorker {
    /// `on_failure` runs once if the device fails for good; the thread then
    /// exits and later jobs are refused.
    pub(crate) fn spawn(
        stream: Box<dyn PlaybackStream>,
        chunk_frames: usize,
        on_failure: FailureHook,
    ) -> io::Result<Self> {
        // 同一时间只允许一个播放请求，队列深度 1 即可
        let (tx, rx) = mpsc::channel(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let handle = thread::Builder::new()
            .name("audio-play".into())
            .spawn(move || play_thread(stream, rx, chunk_frames, &flag, on_failure))?;
        Ok(Self {
            jobs: Some(tx),
            cancel,
            handle: Some(handle),
        })
    }

    pub(crate) fn jobs(&self) -> Option<mpsc::Sender<PlaybackCommand>> {
        self.jobs.clone()
    }

    /// Shared with transient playbacks so that close() stops them too.
    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Ask the thread to stop without waiting for it.
    pub(crate) fn signal_stop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(tx) = self.jobs.take() {
            let _ = tx.try_send(PlaybackCommand::Shutdown);
        }
    }

    /// Cancel any in-flight write and join the thread. Must not be called
    /// from async context.
    pub(crate) fn stop(mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(tx) = self.jobs.take() {
            let _ = tx.blocking_send(PlaybackCommand::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Playback thread panicked");
            }
        }
    }
}

fn play_thread(
    mut stream: Box<dyn PlaybackStream>,
    mut rx: mpsc::Receiver<PlaybackCommand>,
    chunk_frames: usize,
    cancel: &AtomicBool,
    on_failure: FailureHook,
) {
    log::info!(
        "Playback started: rate={}, ch={}",
        stream.sample_rate(),
        stream.channels()
    );

    while let Some(PlaybackCommand::Play(job)) = rx.blocking_recv() {
        let result = write_cancellable(stream.as_mut(), &job.samples, chunk_frames, cancel);
        if let Err(e) = &result {
            if !matches!(e, AudioError::Cancelled) {
                log::error!("Playback device failed: {}", e);
                on_failure(e);
                let _ = job.done.send(result);
                break;
            }
        }
        // 调用方可能已经因 close() 放弃等待
        let _ = job.done.send(result);
    }

    log::info!("Playback stopped");
}

/// Write `samples` in chunks of `chunk_frames`, checking `cancel` between
/// chunks, then drain. A cancelled write discards what the device still holds.
pub(crate) fn write_cancellable(
    stream: &mut dyn PlaybackStream,
    samples: &[i16],
    chunk_frames: usize,
    cancel: &AtomicBool,
) -> AudioResult<()> {
    let channels = usize::from(stream.channels().max(1));
    let chunk = chunk_frames.max(1) * channels;

    for part in samples.chunks(chunk) {
        if cancel.load(Ordering::Relaxed) {
            stream.discard();
            return Err(AudioError::Cancelled);
        }
        stream.write(part)?;
    }

    if cancel.load(Ordering::Relaxed) {
        stream.discard();
        return Err(AudioError::Cancelled);
    }
    stream.drain()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::host::{AudioHost, DeviceDescriptor, Direction};
    use crate::audio::mock::MockHost;
    use std::time::Duration;

    fn output() -> DeviceDescriptor {
        DeviceDescriptor::new("plughw:3,0", "es8388", 48000, 2, Direction::Output)
    }

    #[test]
    fn writes_everything_in_chunks() {
        let host = MockHost::es8388();
        let mut stream = host.open_playback(&output()).unwrap();
        let samples: Vec<i16> = (0..1000).collect();

        write_cancellable(stream.as_mut(), &samples, 64, &AtomicBool::new(false)).unwrap();

        assert_eq!(host.played_on("plughw:3,0"), samples);
    }

    #[test]
    fn cancelled_before_start_writes_nothing() {
        let host = MockHost::es8388();
        let mut stream = host.open_playback(&output()).unwrap();

        let err = write_cancellable(stream.as_mut(), &[1; 256], 64, &AtomicBool::new(true)).unwrap_err();

        assert!(matches!(err, AudioError::Cancelled));
        assert!(host.played_on("plughw:3,0").is_empty());
        assert_eq!(host.discards(), 1);
    }

    #[tokio::test]
    async fn worker_reports_completion() {
        let host = MockHost::es8388();
        let stream = host.open_playback(&output()).unwrap();
        let worker = PlaybackWorker::spawn(stream, 32, Box::new(|_: &AudioError| {})).unwrap();

        let (done, result) = oneshot::channel();
        let jobs = worker.jobs().unwrap();
        jobs.send(PlaybackCommand::Play(PlaybackJob { samples: vec![7; 128], done }))
            .await
            .unwrap();
        result.await.unwrap().unwrap();

        tokio::task::spawn_blocking(move || worker.stop()).await.unwrap();
        assert_eq!(host.played_on("plughw:3,0").len(), 128);
        assert_eq!(host.open_streams(), 0);
    }

    #[tokio::test]
    async fn write_failure_runs_hook_and_refuses_later_jobs() {
        let host = MockHost::es8388();
        host.fail_playback_write();
        let stream = host.open_playback(&output()).unwrap();
        let (hook_tx, hook_rx) = oneshot::channel();
        let worker = PlaybackWorker::spawn(
            stream,
            32,
            Box::new(move |e: &AudioError| {
                let _ = hook_tx.send(e.to_string());
            }),
        )
        .unwrap();
        let jobs = worker.jobs().unwrap();

        let (done, result) = oneshot::channel();
        jobs.send(PlaybackCommand::Play(PlaybackJob { samples: vec![7; 128], done }))
            .await
            .unwrap();
        assert!(matches!(result.await.unwrap(), Err(AudioError::Stream(_))));
        assert!(hook_rx.await.unwrap().contains("playback device disappeared"));

        tokio::time::timeout(Duration::from_secs(1), jobs.closed())
            .await
            .unwrap();

        tokio::task::spawn_blocking(move || worker.stop()).await.unwrap();
    }
}
