//! Listener fan-out: hands every captured frame to every registered consumer.
//!
//! The capture thread only enqueues. Each listener owns a FIFO queue drained
//! by its own delivery thread, so a slow or failing consumer never stalls
//! the hardware callback or the other consumers.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::host::DeviceDescriptor;
use crate::error::ListenerError;

/// A chunk of captured mono PCM. Cheap to clone, never mutable.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    sample_rate: u32,
    sequence: u64,
    session: u64,
}

impl AudioFrame {
    pub(crate) fn new(samples: Vec<i16>, sample_rate: u32, sequence: u64, session: u64) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            sequence,
            session,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Native rate of the capture device.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Position of this frame in the capture session, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// A consumer of captured audio.
///
/// Only [`on_audio_frame`](AudioListener::on_audio_frame) is required; the
/// lifecycle hooks default to no-ops. All methods run on the listener's own
/// delivery thread, never on the capture thread.
pub trait AudioListener: Send + Sync + 'static {
    /// Name used in log lines.
    fn name(&self) -> &str {
        "listener"
    }

    fn on_audio_frame(&self, frame: &AudioFrame) -> Result<(), ListenerError>;

    /// Called before the first frame of a capture session.
    fn on_capture_started(&self, _input: &DeviceDescriptor) {}

    /// Called once the capture session has ended; no frame follows it.
    fn on_capture_stopped(&self) {}
}

impl<F> AudioListener for F
where
    F: Fn(&AudioFrame) -> Result<(), ListenerError> + Send + Sync + 'static,
{
    fn on_audio_frame(&self, frame: &AudioFrame) -> Result<(), ListenerError> {
        self(frame)
    }
}

/// Forwards frames into a tokio channel for async consumers
/// (e.g. a wake-word task or the speech uplink).
///
/// Never blocks: when the channel is full the frame is dropped for this
/// consumer and the failure is logged.
pub struct FrameForwarder {
    name: String,
    tx: mpsc::Sender<AudioFrame>,
}

impl FrameForwarder {
    pub fn new(name: impl Into<String>, tx: mpsc::Sender<AudioFrame>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }
}

impl AudioListener for FrameForwarder {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_audio_frame(&self, frame: &AudioFrame) -> Result<(), ListenerError> {
        self.tx.try_send(frame.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ListenerError::failed(format!("channel full, frame {} dropped", frame.sequence()))
            }
            mpsc::error::TrySendError::Closed(_) => ListenerError::Disconnected,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Delivery {
    Started(Arc<DeviceDescriptor>, u64),
    Frame(AudioFrame),
}

impl Delivery {
    fn session(&self) -> u64 {
        match self {
            Delivery::Started(_, session) => *session,
            Delivery::Frame(frame) => frame.session,
        }
    }
}

struct ListenerSlot {
    id: ListenerId,
    listener: Arc<dyn AudioListener>,
    tx: mpsc::UnboundedSender<Delivery>,
    pending: Arc<AtomicUsize>,
    /// Held while a callback runs; closing a session takes it to wait out
    /// an in-flight delivery.
    delivering: Arc<Mutex<()>>,
}

impl ListenerSlot {
    fn enqueue(&self, item: Delivery, backlog_warn: usize) {
        let depth = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if self.tx.send(item).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        if backlog_warn > 0 && depth == backlog_warn {
            log::warn!(
                "Listener '{}' is lagging: {} frames queued",
                self.listener.name(),
                depth
            );
        }
    }
}

struct Session {
    id: u64,
    input: Arc<DeviceDescriptor>,
}

/// Registry of listeners plus the session gate.
///
/// A frame is delivered only while its session is the open one, so nothing
/// reaches a listener after [`close_gate`](ListenerFanout::close_gate) or
/// [`end_session`](ListenerFanout::end_session).
pub struct ListenerFanout {
    slots: Mutex<Vec<Arc<ListenerSlot>>>,
    session: Mutex<Option<Session>>,
    open_session: Arc<AtomicU64>,
    next_id: AtomicU64,
    next_session: AtomicU64,
    backlog_warn: usize,
}

impl ListenerFanout {
    pub fn new(backlog_warn: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            session: Mutex::new(None),
            open_session: Arc::new(AtomicU64::new(0)),
            next_id: AtomicU64::new(1),
            next_session: AtomicU64::new(1),
            backlog_warn,
        }
    }

    /// Register `listener` and start its delivery thread.
    ///
    /// Fails only if the thread cannot be spawned; the listener is then not
    /// registered.
    pub fn add(&self, listener: Arc<dyn AudioListener>) -> io::Result<ListenerId> {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = Arc::new(ListenerSlot {
            id,
            listener: listener.clone(),
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
            delivering: Arc::new(Mutex::new(())),
        });

        let worker = DeliveryWorker {
            listener,
            rx,
            pending: slot.pending.clone(),
            delivering: slot.delivering.clone(),
            open_session: self.open_session.clone(),
        };
        thread::Builder::new()
            .name(format!("audio-listener-{}", id.0))
            .spawn(move || worker.run())
            .map_err(|e| {
                log::error!("Failed to spawn delivery thread for listener {:?}: {}", id, e);
                e
            })?;

        // 与 begin_session 在同一把锁下，保证不会漏掉正在开启的会话
        let session = self.session.lock();
        if let Some(s) = session.as_ref() {
            slot.enqueue(Delivery::Started(s.input.clone(), s.id), self.backlog_warn);
        }
        self.slots.lock().push(slot);
        drop(session);

        log::debug!("Registered audio listener {:?}", id);
        Ok(id)
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.len();
        // Dropping the slot closes its queue and ends the delivery thread.
        slots.retain(|s| s.id != id);
        before != slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open the gate for a new capture session and announce it.
    pub(crate) fn begin_session(&self, input: &DeviceDescriptor) -> u64 {
        let mut session = self.session.lock();
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let input = Arc::new(input.clone());
        self.open_session.store(id, Ordering::Release);
        for slot in self.slots.lock().iter() {
            slot.enqueue(Delivery::Started(input.clone(), id), self.backlog_warn);
        }
        *session = Some(Session { id, input });
        id
    }

    /// Called from the capture thread. Never blocks on a consumer.
    pub(crate) fn dispatch(&self, frame: AudioFrame) {
        if self.open_session.load(Ordering::Acquire) != frame.session {
            return;
        }
        let snapshot: Vec<Arc<ListenerSlot>> = self.slots.lock().clone();
        for slot in snapshot {
            slot.enqueue(Delivery::Frame(frame.clone()), self.backlog_warn);
        }
    }

    /// Stop delivering frames of the current session without waiting.
    pub(crate) fn abort_session(&self) {
        self.open_session.store(0, Ordering::Release);
    }

    /// Close the gate and wait up to `limit` for callbacks already running.
    ///
    /// Once this returns, no listener is inside a callback for the closed
    /// session and none will enter one, except listeners reported as stuck.
    pub(crate) fn close_gate(&self, limit: Duration) {
        self.abort_session();
        let deadline = Instant::now() + limit;
        let snapshot: Vec<Arc<ListenerSlot>> = self.slots.lock().clone();
        for slot in snapshot {
            if slot.delivering.try_lock_until(deadline).is_none() {
                log::warn!(
                    "Listener '{}' still inside a callback after {:?}",
                    slot.listener.name(),
                    limit
                );
            }
        }
    }

    /// Wait until every queue is empty or `limit` has passed.
    pub(crate) async fn drain(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let backlog: usize = self
                .slots
                .lock()
                .iter()
                .map(|s| s.pending.load(Ordering::Acquire))
                .sum();
            if backlog == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                log::warn!("Dropping {} undelivered frames on close", backlog);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Close the gate, wait for in-flight callbacks, then notify listeners.
    ///
    /// Waits at most `limit` per listener. A listener stuck in a callback
    /// is logged and not notified.
    pub(crate) fn end_session(&self, limit: Duration) {
        let had_session = {
            let mut session = self.session.lock();
            self.open_session.store(0, Ordering::Release);
            session.take().is_some()
        };
        if !had_session {
            return;
        }

        let snapshot: Vec<Arc<ListenerSlot>> = self.slots.lock().clone();
        for slot in snapshot {
            let listener = &slot.listener;
            let Some(_in_flight) = slot.delivering.try_lock_for(limit) else {
                log::warn!(
                    "Listener '{}' stuck in a callback, skipping on_capture_stopped",
                    listener.name()
                );
                continue;
            };
            if panic::catch_unwind(AssertUnwindSafe(|| listener.on_capture_stopped())).is_err() {
                log::error!("Listener '{}' panicked in on_capture_stopped", listener.name());
            }
        }
    }
}

struct DeliveryWorker {
    listener: Arc<dyn AudioListener>,
    rx: mpsc::UnboundedReceiver<Delivery>,
    pending: Arc<AtomicUsize>,
    delivering: Arc<Mutex<()>>,
    open_session: Arc<AtomicU64>,
}

impl DeliveryWorker {
    fn run(mut self) {
        while let Some(item) = self.rx.blocking_recv() {
            {
                let _guard = self.delivering.lock();
                if self.open_session.load(Ordering::Acquire) == item.session() {
                    self.deliver(item);
                }
            }
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        log::debug!("Delivery thread for '{}' finished", self.listener.name());
    }

    fn deliver(&self, item: Delivery) {
        let listener = &self.listener;
        match item {
            Delivery::Started(input, _) => {
                if panic::catch_unwind(AssertUnwindSafe(|| listener.on_capture_started(&input)))
                    .is_err()
                {
                    log::error!("Listener '{}' panicked in on_capture_started", listener.name());
                }
            }
            Delivery::Frame(frame) => {
                match panic::catch_unwind(AssertUnwindSafe(|| listener.on_audio_frame(&frame))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::warn!(
                        "Listener '{}' failed on frame {}: {}",
                        listener.name(),
                        frame.sequence(),
                        e
                    ),
                    Err(_) => log::error!(
                        "Listener '{}' panicked on frame {}",
                        listener.name(),
                        frame.sequence()
                    ),
                }
            }
        }
    }
}
