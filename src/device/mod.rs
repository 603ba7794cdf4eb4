//! Device Adapter: uniform frame-producer capability over a single physical
//! sensor. Each adapter runs its own producer thread and publishes into a
//! newest-wins single-slot mailbox; the pipeline thread pulls non-blockingly.

pub mod mock;
#[cfg(feature = "realsense")]
pub mod depth_realsense;
#[cfg(feature = "v4l")]
pub mod color_v4l;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;

use crate::error::{Error, Result};
use crate::frame::{ColorFrame, DepthFrame, Timestamped};

const MAX_BACKOFF: Duration = Duration::from_secs(5);
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Point-in-time adapter health, mirrored from the producer thread.
#[derive(Debug, Clone, Default)]
pub struct AdapterStatus {
    pub connected: bool,
    pub last_frame_at: Option<Instant>,
    pub dropped_count: u64,
    pub last_error: Option<String>,
}

/// Shared handle a producer thread uses to publish its own connectivity
/// into `status()` (spec.md §4.1) without the reader ever blocking on the
/// producer. Cheap to read from the pipeline thread or an async
/// diagnostics handler.
#[derive(Default)]
pub struct AdapterStatusHandle {
    connected: AtomicBool,
    last_error: std::sync::Mutex<Option<String>>,
}

impl AdapterStatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn set_error(&self, message: impl Into<String>) {
        *self.last_error.lock().unwrap() = Some(message.into());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }
}

/// A single-writer/single-reader newest-wins mailbox, backed by an atomic
/// swap so the pipeline thread never blocks on a producer (spec.md §5).
pub struct Mailbox<T> {
    slot: ArcSwapOption<T>,
    dropped: AtomicU64,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self {
            slot: ArcSwapOption::from(None),
            dropped: AtomicU64::new(0),
        }
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a new value, dropping whatever was unread before it.
    pub fn publish(&self, value: T) {
        let previous = self.slot.swap(Some(Arc::new(value)));
        if previous.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the latest published value without removing it, so that
    /// repeated reads within the same tick observe the same frame.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.slot.load_full()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T: Timestamped> Mailbox<T> {
    /// Publishes `value` only if it is newer than whatever currently
    /// occupies the slot: a strictly later timestamp wins outright; an
    /// equal timestamp is broken by the larger sequence number, so a
    /// device replaying a duplicate timestamp with a lower sequence
    /// number is dropped rather than displacing a genuinely newer frame.
    ///
    /// Single-writer only (one producer thread per device): no
    /// compare-and-swap race is possible between the read and the write.
    pub fn publish_ordered(&self, value: T) {
        let candidate_key = value.ts_seq();
        let current = self.slot.load_full();
        let is_newer = match current.as_deref() {
            Some(existing) => candidate_key > existing.ts_seq(),
            None => true,
        };
        if is_newer {
            let previous = self.slot.swap(Some(Arc::new(value)));
            if previous.is_some() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Capability implemented by every depth-producing backend.
pub trait DepthSource: Send {
    /// Blocks until a frame is captured or the deadline elapses.
    fn next_frame(&mut self, deadline: Duration) -> Result<DepthFrame>;
}

/// Capability implemented by every color-producing backend.
pub trait ColorSource: Send {
    fn next_frame(&mut self, deadline: Duration) -> Result<ColorFrame>;
}

/// Opens a depth source, e.g. by enumerating hardware. Returns
/// `DeviceUnavailable` when no matching physical device is found.
pub trait OpenDepthSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn DepthSource>>;
    fn name(&self) -> &str;
}

pub trait OpenColorSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn ColorSource>>;
    fn name(&self) -> &str;
}

/// Runs a depth adapter's producer thread: open, read in a loop with a
/// deadline, publish into the mailbox, and on any non-timeout error enter
/// an exponential backoff capped at 5s before reopening.
pub fn spawn_depth_adapter(
    opener: Arc<dyn OpenDepthSource>,
    device_timeout_ms: u64,
    shutdown: Arc<AtomicBool>,
) -> (Arc<Mailbox<DepthFrame>>, Arc<AdapterStatusHandle>, std::thread::JoinHandle<()>) {
    let mailbox = Arc::new(Mailbox::new());
    let status = Arc::new(AdapterStatusHandle::new());
    let mb = mailbox.clone();
    let st = status.clone();
    let deadline = Duration::from_millis(device_timeout_ms);
    let handle = std::thread::Builder::new()
        .name(format!("depth-adapter-{}", opener.name()))
        .spawn(move || {
            let mut backoff = INITIAL_BACKOFF;
            while !shutdown.load(Ordering::Relaxed) {
                let mut source = match opener.open() {
                    Ok(s) => {
                        backoff = INITIAL_BACKOFF;
                        st.set_connected(true);
                        s
                    }
                    Err(e) => {
                        st.set_connected(false);
                        st.set_error(e.to_string());
                        tracing::warn!("depth device open failed: {e}, retrying in {:?}", backoff);
                        sleep_with_shutdown(backoff, &shutdown);
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        continue;
                    }
                };

                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        st.set_connected(false);
                        return;
                    }
                    match source.next_frame(deadline) {
                        Ok(frame) => mb.publish_ordered(frame),
                        Err(Error::DeviceTimeout(_)) => continue,
                        Err(e) => {
                            st.set_connected(false);
                            st.set_error(e.to_string());
                            tracing::warn!("depth device error: {e}, reconnecting");
                            break;
                        }
                    }
                }

                sleep_with_shutdown(backoff, &shutdown);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        })
        .expect("failed to spawn depth adapter thread");
    (mailbox, status, handle)
}

pub fn spawn_color_adapter(
    opener: Arc<dyn OpenColorSource>,
    device_timeout_ms: u64,
    shutdown: Arc<AtomicBool>,
) -> (Arc<Mailbox<ColorFrame>>, Arc<AdapterStatusHandle>, std::thread::JoinHandle<()>) {
    let mailbox = Arc::new(Mailbox::new());
    let status = Arc::new(AdapterStatusHandle::new());
    let mb = mailbox.clone();
    let st = status.clone();
    let deadline = Duration::from_millis(device_timeout_ms);
    let handle = std::thread::Builder::new()
        .name(format!("color-adapter-{}", opener.name()))
        .spawn(move || {
            let mut backoff = INITIAL_BACKOFF;
            while !shutdown.load(Ordering::Relaxed) {
                let mut source = match opener.open() {
                    Ok(s) => {
                        backoff = INITIAL_BACKOFF;
                        st.set_connected(true);
                        s
                    }
                    Err(e) => {
                        st.set_connected(false);
                        st.set_error(e.to_string());
                        tracing::warn!("color device open failed: {e}, retrying in {:?}", backoff);
                        sleep_with_shutdown(backoff, &shutdown);
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        continue;
                    }
                };

                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        st.set_connected(false);
                        return;
                    }
                    match source.next_frame(deadline) {
                        Ok(frame) => mb.publish_ordered(frame),
                        Err(Error::DeviceTimeout(_)) => continue,
                        Err(e) => {
                            st.set_connected(false);
                            st.set_error(e.to_string());
                            tracing::warn!("color device error: {e}, reconnecting");
                            break;
                        }
                    }
                }

                sleep_with_shutdown(backoff, &shutdown);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        })
        .expect("failed to spawn color adapter thread");
    (mailbox, status, handle)
}

fn sleep_with_shutdown(dur: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < dur {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let remaining = dur - waited;
        std::thread::sleep(step.min(remaining));
        waited += step;
    }
}
