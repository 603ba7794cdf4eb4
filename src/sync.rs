//! Frame Synchronizer: assembles the most recent coherent tuple of sensor
//! frames at a configured cadence, tolerating missing sensors (spec.md §4.3).

use std::sync::Arc;
use std::time::Duration;

use crate::device::Mailbox;
use crate::frame::{ColorFrame, DepthFrame, SyncedTuple};

pub struct SyncConfig {
    pub sync_window_ns: u64,
    pub staleness_ns: u64,
}

impl SyncConfig {
    pub fn from_millis(sync_window_ms: u64, staleness_ms: u64) -> Self {
        Self {
            sync_window_ns: sync_window_ms * 1_000_000,
            staleness_ns: staleness_ms * 1_000_000,
        }
    }
}

/// Assembles `SyncedTuple`s from three newest-wins device mailboxes. Held
/// by the pipeline thread; never blocks.
pub struct FrameSynchronizer {
    config: SyncConfig,
    depth: Option<Arc<Mailbox<DepthFrame>>>,
    primary_color: Option<Arc<Mailbox<ColorFrame>>>,
    aux_color: Option<Arc<Mailbox<ColorFrame>>>,
}

impl FrameSynchronizer {
    pub fn new(
        config: SyncConfig,
        depth: Option<Arc<Mailbox<DepthFrame>>>,
        primary_color: Option<Arc<Mailbox<ColorFrame>>>,
        aux_color: Option<Arc<Mailbox<ColorFrame>>>,
    ) -> Self {
        Self {
            config,
            depth,
            primary_color,
            aux_color,
        }
    }

    /// Assembles one `SyncedTuple` for the current tick, given the wall
    /// clock time in nanoseconds. Returns `None` only if every device
    /// mailbox has never produced a frame (an empty tuple is still
    /// returned once any frame has ever arrived, so staleness can be
    /// reported).
    pub fn tick(&mut self, now_ns: u64) -> SyncedTuple {
        let depth = self.depth.as_ref().and_then(|mb| mb.peek());
        let primary = self.primary_color.as_ref().and_then(|mb| mb.peek());
        let aux = self.aux_color.as_ref().and_then(|mb| mb.peek());

        let reference_ts = depth
            .as_ref()
            .map(|f| f.capture_ts_ns)
            .or_else(|| primary.as_ref().map(|f| f.capture_ts_ns))
            .unwrap_or(now_ns);

        let reference_age = now_ns.saturating_sub(reference_ts);
        let reference_stale = reference_age > self.config.staleness_ns;

        let depth_in_window = depth.as_ref().is_some_and(|f| {
            !reference_stale
                && diff(f.capture_ts_ns, reference_ts) <= self.config.sync_window_ns
        });
        let primary_in_window = primary.as_ref().is_some_and(|f| {
            !reference_stale
                && diff(f.capture_ts_ns, reference_ts) <= self.config.sync_window_ns
        });
        let aux_in_window = aux.as_ref().is_some_and(|f| {
            !reference_stale
                && diff(f.capture_ts_ns, reference_ts) <= self.config.sync_window_ns
        });

        SyncedTuple {
            depth: if depth_in_window {
                depth.map(|f| (*f).clone())
            } else {
                None
            },
            primary_color: if primary_in_window {
                primary.map(|f| (*f).clone())
            } else {
                None
            },
            aux_color: if aux_in_window {
                aux.map(|f| (*f).clone())
            } else {
                None
            },
            reference_ts_ns: reference_ts,
        }
    }

    pub fn sleep_until_next_tick(tick_period: Duration, tick_started: std::time::Instant) {
        let elapsed = tick_started.elapsed();
        if elapsed < tick_period {
            std::thread::sleep(tick_period - elapsed);
        }
    }
}

fn diff(a: u64, b: u64) -> u64 {
    a.abs_diff(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Mailbox;

    fn depth_frame(ts: u64, seq: u64) -> DepthFrame {
        DepthFrame::new(2, 2, vec![100, 100, 100, 100], ts, "d0", seq)
    }

    #[test]
    fn tuple_includes_frames_within_window() {
        let depth_mb = Arc::new(Mailbox::new());
        depth_mb.publish(depth_frame(1_000_000_000, 1));
        let mut sync = FrameSynchronizer::new(
            SyncConfig::from_millis(50, 500),
            Some(depth_mb),
            None,
            None,
        );
        let tuple = sync.tick(1_000_000_000);
        assert!(tuple.depth.is_some());
    }

    #[test]
    fn stale_reference_excludes_all_devices() {
        let depth_mb = Arc::new(Mailbox::new());
        depth_mb.publish(depth_frame(0, 1));
        let mut sync = FrameSynchronizer::new(
            SyncConfig::from_millis(50, 500),
            Some(depth_mb),
            None,
            None,
        );
        // 600ms later, past the 500ms staleness threshold.
        let tuple = sync.tick(600_000_000);
        assert!(tuple.depth.is_none());
    }

    #[test]
    fn empty_tuple_when_no_devices_present() {
        let mut sync = FrameSynchronizer::new(SyncConfig::from_millis(50, 500), None, None, None);
        let tuple = sync.tick(0);
        assert!(tuple.is_empty());
    }
}
