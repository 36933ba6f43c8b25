//! Latest-wins frame hand-off between the capture thread and the render tick

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::Frame;

/// Single-slot frame buffer with drop-oldest semantics.
///
/// One writer (the capture loop) replaces the slot; any number of readers take
/// the newest frame without removing it. Frames are immutable and swapped in
/// whole, so a reader never sees a partially written frame.
///
/// Only one publisher may be active at a time. The sequence check in
/// [`publish`](Self::publish) and the store that follows are two separate steps,
/// so two concurrent writers could let an older frame replace a newer one.
/// Hand the buffer to a new writer only after the previous one has stopped.
pub struct FrameBuffer {
    slot: ArcSwapOption<Frame>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
    frames_rejected: AtomicUsize,
    unread: AtomicBool,
}

/// Snapshot of buffer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub written: usize,
    pub read: usize,
    /// Replaced before any reader saw them
    pub dropped: usize,
    /// Refused because their sequence did not advance
    pub rejected: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: replace the slot. Never blocks.
    ///
    /// Returns false, leaving the slot untouched, when `frame` is not newer
    /// than the frame already held.
    pub fn publish(&self, frame: Frame) -> bool {
        if let Some(current) = &*self.slot.load() {
            if frame.sequence() <= current.sequence() {
                self.stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        self.slot.store(Some(Arc::new(frame)));
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        if self.stats.unread.swap(true, Ordering::AcqRel) {
            // Drop oldest frame
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("frames_dropped_total").increment(1);
        }
        true
    }

    /// Consumer: newest frame, if any. Never blocks and never empties the slot.
    pub fn try_latest(&self) -> Option<Arc<Frame>> {
        let frame = self.slot.load_full()?;
        self.stats.unread.store(false, Ordering::Release);
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    pub fn latest_sequence(&self) -> Option<u64> {
        (*self.slot.load()).as_ref().map(|frame| frame.sequence())
    }

    /// Empty the slot, e.g. before showing a different source
    pub fn clear(&self) {
        self.slot.store(None);
        self.stats.unread.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            rejected: self.stats.frames_rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
