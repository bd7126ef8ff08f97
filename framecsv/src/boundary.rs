//! Frame-boundary tracking: mapping raw timestamps to frame indices per
//! timeline.
//!
//! [`FrameBoundaries`] is the shared producer-facing half; each timeline's
//! boundary timestamps travel through their own SPSC inbox so the only
//! cross-thread synchronization is the buffer commit/drain fence.
//! [`FrameLookup`] is owned by the processing thread: it drains the inboxes
//! into private history vectors and answers frame queries with a cached
//! cursor.

use spscbuf::SpscBuffer;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

use crate::sample::Timeline;

/// Producer-facing boundary sequences, one inbox per timeline.
pub struct FrameBoundaries {
    inboxes: [SpscBuffer<u64>; Timeline::COUNT],
    /// Credits for end-of-pipe boundaries: each secondary boundary grants
    /// one, each end-of-pipe boundary consumes one. An end-of-pipe boundary
    /// with no credit available is skipped, which keeps the two timelines
    /// from drifting apart when end-of-pipe ticks faster than the secondary
    /// timeline (e.g. during loading screens, or before the render loop has
    /// started).
    eop_credit: AtomicI64,
}

impl FrameBoundaries {
    pub fn new() -> Self {
        FrameBoundaries {
            inboxes: [SpscBuffer::new(), SpscBuffer::new(), SpscBuffer::new()],
            eop_credit: AtomicI64::new(0),
        }
    }

    /// Records a frame edge on `timeline` at `timestamp`. Must be called
    /// from the single thread that owns that timeline.
    pub fn add_begin_frame_timestamp(&self, timeline: Timeline, timestamp: u64) {
        match timeline {
            Timeline::Primary => {}
            Timeline::Secondary => {
                self.eop_credit.fetch_add(1, Ordering::Relaxed);
            }
            Timeline::EndOfPipe => {
                let granted = self
                    .eop_credit
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                        if c > 0 {
                            Some(c - 1)
                        } else {
                            None
                        }
                    });
                if granted.is_err() {
                    debug!(timestamp, "skipping end-of-pipe boundary, no secondary boundary since last");
                    return;
                }
            }
        }
        self.inboxes[timeline.index()].push(timestamp);
    }
}

impl Default for FrameBoundaries {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer-side boundary histories and cursors.
///
/// Queries are expected to arrive in roughly increasing timestamp order per
/// timeline; the cursor advances with a short forward scan and rewinds via
/// binary search when a query arrives out of order.
pub struct FrameLookup {
    histories: [Vec<u64>; Timeline::COUNT],
    cursors: [usize; Timeline::COUNT],
}

impl FrameLookup {
    pub fn new() -> Self {
        FrameLookup {
            histories: [Vec::new(), Vec::new(), Vec::new()],
            cursors: [0; Timeline::COUNT],
        }
    }

    /// Drains every timeline's inbox into the private histories. Called once
    /// at the start of each processing pass.
    pub fn sync(&mut self, boundaries: &FrameBoundaries) {
        for timeline in 0..Timeline::COUNT {
            boundaries.inboxes[timeline].drain_all(&mut self.histories[timeline], -1);
        }
    }

    /// 0-based index of the last boundary at or before `timestamp`, or -1
    /// if `timestamp` precedes the first boundary (or none exist yet).
    pub fn frame_for(&mut self, timeline: Timeline, timestamp: u64) -> i64 {
        let i = timeline.index();
        let history = &self.histories[i];
        if history.is_empty() || timestamp < history[0] {
            self.cursors[i] = 0;
            return -1;
        }

        let mut cursor = self.cursors[i].min(history.len() - 1);
        if history[cursor] > timestamp {
            // Out-of-order catch-up: rewind over the already-passed prefix.
            cursor = history[..=cursor].partition_point(|&b| b <= timestamp) - 1;
        } else {
            while cursor + 1 < history.len() && history[cursor + 1] <= timestamp {
                cursor += 1;
            }
        }
        self.cursors[i] = cursor;
        cursor as i64
    }

    /// Number of boundaries recorded so far on `timeline`.
    pub fn frame_count(&self, timeline: Timeline) -> usize {
        self.histories[timeline.index()].len()
    }

    /// Empties all histories and resets cursors. Called once a capture is
    /// fully finalized.
    pub fn clear(&mut self) {
        for history in &mut self.histories {
            history.clear();
        }
        self.cursors = [0; Timeline::COUNT];
    }
}

impl Default for FrameLookup {
    fn default() -> Self {
        Self::new()
    }
}
