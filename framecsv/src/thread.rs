//! Per-thread capture state.

use spscbuf::SpscBuffer;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::sample::{CustomStatSample, EventSample, Timeline, TimingMarker};

/// One participating thread's identity and capture buffers.
///
/// Created lazily on the first instrumentation call from a thread; the
/// global registry holds only weak references, so a context dies with its
/// thread and the registry prunes the expired entry opportunistically. The
/// end-of-pipe pseudo-thread gets a context of its own that is not tied to
/// an OS thread.
pub struct ThreadContext {
    pub tid: u64,
    pub name: String,
    is_worker: AtomicBool,
    /// 0 = unset, otherwise `Timeline::index() + 1`.
    timeline_override: AtomicU8,
    pub markers: SpscBuffer<TimingMarker>,
    pub stats: SpscBuffer<CustomStatSample>,
    pub events: SpscBuffer<EventSample>,
}

impl ThreadContext {
    pub fn new(tid: u64, name: String) -> Self {
        ThreadContext {
            tid,
            name,
            is_worker: AtomicBool::new(false),
            timeline_override: AtomicU8::new(0),
            markers: SpscBuffer::new(),
            stats: SpscBuffer::new(),
            events: SpscBuffer::new(),
        }
    }

    pub fn is_worker(&self) -> bool {
        self.is_worker.load(Ordering::Relaxed)
    }

    pub fn set_is_worker(&self, worker: bool) {
        self.is_worker.store(worker, Ordering::Relaxed);
    }

    pub fn timeline_override(&self) -> Option<Timeline> {
        match self.timeline_override.load(Ordering::Relaxed) {
            1 => Some(Timeline::Primary),
            2 => Some(Timeline::Secondary),
            3 => Some(Timeline::EndOfPipe),
            _ => None,
        }
    }

    pub fn set_timeline(&self, timeline: Timeline) {
        self.timeline_override
            .store(timeline.index() as u8 + 1, Ordering::Relaxed);
    }
}
