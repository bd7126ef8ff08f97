//! Per-thread sample processing: draining capture buffers, reconstructing
//! the scope stack from begin/end markers, splitting exclusive regions, and
//! feeding attributed values into the stream writer.

use std::collections::HashMap;
use std::io::Write;
use tracing::debug;

use crate::boundary::FrameLookup;
use crate::registry::{CategoryRegistry, StatIndex};
use crate::sample::{CategoryId, MarkerPhase, Timeline, TimingMarker};
use crate::series::{SeriesId, SeriesKind};
use crate::thread::ThreadContext;
use crate::writer::StreamWriter;

/// Outcome of one processing pass over one thread's buffers.
#[derive(Debug, Clone, Copy)]
pub struct PassStats {
    /// Samples consumed across all three buffers.
    pub samples: usize,
    /// Last frame known on this thread's timeline; everything this thread
    /// produced before the drain is attributed at or before it. `i64::MAX`
    /// when the timeline has no boundaries yet, so an idle timeline never
    /// gates the cross-thread minimum.
    pub frontier: i64,
}

#[derive(Clone, Copy)]
struct OpenScope {
    name: &'static str,
    category: CategoryId,
    timestamp: u64,
}

#[derive(Clone, Copy)]
struct ExclusiveEntry {
    name: &'static str,
    category: CategoryId,
}

/// Processing-thread state for one captured thread. Owns the reconstructed
/// scope stack, which survives across passes so scopes may span many frames
/// and many drains.
pub struct ThreadProcessor {
    timeline: Timeline,
    thread_name: String,
    is_worker: bool,
    open: Vec<OpenScope>,
    exclusive_stack: Vec<ExclusiveEntry>,
    series: HashMap<StatIndex, SeriesId>,
    marker_scratch: Vec<TimingMarker>,
    stat_scratch: Vec<crate::sample::CustomStatSample>,
    event_scratch: Vec<crate::sample::EventSample>,
}

fn name_matches(a: &'static str, b: &'static str) -> bool {
    std::ptr::eq(a, b) || a == b
}

impl ThreadProcessor {
    pub fn new(ctx: &ThreadContext, render_tid: Option<u64>) -> Self {
        let timeline = ctx.timeline_override().unwrap_or({
            if render_tid == Some(ctx.tid) {
                Timeline::Secondary
            } else {
                Timeline::Primary
            }
        });
        ThreadProcessor {
            timeline,
            thread_name: ctx.name.clone(),
            is_worker: ctx.is_worker(),
            open: Vec::new(),
            exclusive_stack: Vec::new(),
            series: HashMap::new(),
            marker_scratch: Vec::new(),
            stat_scratch: Vec::new(),
            event_scratch: Vec::new(),
        }
    }

    pub fn timeline(&self) -> Timeline {
        self.timeline
    }

    /// Drains and attributes everything the thread committed before this
    /// call. Markers arrive in per-thread commit order, so timestamps are
    /// non-decreasing within one pass.
    pub fn process<W: Write>(
        &mut self,
        ctx: &ThreadContext,
        writer: &mut StreamWriter<W>,
        lookup: &mut FrameLookup,
        categories: &CategoryRegistry,
        drain_slack: i64,
    ) -> PassStats {
        self.is_worker = ctx.is_worker();

        ctx.markers.drain_all(&mut self.marker_scratch, drain_slack);
        ctx.stats.drain_all(&mut self.stat_scratch, drain_slack);
        ctx.events.drain_all(&mut self.event_scratch, drain_slack);
        let samples =
            self.marker_scratch.len() + self.stat_scratch.len() + self.event_scratch.len();

        // Iterate by index so the scratch vectors keep their capacity across
        // passes and drained slack is actually reused.
        let mut index = 0;
        while index < self.marker_scratch.len() {
            let marker = self.marker_scratch[index];
            index += 1;
            if marker.exclusive {
                self.process_exclusive(marker, writer, lookup, categories);
            } else {
                self.apply_marker(marker, writer, lookup, categories);
            }
        }
        self.marker_scratch.clear();

        let mut index = 0;
        while index < self.stat_scratch.len() {
            let sample = self.stat_scratch[index];
            index += 1;
            let frame = lookup.frame_for(self.timeline, sample.timestamp);
            if frame < 0 {
                continue;
            }
            let kind = if sample.value.is_int() {
                SeriesKind::CounterInt
            } else {
                SeriesKind::CounterFloat
            };
            let id = self.ensure_series(writer, categories, sample.name, sample.category, kind, false);
            writer.update_custom(id, frame, sample.op, sample.value.as_f64());
        }
        self.stat_scratch.clear();

        let timeline = self.timeline;
        for event in self.event_scratch.drain(..) {
            let frame = lookup.frame_for(timeline, event.timestamp);
            if frame < 0 {
                continue;
            }
            let text = if event.category == CategoryId::DEFAULT {
                event.text
            } else {
                format!("{}/{}", categories.name_of(event.category), event.text)
            };
            writer.push_event(frame, text);
        }

        let frames = lookup.frame_count(self.timeline) as i64;
        PassStats {
            samples,
            frontier: if frames == 0 { i64::MAX } else { frames - 1 },
        }
    }

    /// Exclusive regions are mutually exclusive by contract; an inner begin
    /// pauses the running region with an artificial end, and the matching
    /// inner end resumes it with an artificial begin. The synthesized markers
    /// flow through the ordinary scope matcher, contributing duration but
    /// never counts.
    fn process_exclusive<W: Write>(
        &mut self,
        marker: TimingMarker,
        writer: &mut StreamWriter<W>,
        lookup: &mut FrameLookup,
        categories: &CategoryRegistry,
    ) {
        match marker.phase {
            MarkerPhase::Begin => {
                if let Some(top) = self.exclusive_stack.last().copied() {
                    self.apply_marker(
                        TimingMarker {
                            name: top.name,
                            category: top.category,
                            phase: MarkerPhase::End,
                            exclusive: true,
                            artificial: true,
                            timestamp: marker.timestamp,
                        },
                        writer,
                        lookup,
                        categories,
                    );
                }
                self.exclusive_stack.push(ExclusiveEntry {
                    name: marker.name,
                    category: marker.category,
                });
                self.apply_marker(marker, writer, lookup, categories);
            }
            MarkerPhase::End => {
                let Some(pos) = self.exclusive_stack.iter().rposition(|e| {
                    name_matches(e.name, marker.name) && e.category == marker.category
                }) else {
                    debug!(name = marker.name, "exclusive end without a matching begin, dropping");
                    return;
                };
                let was_running = pos == self.exclusive_stack.len() - 1;
                self.exclusive_stack.remove(pos);
                self.apply_marker(marker, writer, lookup, categories);
                if was_running {
                    if let Some(top) = self.exclusive_stack.last().copied() {
                        self.apply_marker(
                            TimingMarker {
                                name: top.name,
                                category: top.category,
                                phase: MarkerPhase::Begin,
                                exclusive: true,
                                artificial: true,
                                timestamp: marker.timestamp,
                            },
                            writer,
                            lookup,
                            categories,
                        );
                    }
                }
            }
        }
    }

    fn apply_marker<W: Write>(
        &mut self,
        marker: TimingMarker,
        writer: &mut StreamWriter<W>,
        lookup: &mut FrameLookup,
        categories: &CategoryRegistry,
    ) {
        match marker.phase {
            MarkerPhase::Begin => self.open.push(OpenScope {
                name: marker.name,
                category: marker.category,
                timestamp: marker.timestamp,
            }),
            MarkerPhase::End => {
                let Some(pos) = self.open.iter().rposition(|s| {
                    name_matches(s.name, marker.name) && s.category == marker.category
                }) else {
                    debug!(name = marker.name, "scope end without a matching begin, dropping");
                    return;
                };
                // Only the matched begin leaves the stack; scopes opened
                // after it stay open, tolerating independently-nested
                // overlapping stats.
                let begin = self.open.remove(pos);

                // The whole scope lands in the frame of its end timestamp.
                let frame = lookup.frame_for(self.timeline, marker.timestamp);
                if frame < 0 {
                    return;
                }
                let elapsed = marker.timestamp.saturating_sub(begin.timestamp) as f64;
                let id = self.ensure_series(
                    writer,
                    categories,
                    marker.name,
                    marker.category,
                    SeriesKind::Timer,
                    false,
                );
                writer.update_timer(id, frame, elapsed);

                if !marker.artificial && writer.config().emit_count_stats {
                    let id = self.ensure_series(
                        writer,
                        categories,
                        marker.name,
                        marker.category,
                        SeriesKind::CounterInt,
                        true,
                    );
                    writer.update_custom(id, frame, crate::sample::StatOp::Accumulate, 1.0);
                }
            }
        }
    }

    fn ensure_series<W: Write>(
        &mut self,
        writer: &mut StreamWriter<W>,
        categories: &CategoryRegistry,
        name: &'static str,
        category: CategoryId,
        kind: SeriesKind,
        is_count: bool,
    ) -> SeriesId {
        let stat = writer.intern(name, category, false, is_count);
        if let Some(&id) = self.series.get(&stat) {
            return id;
        }
        let category_name = categories.name_of(category);
        let id = writer.create_series(stat, kind, &self.thread_name, self.is_worker, &category_name);
        self.series.insert(stat, id);
        id
    }
}
