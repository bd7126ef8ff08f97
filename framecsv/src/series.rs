//! Per-stat frame accumulators.
//!
//! A [`StatSeries`] holds exactly one frame's worth of in-progress value.
//! The first update for a new frame number implicitly flushes the previous
//! frame's value; [`StatSeries::finalize_frame`] forces the flush for the
//! last frame a stat appears in. An [`AggregateSeries`] folds contributions
//! from several per-thread series into one output column, keyed by frame
//! and removed once emitted.

use std::collections::HashMap;

use crate::registry::StatIndex;
use crate::sample::StatOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesKind {
    Timer,
    CounterInt,
    CounterFloat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeriesId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AggregateId(pub u32);

pub struct StatSeries {
    pub stat: StatIndex,
    pub name: String,
    pub kind: SeriesKind,
    /// Invisible series are not written to the output but may still feed an
    /// aggregate.
    pub visible: bool,
    pub column: Option<u32>,
    pub aggregate: Option<AggregateId>,
    open_frame: i64,
    value: f64,
    dirty: bool,
}

impl StatSeries {
    pub fn new(
        stat: StatIndex,
        name: String,
        kind: SeriesKind,
        visible: bool,
        column: Option<u32>,
        aggregate: Option<AggregateId>,
    ) -> Self {
        StatSeries {
            stat,
            name,
            kind,
            visible,
            column,
            aggregate,
            open_frame: -1,
            value: 0.0,
            dirty: false,
        }
    }

    /// Adds elapsed time for `frame`; timer updates within one frame sum.
    /// Returns the previous frame's flushed value, if any.
    pub fn add_timer_value(&mut self, frame: i64, elapsed: f64) -> Option<(i64, f64)> {
        let flushed = self.advance(frame);
        self.value += elapsed;
        self.dirty = true;
        flushed
    }

    /// Applies a custom-stat operation for `frame`. The first operation of a
    /// new frame is always applied as `Set`, regardless of what was
    /// requested. Returns the previous frame's flushed value, if any.
    pub fn apply_custom_value(&mut self, frame: i64, op: StatOp, value: f64) -> Option<(i64, f64)> {
        let flushed = self.advance(frame);
        if !self.dirty {
            self.value = value;
            self.dirty = true;
        } else {
            match op {
                StatOp::Set => self.value = value,
                StatOp::Min => self.value = self.value.min(value),
                StatOp::Max => self.value = self.value.max(value),
                StatOp::Accumulate => self.value += value,
            }
        }
        flushed
    }

    /// Forces a flush if the currently-open frame equals `frame`. A second
    /// call for the same frame is a no-op.
    pub fn finalize_frame(&mut self, frame: i64) -> Option<(i64, f64)> {
        if self.open_frame == frame && self.dirty {
            let out = (frame, self.value);
            self.open_frame = -1;
            self.value = 0.0;
            self.dirty = false;
            Some(out)
        } else {
            None
        }
    }

    pub fn open_frame(&self) -> i64 {
        if self.dirty {
            self.open_frame
        } else {
            -1
        }
    }

    fn advance(&mut self, frame: i64) -> Option<(i64, f64)> {
        if self.open_frame == frame {
            return None;
        }
        let flushed = if self.dirty {
            Some((self.open_frame, self.value))
        } else {
            None
        };
        self.open_frame = frame;
        self.value = 0.0;
        self.dirty = false;
        flushed
    }
}

/// One named output column fed by per-frame partial sums from several
/// per-thread series.
pub struct AggregateSeries {
    pub name: String,
    pub column: u32,
    partial: HashMap<i64, f64>,
}

impl AggregateSeries {
    pub fn new(name: String, column: u32) -> Self {
        AggregateSeries {
            name,
            column,
            partial: HashMap::new(),
        }
    }

    pub fn accumulate(&mut self, frame: i64, value: f64) {
        *self.partial.entry(frame).or_insert(0.0) += value;
    }

    /// Removes and returns the partial sum for `frame`, if any
    /// contribution arrived.
    pub fn take(&mut self, frame: i64) -> Option<f64> {
        self.partial.remove(&frame)
    }

    pub fn max_frame(&self) -> i64 {
        self.partial.keys().copied().max().unwrap_or(-1)
    }
}
