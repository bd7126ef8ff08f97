//! The stream writer: owns every stat series (visible and hidden), buffers
//! pending rows keyed by frame number, decides when a row is safe to
//! serialize, and performs the buffered (optionally compressed) output.

use framecsv_format::CsvStream;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use tracing::{debug, warn};

use crate::registry::{StatIndex, StatRegistry};
use crate::sample::{CategoryId, StatOp};
use crate::series::{AggregateId, AggregateSeries, SeriesId, SeriesKind, StatSeries};

/// Metadata key whose entry is forced to be the very last line of the file;
/// parsers depend on this.
pub const COMMANDLINE_KEY: &str = "Commandline";

/// Thread-group name used for series folded across task-worker threads.
pub const WORKER_GROUP_NAME: &str = "Workers";

#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    /// Frames withheld from finalization to tolerate cross-thread
    /// attribution skew.
    pub lookahead_frames: u32,
    /// Stream rows as soon as they fall out of the lookahead window; when
    /// false, everything buffers until `finalize`.
    pub continuous: bool,
    /// Multiplier applied to raw timestamp deltas before they enter a timer
    /// series (nanoseconds to milliseconds by default).
    pub timer_scale: f64,
    pub emit_count_stats: bool,
    pub fold_worker_stats: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            lookahead_frames: 3,
            continuous: true,
            timer_scale: 1.0e-6,
            emit_count_stats: true,
            fold_worker_stats: true,
        }
    }
}

#[derive(Default)]
struct PendingRow {
    events: Vec<String>,
    values: Vec<f64>,
}

pub struct StreamWriter<W: Write> {
    registry: StatRegistry,
    series: Vec<StatSeries>,
    aggregates: Vec<AggregateSeries>,
    aggregate_by_name: HashMap<String, AggregateId>,
    kinds: HashMap<StatIndex, SeriesKind>,
    rows: VecDeque<PendingRow>,
    read_frame: i64,
    next_column: u32,
    stream: CsvStream<W>,
    wrote_header: bool,
    config: WriterConfig,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(
        out: W,
        write_buffer_size: usize,
        compression: framecsv_format::Compression,
        config: WriterConfig,
    ) -> Self {
        StreamWriter {
            registry: StatRegistry::new(),
            series: Vec::new(),
            aggregates: Vec::new(),
            aggregate_by_name: HashMap::new(),
            kinds: HashMap::new(),
            rows: VecDeque::new(),
            read_frame: 0,
            next_column: 0,
            stream: CsvStream::new(out, write_buffer_size, compression),
            wrote_header: false,
            config,
        }
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn read_frame(&self) -> i64 {
        self.read_frame
    }

    pub fn intern(
        &mut self,
        name: &'static str,
        category: CategoryId,
        stable_name: bool,
        is_count: bool,
    ) -> StatIndex {
        self.registry.intern(name, category, stable_name, is_count)
    }

    /// Creates the per-thread series for `stat`. Series owned by task-worker
    /// threads are made invisible and linked to a shared aggregate named
    /// with the worker group, so output columns do not scale with worker
    /// count.
    pub fn create_series(
        &mut self,
        stat: StatIndex,
        kind: SeriesKind,
        thread_name: &str,
        is_worker: bool,
        category_name: &str,
    ) -> SeriesId {
        match self.kinds.get(&stat) {
            Some(&known) if known != kind => {
                // A stat changing kind mid-session is a programming error in
                // the instrumentation, not a runtime condition.
                debug_assert!(false, "stat kind mismatch for {}", self.registry.name_of(stat));
                warn!(
                    stat = self.registry.name_of(stat),
                    "stat re-registered with a different kind, keeping first"
                );
            }
            Some(_) => {}
            None => {
                self.kinds.insert(stat, kind);
            }
        }

        let fold = is_worker && self.config.fold_worker_stats;
        let name = self.series_name(stat, thread_name, category_name);
        let (visible, column, aggregate) = if fold {
            let aggregate_name = self.series_name(stat, WORKER_GROUP_NAME, category_name);
            let aggregate = self.ensure_aggregate(aggregate_name);
            (false, None, Some(aggregate))
        } else {
            let column = self.next_column;
            self.next_column += 1;
            (true, Some(column), None)
        };

        let id = SeriesId(self.series.len() as u32);
        self.series
            .push(StatSeries::new(stat, name, kind, visible, column, aggregate));
        id
    }

    fn ensure_aggregate(&mut self, name: String) -> AggregateId {
        if let Some(&id) = self.aggregate_by_name.get(&name) {
            return id;
        }
        let id = AggregateId(self.aggregates.len() as u32);
        let column = self.next_column;
        self.next_column += 1;
        self.aggregates.push(AggregateSeries::new(name.clone(), column));
        self.aggregate_by_name.insert(name, id);
        id
    }

    /// `[COUNTS/]<Category>/<Thread>/<Stat>`, with the category segment
    /// omitted for the default category.
    fn series_name(&self, stat: StatIndex, thread_name: &str, category_name: &str) -> String {
        let mut name = String::new();
        if self.registry.is_count_stat(stat) {
            name.push_str("COUNTS/");
        }
        if !category_name.is_empty() {
            name.push_str(category_name);
            name.push('/');
        }
        name.push_str(thread_name);
        name.push('/');
        name.push_str(self.registry.name_of(stat));
        name
    }

    pub fn update_timer(&mut self, id: SeriesId, frame: i64, elapsed_ticks: f64) {
        let scaled = elapsed_ticks * self.config.timer_scale;
        let flushed = self.series[id.0 as usize].add_timer_value(frame, scaled);
        if let Some((f, v)) = flushed {
            self.route_value(id, f, v);
        }
    }

    pub fn update_custom(&mut self, id: SeriesId, frame: i64, op: StatOp, value: f64) {
        let flushed = self.series[id.0 as usize].apply_custom_value(frame, op, value);
        if let Some((f, v)) = flushed {
            self.route_value(id, f, v);
        }
    }

    pub fn push_event(&mut self, frame: i64, text: String) {
        if let Some(row) = self.row_mut(frame) {
            row.events.push(text);
        }
    }

    fn route_value(&mut self, id: SeriesId, frame: i64, value: f64) {
        let (visible, column, aggregate) = {
            let series = &self.series[id.0 as usize];
            (series.visible, series.column, series.aggregate)
        };
        if let Some(aggregate) = aggregate {
            self.aggregates[aggregate.0 as usize].accumulate(frame, value);
        }
        if visible {
            if let Some(column) = column {
                self.push_value(column, frame, value);
            }
        }
    }

    fn push_value(&mut self, column: u32, frame: i64, value: f64) {
        if let Some(row) = self.row_mut(frame) {
            let index = column as usize;
            if row.values.len() <= index {
                row.values.resize(index + 1, 0.0);
            }
            row.values[index] = value;
        }
    }

    fn row_mut(&mut self, frame: i64) -> Option<&mut PendingRow> {
        if frame < self.read_frame {
            debug!(frame, read_frame = self.read_frame, "row already locked in, dropping late value");
            return None;
        }
        let index = (frame - self.read_frame) as usize;
        while self.rows.len() <= index {
            self.rows.push_back(PendingRow::default());
        }
        Some(&mut self.rows[index])
    }

    /// Serializes the row at the read cursor (even if empty; rows are
    /// emitted in contiguous frame order with zero-filled values) and
    /// advances the cursor. Asks every non-aggregate series, then every
    /// aggregate series, to finalize the frame first, so aggregate values
    /// depending on this frame's contributions are captured before the row
    /// is written.
    pub fn finalize_next_row(&mut self) -> crate::Result<()> {
        let frame = self.read_frame;

        let mut flushes = Vec::new();
        for (index, series) in self.series.iter_mut().enumerate() {
            if let Some((f, v)) = series.finalize_frame(frame) {
                flushes.push((SeriesId(index as u32), f, v));
            }
        }
        for (id, f, v) in flushes {
            self.route_value(id, f, v);
        }

        let mut aggregate_values = Vec::new();
        for aggregate in &mut self.aggregates {
            if let Some(value) = aggregate.take(frame) {
                aggregate_values.push((aggregate.column, value));
            }
        }
        for (column, value) in aggregate_values {
            self.push_value(column, frame, value);
        }

        if !self.wrote_header {
            let names = self.column_names();
            self.stream
                .write_header(names.iter().map(|n| n.as_str()))?;
            self.wrote_header = true;
        }

        let row = self.rows.pop_front().unwrap_or_default();
        let mut values = row.values;
        values.resize(self.next_column as usize, 0.0);
        self.stream.write_row(&row.events, &values)?;
        self.read_frame += 1;
        Ok(())
    }

    /// Advances the read cursor up to `min_frame_processed - lookahead`,
    /// finalizing every row in between. No-op unless continuous mode is
    /// enabled.
    pub fn advance_cursor(&mut self, min_frame_processed: i64) -> crate::Result<()> {
        if !self.config.continuous || min_frame_processed == i64::MAX {
            return Ok(());
        }
        let target = min_frame_processed - self.config.lookahead_frames as i64;
        while self.read_frame < target {
            self.finalize_next_row()?;
        }
        Ok(())
    }

    /// Drains every remaining row regardless of lookahead, writes the
    /// trailing duplicate header, then the metadata rows with the
    /// command-line entry forced last, and flushes the underlying stream.
    pub fn finalize(mut self, metadata: &[(String, String)]) -> crate::Result<W> {
        let mut last = self.read_frame - 1;
        for series in &self.series {
            last = last.max(series.open_frame());
        }
        for aggregate in &self.aggregates {
            last = last.max(aggregate.max_frame());
        }
        last = last.max(self.read_frame + self.rows.len() as i64 - 1);

        while self.read_frame <= last {
            self.finalize_next_row()?;
        }

        // An empty capture still gets its header pair.
        let names = self.column_names();
        if !self.wrote_header {
            self.stream
                .write_header(names.iter().map(|n| n.as_str()))?;
            self.wrote_header = true;
        }
        self.stream
            .write_header(names.iter().map(|n| n.as_str()))?;

        for (key, value) in metadata.iter().filter(|(k, _)| k != COMMANDLINE_KEY) {
            self.stream.write_metadata(key, value)?;
        }
        if let Some((key, value)) = metadata.iter().find(|(k, _)| k == COMMANDLINE_KEY) {
            self.stream.write_metadata(key, value)?;
        }

        Ok(self.stream.finish()?)
    }

    fn column_names(&self) -> Vec<String> {
        let mut names = vec![String::new(); self.next_column as usize];
        for series in self.series.iter().filter(|s| s.visible) {
            if let Some(column) = series.column {
                names[column as usize] = series.name.clone();
            }
        }
        for aggregate in &self.aggregates {
            names[aggregate.column as usize] = aggregate.name.clone();
        }
        names
    }
}
