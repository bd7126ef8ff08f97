//! Raw sample types pushed through the per-thread capture buffers.

/// Index into the process-wide category table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CategoryId(pub u16);

impl CategoryId {
    /// The default, uncategorized category. Its name segment is omitted from
    /// output series names.
    pub const DEFAULT: CategoryId = CategoryId(0);
}

/// One independently-boundaried notion of "frame".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeline {
    Primary,
    Secondary,
    EndOfPipe,
}

impl Timeline {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        match self {
            Timeline::Primary => 0,
            Timeline::Secondary => 1,
            Timeline::EndOfPipe => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerPhase {
    Begin,
    End,
}

/// A scope-enter or scope-exit record. Consumed exactly once by the
/// processing thread.
#[derive(Debug, Clone, Copy)]
pub struct TimingMarker {
    pub name: &'static str,
    pub category: CategoryId,
    pub phase: MarkerPhase,
    /// Exclusive markers represent mutually-exclusive top-level phases;
    /// overlapping ones are split apart during processing.
    pub exclusive: bool,
    /// Set on markers synthesized during exclusive-region repair. Artificial
    /// markers contribute duration but are excluded from count statistics.
    pub artificial: bool,
    pub timestamp: u64,
}

/// Custom-stat payload, tagged by the producer rather than reinterpreted
/// from raw bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Int(v) => v as f64,
            Value::Float(v) => v,
        }
    }

    pub fn is_int(self) -> bool {
        matches!(self, Value::Int(_))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

/// How a custom-stat sample combines with the frame's accumulated value.
/// The first operation of a new frame is always applied as `Set` so that
/// min/max are well-defined per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatOp {
    Set,
    Min,
    Max,
    Accumulate,
}

#[derive(Debug, Clone, Copy)]
pub struct CustomStatSample {
    pub name: &'static str,
    pub category: CategoryId,
    pub timestamp: u64,
    pub op: StatOp,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct EventSample {
    pub text: String,
    pub category: CategoryId,
    pub timestamp: u64,
}
