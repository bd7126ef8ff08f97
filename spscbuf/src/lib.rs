//! # spscbuf - Single-Producer Single-Consumer Append Buffer
//!
//! A typed, unbounded-length append buffer for handing high-frequency samples
//! from exactly one producer thread to exactly one consumer thread without
//! locks. Storage grows in fixed-size heap blocks linked into a list; the
//! producer never invalidates memory the consumer may still be reading, and
//! the consumer frees a block only once its read position has moved strictly
//! past it.
//!
//! ## Writing
//!
//! ```rust
//! use spscbuf::SpscBuffer;
//!
//! let buf: SpscBuffer<u64> = SpscBuffer::new();
//! buf.push(42);
//!
//! // or, split into the primitive pair:
//! buf.reserve_slot().write(43);
//! buf.commit_slot();
//! ```
//!
//! ## Draining
//!
//! ```rust
//! # use spscbuf::SpscBuffer;
//! # let buf: SpscBuffer<u64> = SpscBuffer::new();
//! # buf.push(1);
//! let mut out = Vec::new();
//! if buf.has_pending() {
//!     buf.drain_all(&mut out, 64 * 1024);
//! }
//! ```
//!
//! ## Contract
//!
//! At most one thread appends and at most one thread drains at any time.
//! The type is `Send + Sync` so both halves can reach it through a shared
//! `Arc`, but the single-writer/single-reader discipline is the caller's
//! responsibility; the only synchronization point is the release store on
//! commit paired with the acquire load on drain. Appends never block and
//! never fail, they only grow memory.

pub use buffer::SpscBuffer;

pub(crate) mod buffer;
