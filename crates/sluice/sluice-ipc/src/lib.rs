//! Shared-memory ring buffer with per-reader backpressure.
//!
//! One writer fills fixed-size slots; each of a fixed number of reader
//! identities consumes every published slot at its own pace, and the writer
//! never reuses a slot until all of them have cleared it. Data is grouped
//! into transfers with an explicit start and end byte. Passive viewers may
//! follow along without holding anything up.
//!
//! [`Ring`] exposes the slot protocol, [`Stream`] layers byte-oriented I/O
//! on top of it.

mod copy;
mod error;
mod ring;
mod ringbuf;
mod role;
mod shm_layout;
mod stats;
mod stream;

pub use copy::{HostCopy, SlotCopy};
pub use error::{RingError, SeekProblem};
pub use ring::{RingConfig, claim_order, slot_index, sod_minbuf, tell_offset, viewer_catch_up, xfer_index};
pub use ringbuf::{DEFAULT_VIEW_POLL, DEFAULT_ZERO_POLL, ReadSlot, Ring};
pub use role::{ReaderState, Role, ViewerState, WriterState};
pub use shm_layout::{MAX_READERS, MAX_TRANSFERS};
pub use stats::{ReaderStats, Recovery, RingStats};
pub use stream::{OpenMode, Stream};

pub use sluice_shm::{Key, ParseKeyError, ShmError, ShmNamespace};
