//! Binary layout of the ring descriptor segment.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ SyncHeader                                                   │
//! │   magic, version, geometry, semaphore keys                   │
//! │   writer cursor / transfer / state / pid                     │
//! │   per-reader cursor / transfer / state / pid / held          │
//! │   TransferRecord[MAX_TRANSFERS]                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │ pending count: AtomicU32[nbufs]                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │ slot keys: i32[nbufs]                                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every field that changes after creation is atomic. The magic is stored
//! last, so a descriptor caught half-built by `connect` is rejected.

use crate::ring::RingConfig;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// ASCII "SLUICERG".
pub const SYNC_MAGIC: u64 = 0x534C_5549_4345_5247;

/// Bump on any incompatible layout change.
pub const SYNC_VERSION: u32 = 1;

/// Maximum number of reader identities per ring.
pub const MAX_READERS: usize = 8;

/// Number of transfer records kept in flight.
pub const MAX_TRANSFERS: usize = 8;

/// End buffer of a transfer whose end is not yet known.
pub const NO_END: u64 = u64::MAX;

// Connection semaphore set.
pub const SEM_WRITE: usize = 0;
pub const SEM_READ: usize = 1;
pub const CONN_NSEMS: usize = 2;

// Per-reader data semaphore set.
pub const SEM_SODACK: usize = 0;
pub const SEM_EODACK: usize = 1;
pub const SEM_FULL: usize = 2;
pub const SEM_CLEAR: usize = 3;
pub const SEM_READER_CONN: usize = 4;
pub const DATA_NSEMS: usize = 5;

/// Shared writer state: no transfer open.
pub const W_IDLE: u32 = 0;
/// Shared writer state: a transfer has started and not yet ended.
pub const W_WRITING: u32 = 1;

/// Shared reader state: waiting for the start of the next transfer.
pub const R_IDLE: u32 = 0;
/// Shared reader state: inside a transfer.
pub const R_READING: u32 = 1;

/// One transfer (epoch): where it starts and, once known, where it ends.
#[repr(C)]
pub struct TransferRecord {
    pub s_buf: AtomicU64,
    pub s_byte: AtomicU64,
    pub e_buf: AtomicU64,
    pub e_byte: AtomicU64,
    /// Non-zero once an end has been recorded.
    pub eod: AtomicU32,
    _pad: u32,
}

impl TransferRecord {
    const fn empty() -> Self {
        Self {
            s_buf: AtomicU64::new(0),
            s_byte: AtomicU64::new(0),
            e_buf: AtomicU64::new(NO_END),
            e_byte: AtomicU64::new(0),
            eod: AtomicU32::new(1),
            _pad: 0,
        }
    }
}

#[repr(C)]
pub struct SyncHeader {
    pub magic: AtomicU64,
    pub version: u32,
    pub n_readers: u32,
    pub nbufs: u64,
    pub bufsz: u64,
    /// Accelerator device holding the slots, -1 for host memory.
    pub device: i32,
    pub semkey_connect: i32,
    pub semkey_data: [i32; MAX_READERS],

    /// Count of buffers written so far.
    pub w_buf: AtomicU64,
    /// Count of transfers ended so far.
    pub w_xfer: AtomicU64,
    pub w_state: AtomicU32,
    pub w_pid: AtomicU32,

    pub r_bufs: [AtomicU64; MAX_READERS],
    pub r_xfers: [AtomicU64; MAX_READERS],
    pub r_states: [AtomicU32; MAX_READERS],
    pub r_pids: [AtomicU32; MAX_READERS],
    /// Non-zero while the identity holds a slot it has not cleared.
    pub r_held: [AtomicU32; MAX_READERS],

    pub xfers: [TransferRecord; MAX_TRANSFERS],
}

impl SyncHeader {
    /// A header for `cfg`, with the magic still unset.
    pub fn new(cfg: &RingConfig, semkey_connect: i32, semkey_data: [i32; MAX_READERS]) -> Self {
        Self {
            magic: AtomicU64::new(0),
            version: SYNC_VERSION,
            n_readers: cfg.readers as u32,
            nbufs: cfg.nbufs,
            bufsz: cfg.bufsz,
            device: cfg.device.unwrap_or(-1),
            semkey_connect,
            semkey_data,
            w_buf: AtomicU64::new(0),
            w_xfer: AtomicU64::new(0),
            w_state: AtomicU32::new(W_IDLE),
            w_pid: AtomicU32::new(0),
            r_bufs: [const { AtomicU64::new(0) }; MAX_READERS],
            r_xfers: [const { AtomicU64::new(0) }; MAX_READERS],
            r_states: [const { AtomicU32::new(R_IDLE) }; MAX_READERS],
            r_pids: [const { AtomicU32::new(0) }; MAX_READERS],
            r_held: [const { AtomicU32::new(0) }; MAX_READERS],
            xfers: [const { TransferRecord::empty() }; MAX_TRANSFERS],
        }
    }

    /// Checks that a mapped descriptor of `len` bytes is one of ours.
    pub fn validate(&self, len: usize) -> Result<(), &'static str> {
        use std::sync::atomic::Ordering;

        if self.magic.load(Ordering::Acquire) != SYNC_MAGIC {
            return Err("bad magic");
        }
        if self.version != SYNC_VERSION {
            return Err("wrong version");
        }
        if self.nbufs == 0 || self.bufsz == 0 {
            return Err("empty geometry");
        }
        if self.n_readers as usize > MAX_READERS {
            return Err("too many readers");
        }
        if len < bytes_for_sync(self.nbufs as usize) {
            return Err("descriptor truncated");
        }
        Ok(())
    }
}

/// Offset of the pending-count table.
#[inline]
pub fn counts_offset() -> usize {
    size_of::<SyncHeader>()
}

/// Offset of the slot key table.
#[inline]
pub fn slot_keys_offset(nbufs: usize) -> usize {
    counts_offset() + nbufs * size_of::<AtomicU32>()
}

/// Bytes needed for a descriptor covering `nbufs` slots.
pub fn bytes_for_sync(nbufs: usize) -> usize {
    slot_keys_offset(nbufs) + nbufs * size_of::<i32>()
}
