//! Ring geometry and cursor arithmetic.
//!
//! Cursors are monotonically increasing logical buffer counts; the physical
//! slot for logical buffer `b` is `b % nbufs`. Slot counts need not be powers
//! of two because slots are separate segments, not offsets in one array.

use crate::shm_layout::{MAX_READERS, MAX_TRANSFERS};

/// Geometry of a ring at creation time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// Number of slots.
    pub nbufs: u64,
    /// Size of each slot in bytes.
    pub bufsz: u64,
    /// Number of reader identities.
    pub readers: usize,
    /// Accelerator device the slots belong to; `None` for host memory.
    pub device: Option<i32>,
}

impl RingConfig {
    /// A host-memory ring with one reader identity.
    ///
    /// # Panics
    /// Panics if `nbufs` or `bufsz` is zero.
    ///
    /// # Example
    /// ```
    /// use sluice_ipc::RingConfig;
    /// let cfg = RingConfig::new(4, 1 << 20).readers(2);
    /// assert_eq!(cfg.total_bytes(), 4 << 20);
    /// ```
    pub fn new(nbufs: u64, bufsz: u64) -> Self {
        assert!(nbufs > 0, "ring needs at least one slot");
        assert!(bufsz > 0, "slot size must be non-zero");
        Self {
            nbufs,
            bufsz,
            readers: 1,
            device: None,
        }
    }

    /// # Panics
    /// Panics if `n` exceeds [`MAX_READERS`].
    pub fn readers(mut self, n: usize) -> Self {
        assert!(n <= MAX_READERS, "at most {MAX_READERS} readers");
        self.readers = n;
        self
    }

    pub fn on_device(mut self, device: i32) -> Self {
        self.device = (device >= 0).then_some(device);
        self
    }

    /// Data capacity of the ring.
    pub fn total_bytes(&self) -> u64 {
        self.nbufs * self.bufsz
    }
}

/// Physical slot holding logical buffer `buf`.
#[inline(always)]
pub fn slot_index(buf: u64, nbufs: u64) -> usize {
    (buf % nbufs) as usize
}

/// Transfer record used by transfer number `xfer`.
#[inline(always)]
pub fn xfer_index(xfer: u64) -> usize {
    (xfer % MAX_TRANSFERS as u64) as usize
}

/// Oldest buffer that can still be declared start-of-data.
///
/// Buffers clocked since `soclock_buf` stay valid until the writer laps them,
/// so once more than `nbufs` have been written only the newest `nbufs - 1`
/// (plus the one being written) remain.
///
/// ```text
/// nbufs = 4, soclock_buf = 0
///   w_buf = 2  -> 0   (nothing overwritten yet)
///   w_buf = 9  -> 6
/// ```
#[inline]
pub fn sod_minbuf(w_buf: u64, soclock_buf: u64, nbufs: u64) -> u64 {
    if w_buf.saturating_sub(soclock_buf) < nbufs {
        soclock_buf
    } else {
        w_buf - nbufs + 1
    }
}

/// Byte offset of the start of logical buffer `buf` within a transfer that
/// starts at (`s_buf`, `s_byte`). Buffers at or before the start report 0.
#[inline]
pub fn tell_offset(buf: u64, s_buf: u64, s_byte: u64, bufsz: u64) -> u64 {
    if buf <= s_buf {
        return 0;
    }
    (buf - s_buf) * bufsz - s_byte
}

/// Fast-forwards a passive viewer the writer has lapped.
///
/// A viewer exerts no backpressure, so when it falls `nbufs` or more behind,
/// the slots it has not seen are already overwritten. It jumps to the oldest
/// buffer that is still intact and the lost buffers are counted in `skipped`.
///
/// ```text
/// nbufs = 4, w_buf = 20, view_buf = 5
/// 5 + 4 < 20 -> view_buf = 17, skipped += 12
/// ```
#[inline]
pub fn viewer_catch_up(w_buf: u64, view_buf: &mut u64, nbufs: u64, skipped: &mut u64) {
    if *view_buf + nbufs < w_buf {
        let oldest = w_buf - nbufs + 1;
        *skipped += oldest - *view_buf;
        *view_buf = oldest;
    }
}

/// Reader identities ordered for claiming: furthest-behind transfer first,
/// then furthest-behind buffer, then lowest index.
pub fn claim_order(r_xfers: &[u64], r_bufs: &[u64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..r_xfers.len().min(r_bufs.len())).collect();
    order.sort_by_key(|&i| (r_xfers[i], r_bufs[i], i));
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_index_wraps_without_power_of_two() {
        assert_eq!(slot_index(0, 3), 0);
        assert_eq!(slot_index(5, 3), 2);
        assert_eq!(slot_index(6, 3), 0);
        assert_eq!(xfer_index(9), 1);
    }

    #[test]
    fn sod_minbuf_tracks_overwrites() {
        assert_eq!(sod_minbuf(0, 0, 4), 0);
        assert_eq!(sod_minbuf(3, 0, 4), 0);
        assert_eq!(sod_minbuf(4, 0, 4), 1);
        assert_eq!(sod_minbuf(9, 0, 4), 6);
        assert_eq!(sod_minbuf(9, 7, 4), 7);
    }

    #[test]
    fn tell_offset_accounts_for_start_byte() {
        assert_eq!(tell_offset(2, 2, 100, 1000), 0);
        assert_eq!(tell_offset(1, 2, 100, 1000), 0);
        assert_eq!(tell_offset(3, 2, 100, 1000), 900);
        assert_eq!(tell_offset(5, 2, 0, 1000), 3000);
    }

    #[test]
    fn viewer_catch_up_only_when_lapped() {
        let mut view = 5;
        let mut skipped = 0;
        viewer_catch_up(8, &mut view, 4, &mut skipped);
        assert_eq!((view, skipped), (5, 0));

        viewer_catch_up(20, &mut view, 4, &mut skipped);
        assert_eq!((view, skipped), (17, 12));
    }

    #[test]
    fn claim_order_prefers_furthest_behind() {
        let xfers = [2, 1, 1, 0];
        let bufs = [50, 30, 10, 40];
        assert_eq!(claim_order(&xfers, &bufs), vec![3, 2, 1, 0]);

        let tied = claim_order(&[0, 0, 0], &[7, 7, 7]);
        assert_eq!(tied, vec![0, 1, 2]);
    }

    #[test]
    #[should_panic(expected = "at most")]
    fn too_many_readers_panics() {
        let _ = RingConfig::new(2, 2).readers(MAX_READERS + 1);
    }
}
