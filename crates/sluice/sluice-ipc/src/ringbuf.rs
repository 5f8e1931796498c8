//! The ring buffer core: slot lifecycle, per-reader backpressure and the
//! transfer handshake between one writer and any number of readers.
//!
//! # Protocol
//! - The writer fills slot `w_buf % nbufs` and marks it filled. While a
//!   transfer is open this bumps the slot's pending count and posts `FULL`
//!   once per reader identity.
//! - Each reader waits on its own `FULL`, consumes the slot and posts its
//!   own `CLEAR`. Before reusing a slot with a non-zero pending count the
//!   writer takes one `CLEAR` from every reader per pending publication.
//! - Starting a transfer takes one `SODACK` per reader, ending one takes one
//!   `EODACK`. Readers give them back when they observe the start and clear
//!   the last slot, so the writer can never run more than `MAX_TRANSFERS`
//!   transfer records ahead of the slowest reader.
//! - Viewers read the freshest slot by polling the write cursor and touch no
//!   semaphore at all.

use crate::error::RingError;
use crate::ring::{RingConfig, claim_order, slot_index, sod_minbuf, tell_offset, viewer_catch_up, xfer_index};
use crate::role::{ReaderState, Role, ViewerState, WriterState};
use crate::shm_layout::{
    CONN_NSEMS, DATA_NSEMS, MAX_READERS, MAX_TRANSFERS, NO_END, R_IDLE, R_READING, SEM_CLEAR, SEM_EODACK, SEM_FULL,
    SEM_READ, SEM_READER_CONN, SEM_SODACK, SEM_WRITE, SYNC_MAGIC, SyncHeader, TransferRecord, W_IDLE, W_WRITING,
    bytes_for_sync, counts_offset, slot_keys_offset,
};
use sluice_shm::{Key, Segment, SemaphoreSet, ShmError, ShmNamespace};
use std::mem::size_of;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

/// How often a viewer re-checks the write cursor.
pub const DEFAULT_VIEW_POLL: Duration = Duration::from_millis(100);

/// How often slot zeroing re-checks that every reader has cleared a slot.
pub const DEFAULT_ZERO_POLL: Duration = Duration::from_millis(10);

/// A slot handed out for reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSlot {
    /// Logical buffer number.
    pub buf: u64,
    /// Physical slot index.
    pub index: usize,
    /// First valid byte in the slot.
    pub offset: usize,
    /// Valid bytes starting at `offset`.
    pub len: u64,
}

/// A connection to a shared ring.
///
/// Every handle starts attached as a passive viewer. Writer and reader roles
/// are claimed with [`Ring::lock_write`] and [`Ring::lock_read`] and are
/// handed back on unlock or when the handle is dropped.
pub struct Ring {
    key: Key,
    sync: Segment,
    connect: SemaphoreSet,
    data: Vec<SemaphoreSet>,
    slots: Vec<Segment>,
    nbufs: u64,
    bufsz: u64,
    role: Role,
    /// Transfer record this handle is working on.
    xfer: usize,
    /// Reader: logical buffer taken from `FULL` and not yet cleared.
    held: Option<u64>,
    /// Viewer: next logical buffer to look at.
    viewbuf: u64,
    view_skipped: u64,
    soclock_buf: u64,
    view_poll: Duration,
    zero_poll: Duration,
}

fn slot_key(key: Key, buf: usize) -> Key {
    key.offset((2 + MAX_READERS + buf) as u32)
}

fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks that the process exists.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

impl Ring {
    /// Creates the descriptor, semaphore sets and slot segments of a new ring.
    ///
    /// The writer permit and `cfg.readers` reader permits are made available,
    /// and every reader identity is granted `MAX_TRANSFERS` start and end
    /// acknowledgments. The returned handle is attached as a viewer.
    ///
    /// # Errors
    /// Fails if any derived key is already in use. Resources created before
    /// the failure are removed again.
    pub fn create(ns: &ShmNamespace, key: Key, cfg: RingConfig) -> Result<Self, RingError> {
        let mut sync = Segment::create(ns, key, bytes_for_sync(cfg.nbufs as usize))?;
        let mut created = vec![key];

        match Self::create_parts(ns, key, &cfg, &mut sync, &mut created) {
            Ok((connect, data, slots)) => {
                let ring = Self::assemble(key, sync, connect, data, slots, cfg.nbufs, cfg.bufsz);
                ring.sync().magic.store(SYNC_MAGIC, Ordering::Release);
                tracing::debug!(
                    %key,
                    nbufs = cfg.nbufs,
                    bufsz = cfg.bufsz,
                    readers = cfg.readers,
                    "created ring"
                );
                Ok(ring)
            }
            Err(err) => {
                tracing::error!(%key, error = %err, "ring creation failed, removing partial resources");
                for k in created {
                    if let Err(e) = Segment::unlink(ns, k) {
                        tracing::warn!(key = %k, error = %e, "could not remove partial resource");
                    }
                }
                Err(err)
            }
        }
    }

    fn create_parts(
        ns: &ShmNamespace,
        key: Key,
        cfg: &RingConfig,
        sync: &mut Segment,
        created: &mut Vec<Key>,
    ) -> Result<(SemaphoreSet, Vec<SemaphoreSet>, Vec<Segment>), RingError> {
        let nbufs = cfg.nbufs as usize;
        let semkey_connect = key.offset(1);
        let semkey_data: [i32; MAX_READERS] = std::array::from_fn(|i| key.offset(2 + i as u32).0);

        // SAFETY: the segment was just created with `bytes_for_sync(nbufs)`
        // bytes and nobody can attach before the magic is published.
        unsafe {
            let base = sync.as_mut_ptr();
            ptr::write(
                base as *mut SyncHeader,
                SyncHeader::new(cfg, semkey_connect.0, semkey_data),
            );
            let keys = base.add(slot_keys_offset(nbufs)) as *mut i32;
            for b in 0..nbufs {
                keys.add(b).write(slot_key(key, b).0);
            }
        }

        let connect = SemaphoreSet::create(ns, semkey_connect, CONN_NSEMS)?;
        created.push(semkey_connect);

        let mut data = Vec::with_capacity(cfg.readers);
        for &k in &semkey_data[..cfg.readers] {
            data.push(SemaphoreSet::create(ns, Key(k), DATA_NSEMS)?);
            created.push(Key(k));
        }

        let mut slots = Vec::with_capacity(nbufs);
        for b in 0..nbufs {
            let k = slot_key(key, b);
            slots.push(Segment::create(ns, k, cfg.bufsz as usize)?);
            created.push(k);
        }

        connect.post(SEM_WRITE, 1)?;
        connect.post(SEM_READ, cfg.readers as u32)?;
        for d in &data {
            d.post(SEM_SODACK, MAX_TRANSFERS as u32)?;
            d.post(SEM_EODACK, MAX_TRANSFERS as u32)?;
            d.post(SEM_READER_CONN, 1)?;
        }

        Ok((connect, data, slots))
    }

    /// Attaches to an existing ring without creating anything.
    ///
    /// # Errors
    /// [`ShmError::Missing`] (wrapped) if no ring has `key`, or
    /// [`RingError::Incompatible`] if the descriptor is not a valid ring.
    pub fn connect(ns: &ShmNamespace, key: Key) -> Result<Self, RingError> {
        let sync = Segment::attach(ns, key)?;
        if sync.len() < size_of::<SyncHeader>() {
            return Err(RingError::Incompatible {
                key,
                reason: "descriptor too small",
            });
        }

        // SAFETY: the mapping holds at least one header.
        let h = unsafe { &*(sync.as_ptr() as *const SyncHeader) };
        h.validate(sync.len())
            .map_err(|reason| RingError::Incompatible { key, reason })?;

        let nbufs = h.nbufs;
        let bufsz = h.bufsz;
        let n_readers = h.n_readers as usize;

        let connect = SemaphoreSet::attach(ns, Key(h.semkey_connect), CONN_NSEMS)?;
        let data = h.semkey_data[..n_readers]
            .iter()
            .map(|&k| SemaphoreSet::attach(ns, Key(k), DATA_NSEMS))
            .collect::<Result<Vec<_>, ShmError>>()?;

        // SAFETY: `validate` checked that the key table lies inside the mapping.
        let keys = unsafe {
            slice::from_raw_parts(
                sync.as_ptr().add(slot_keys_offset(nbufs as usize)) as *const i32,
                nbufs as usize,
            )
        };
        let mut slots = Vec::with_capacity(nbufs as usize);
        for &k in keys {
            let seg = Segment::attach(ns, Key(k))?;
            if (seg.len() as u64) < bufsz {
                return Err(RingError::Incompatible {
                    key,
                    reason: "slot smaller than the descriptor says",
                });
            }
            slots.push(seg);
        }

        tracing::debug!(%key, nbufs, bufsz, readers = n_readers, "connected to ring");
        Ok(Self::assemble(key, sync, connect, data, slots, nbufs, bufsz))
    }

    fn assemble(
        key: Key,
        sync: Segment,
        connect: SemaphoreSet,
        data: Vec<SemaphoreSet>,
        slots: Vec<Segment>,
        nbufs: u64,
        bufsz: u64,
    ) -> Self {
        Self {
            key,
            sync,
            connect,
            data,
            slots,
            nbufs,
            bufsz,
            role: Role::Viewer(ViewerState::Attached),
            xfer: 0,
            held: None,
            viewbuf: 0,
            view_skipped: 0,
            soclock_buf: 0,
            view_poll: DEFAULT_VIEW_POLL,
            zero_poll: DEFAULT_ZERO_POLL,
        }
    }

    /// Hands back any held role and detaches.
    pub fn disconnect(mut self) -> Result<(), RingError> {
        let res = self.release_role();
        tracing::debug!(key = %self.key, "disconnected from ring");
        res
    }

    /// Removes every resource of the ring.
    ///
    /// Every removal is attempted even if an earlier one fails; the failures
    /// are reported together. Processes still attached keep their mappings
    /// until they detach, but any of them blocked on a semaphore is released
    /// with an error.
    pub fn destroy(mut self) -> Result<(), RingError> {
        if let Err(e) = self.release_role() {
            tracing::warn!(key = %self.key, error = %e, "could not release role before destroy");
        }

        let mut errors = Vec::new();
        let mut record = |res: Result<(), ShmError>| {
            if let Err(e) = res {
                tracing::error!(error = %e, "destroy step failed");
                errors.push(e);
            }
        };

        record(self.connect.remove());
        for d in &self.data {
            record(d.remove());
        }
        for s in &self.slots {
            record(s.remove());
        }
        record(self.sync.remove());

        if errors.is_empty() {
            tracing::debug!(key = %self.key, "destroyed ring");
            Ok(())
        } else {
            Err(RingError::Cleanup {
                key: self.key,
                errors,
            })
        }
    }

    /// Connects to the ring at `key` and destroys it.
    pub fn destroy_key(ns: &ShmNamespace, key: Key) -> Result<(), RingError> {
        Ring::connect(ns, key)?.destroy()
    }

    #[inline(always)]
    fn sync(&self) -> &SyncHeader {
        // SAFETY: validated at create/connect; the mapping lives as long as self.
        unsafe { &*(self.sync.as_ptr() as *const SyncHeader) }
    }

    #[inline(always)]
    fn counts(&self) -> &[AtomicU32] {
        // SAFETY: the count table follows the header and spans `nbufs` entries.
        unsafe {
            slice::from_raw_parts(
                self.sync.as_ptr().add(counts_offset()) as *const AtomicU32,
                self.nbufs as usize,
            )
        }
    }

    #[inline(always)]
    fn record(&self) -> &TransferRecord {
        &self.sync().xfers[self.xfer]
    }

    /// True once the current transfer's end is known to be `buf`.
    fn ends_at(&self, buf: u64) -> bool {
        let rec = self.record();
        rec.eod.load(Ordering::Acquire) != 0 && rec.e_buf.load(Ordering::Acquire) == buf
    }

    fn release_role(&mut self) -> Result<(), RingError> {
        match self.role {
            Role::Writer(_) => self.unlock_write(),
            Role::Reader { .. } => self.unlock_read(),
            Role::Viewer(_) => {
                self.stop_viewing();
                Ok(())
            }
        }
    }

    fn require_attached(&self, op: &'static str) -> Result<(), RingError> {
        match self.role {
            Role::Viewer(ViewerState::Attached) => Ok(()),
            role => Err(RingError::role(op, "an attached handle", role)),
        }
    }

    // ─── Writer ────────────────────────────────────────────────────────────

    /// Claims the single writer permit, blocking while another handle has it.
    ///
    /// If the previous writer left a transfer open, this handle resumes it;
    /// otherwise it must declare a start-of-data (explicitly, or implicitly
    /// on its first [`Ring::next_write`]).
    pub fn lock_write(&mut self) -> Result<(), RingError> {
        self.require_attached("lock_write")?;
        tracing::trace!(key = %self.key, "waiting for writer permit");
        self.connect.wait(SEM_WRITE, 1)?;
        self.become_writer();
        Ok(())
    }

    /// Like [`Ring::lock_write`] but fails with [`RingError::Busy`] instead
    /// of blocking.
    pub fn try_lock_write(&mut self) -> Result<(), RingError> {
        self.require_attached("try_lock_write")?;
        if !self.connect.try_wait(SEM_WRITE, 1)? {
            return Err(RingError::Busy {
                key: self.key,
                what: "writer permit is held",
            });
        }
        self.become_writer();
        Ok(())
    }

    fn become_writer(&mut self) {
        let s = self.sync();
        s.w_pid.store(std::process::id(), Ordering::Release);
        let resumed = s.w_state.load(Ordering::Acquire) == W_WRITING;
        let xfer = xfer_index(s.w_xfer.load(Ordering::Acquire));

        self.xfer = xfer;
        self.role = Role::Writer(if resumed {
            WriterState::Writing
        } else {
            WriterState::PendingStart
        });
        tracing::debug!(key = %self.key, resumed, "locked as writer");
    }

    pub fn unlock_write(&mut self) -> Result<(), RingError> {
        if !self.role.is_writer() {
            return Err(RingError::role("unlock_write", "the writer", self.role));
        }
        self.sync().w_pid.store(0, Ordering::Release);
        self.connect.post(SEM_WRITE, 1)?;
        self.role = Role::Viewer(ViewerState::Attached);
        tracing::debug!(key = %self.key, "unlocked writer");
        Ok(())
    }

    /// Switches a writer with a pending start into clocking mode: filled
    /// slots advance the cursor but stay invisible to readers until
    /// [`Ring::enable_sod`] is called.
    pub fn disable_sod(&mut self) -> Result<(), RingError> {
        match self.role {
            Role::Writer(WriterState::PendingStart) => {
                self.role = Role::Writer(WriterState::Clocking);
                Ok(())
            }
            role => Err(RingError::role("disable_sod", "a writer with a pending start", role)),
        }
    }

    /// Oldest buffer that may still be named as start-of-data.
    pub fn sod_minbuf(&self) -> u64 {
        sod_minbuf(self.write_count(), self.soclock_buf, self.nbufs)
    }

    /// Opens a transfer whose first valid byte is `start_byte` of logical
    /// buffer `start_buf`.
    ///
    /// Buffers already clocked from `start_buf` onwards are published to the
    /// readers immediately.
    ///
    /// # Errors
    /// Rejected without side effects if `start_buf` is ahead of the write
    /// cursor, older than [`Ring::sod_minbuf`], or `start_byte` exceeds the
    /// slot size. Blocks while any reader has not yet acknowledged the start
    /// of the transfer that last used this transfer record.
    pub fn enable_sod(&mut self, start_buf: u64, start_byte: u64) -> Result<(), RingError> {
        match self.role {
            Role::Writer(WriterState::Clocking | WriterState::PendingStart) => {}
            role => return Err(RingError::role("enable_sod", "a writer outside a transfer", role)),
        }

        let w_buf = self.write_count();
        if start_buf > w_buf {
            tracing::error!(start_buf, w_buf, "start-of-data ahead of write cursor");
            return Err(RingError::StartAhead { start_buf, w_buf });
        }
        let min_buf = self.sod_minbuf();
        if start_buf < min_buf {
            tracing::error!(start_buf, min_buf, "start-of-data already overwritten");
            return Err(RingError::StartExpired { start_buf, min_buf });
        }
        if start_byte > self.bufsz {
            tracing::error!(start_byte, bufsz = self.bufsz, "start byte out of range");
            return Err(RingError::StartByteOutOfRange {
                start_byte,
                bufsz: self.bufsz,
            });
        }

        for d in &self.data {
            d.wait(SEM_SODACK, 1)?;
        }

        let s = self.sync();
        let xfer = xfer_index(s.w_xfer.load(Ordering::Acquire));
        let rec = &s.xfers[xfer];
        rec.s_buf.store(start_buf, Ordering::Release);
        rec.s_byte.store(start_byte, Ordering::Release);

        let counts = self.counts();
        for buf in start_buf..w_buf {
            counts[slot_index(buf, self.nbufs)].fetch_add(1, Ordering::AcqRel);
        }
        s.w_state.store(W_WRITING, Ordering::Release);

        self.xfer = xfer;
        self.role = Role::Writer(WriterState::Writing);

        let backlog = w_buf - start_buf;
        if backlog > 0 {
            for d in &self.data {
                d.post(SEM_FULL, backlog as u32)?;
            }
        }

        tracing::debug!(key = %self.key, start_buf, start_byte, backlog, "start of data");
        Ok(())
    }

    /// Makes the next [`Ring::mark_filled`] end the transfer even if the slot
    /// is full.
    pub fn enable_eod(&mut self) -> Result<(), RingError> {
        match self.role {
            Role::Writer(WriterState::Writing | WriterState::EndPending) => {
                self.role = Role::Writer(WriterState::EndPending);
                Ok(())
            }
            role => Err(RingError::role("enable_eod", "a writer inside a transfer", role)),
        }
    }

    /// Returns the physical index of the next slot to fill.
    ///
    /// Blocks until every reader has cleared whatever the slot last held.
    /// With a start pending, declares start-of-data at the write cursor first.
    pub fn next_write(&mut self) -> Result<usize, RingError> {
        if !self.role.is_writer() {
            return Err(RingError::role("next_write", "the writer", self.role));
        }
        if self.role == Role::Writer(WriterState::PendingStart) {
            let w_buf = self.write_count();
            self.enable_sod(w_buf, 0)?;
        }

        let index = slot_index(self.write_count(), self.nbufs);
        let count = &self.counts()[index];
        while count.load(Ordering::Acquire) > 0 {
            for d in &self.data {
                d.wait(SEM_CLEAR, 1)?;
            }
            count.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(index)
    }

    /// Commits the slot returned by the last [`Ring::next_write`].
    ///
    /// Inside a transfer, `nbytes < bufsz` (or a prior
    /// [`Ring::enable_eod`]) ends the transfer at this slot, after which the
    /// writer is back to clocking. While clocking, only the cursor advances.
    pub fn mark_filled(&mut self, nbytes: u64) -> Result<(), RingError> {
        if nbytes > self.bufsz {
            return Err(RingError::Overfilled {
                nbytes,
                bufsz: self.bufsz,
            });
        }
        let ending = match self.role {
            Role::Writer(WriterState::Clocking) => {
                self.sync().w_buf.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
            Role::Writer(WriterState::Writing) => nbytes < self.bufsz,
            Role::Writer(WriterState::EndPending) => true,
            role => {
                return Err(RingError::role(
                    "mark_filled",
                    "a writer that is writing or clocking",
                    role,
                ));
            }
        };

        let w_buf = self.write_count();

        if ending {
            for d in &self.data {
                d.wait(SEM_EODACK, 1)?;
            }

            let s = self.sync();
            let rec = &s.xfers[self.xfer];
            rec.e_byte.store(nbytes, Ordering::Release);
            rec.e_buf.store(w_buf, Ordering::Release);
            rec.eod.store(1, Ordering::Release);
            let w_xfer = s.w_xfer.fetch_add(1, Ordering::AcqRel) + 1;
            s.w_state.store(W_IDLE, Ordering::Release);

            self.xfer = xfer_index(w_xfer);
            self.role = Role::Writer(WriterState::Clocking);
            tracing::debug!(key = %self.key, end_buf = w_buf, end_byte = nbytes, "end of data");
        }

        self.counts()[slot_index(w_buf, self.nbufs)].fetch_add(1, Ordering::AcqRel);
        self.sync().w_buf.fetch_add(1, Ordering::AcqRel);

        for d in &self.data {
            d.post(SEM_FULL, 1)?;
        }
        Ok(())
    }

    /// Zeroes the slot after the one currently being written, once every
    /// reader has at least one cleared slot outstanding. Polls.
    pub fn zero_next_write(&mut self) -> Result<(), RingError> {
        if !self.role.is_writer() {
            return Err(RingError::role("zero_next_write", "the writer", self.role));
        }

        while self.data.iter().any(|d| d.value(SEM_CLEAR) == 0) {
            thread::sleep(self.zero_poll);
        }

        let next = slot_index(self.write_count() + 1, self.nbufs);
        self.slots[next].as_mut_slice().fill(0);
        Ok(())
    }

    /// Buffer at which clocking began: just past the end of the last
    /// transfer, or 0 before the first one.
    pub fn set_soclock_buf(&mut self) -> u64 {
        let s = self.sync();
        let w_xfer = s.w_xfer.load(Ordering::Acquire);
        let soclock = if w_xfer > 0 {
            let prev = &s.xfers[xfer_index(w_xfer - 1)];
            prev.e_buf.load(Ordering::Acquire).wrapping_add(1)
        } else {
            0
        };
        self.soclock_buf = soclock;
        soclock
    }

    pub fn soclock_buf(&self) -> u64 {
        self.soclock_buf
    }

    /// Moves the write cursor back to just after the last ended transfer,
    /// dropping anything clocked since.
    pub(crate) fn rewind_to_last_end(&mut self) -> Result<(), RingError> {
        match self.role {
            Role::Writer(WriterState::Clocking | WriterState::PendingStart) => {}
            role => return Err(RingError::role("rewind", "a writer outside a transfer", role)),
        }
        let s = self.sync();
        let w_xfer = s.w_xfer.load(Ordering::Acquire);
        if w_xfer > 0 {
            let e_buf = s.xfers[xfer_index(w_xfer - 1)].e_buf.load(Ordering::Acquire);
            if e_buf != NO_END {
                s.w_buf.store(e_buf + 1, Ordering::Release);
            }
        }
        Ok(())
    }

    // ─── Reader ────────────────────────────────────────────────────────────

    /// Claims a reader identity, blocking until a reader permit is free.
    ///
    /// Identities are tried furthest-behind first (transfer, then buffer,
    /// then lowest index); identities held by another handle are skipped.
    ///
    /// # Errors
    /// [`RingError::NoReaderSlot`] if every identity turns out to be taken.
    pub fn lock_read(&mut self) -> Result<(), RingError> {
        self.require_attached("lock_read")?;
        tracing::trace!(key = %self.key, "waiting for reader permit");
        self.connect.wait(SEM_READ, 1)?;
        self.claim_identity()
    }

    /// Like [`Ring::lock_read`] but fails with [`RingError::Busy`] instead
    /// of blocking.
    pub fn try_lock_read(&mut self) -> Result<(), RingError> {
        self.require_attached("try_lock_read")?;
        if !self.connect.try_wait(SEM_READ, 1)? {
            return Err(RingError::Busy {
                key: self.key,
                what: "all reader permits are held",
            });
        }
        self.claim_identity()
    }

    fn claim_identity(&mut self) -> Result<(), RingError> {
        let n = self.data.len();
        let s = self.sync();
        let r_xfers: Vec<u64> = s.r_xfers[..n].iter().map(|x| x.load(Ordering::Acquire)).collect();
        let r_bufs: Vec<u64> = s.r_bufs[..n].iter().map(|x| x.load(Ordering::Acquire)).collect();

        let mut chosen = None;
        for i in claim_order(&r_xfers, &r_bufs) {
            match self.data[i].try_wait(SEM_READER_CONN, 1) {
                Ok(true) => {
                    chosen = Some(i);
                    break;
                }
                Ok(false) => tracing::trace!(identity = i, "reader identity busy, skipping"),
                Err(e) => {
                    if let Err(post) = self.connect.post(SEM_READ, 1) {
                        tracing::warn!(key = %self.key, error = %post, "could not return reader permit");
                    }
                    return Err(e.into());
                }
            }
        }

        let Some(slot) = chosen else {
            self.connect.post(SEM_READ, 1)?;
            tracing::error!(key = %self.key, "no reader identity available");
            return Err(RingError::NoReaderSlot { key: self.key });
        };

        s.r_pids[slot].store(std::process::id(), Ordering::Release);
        let state = if s.r_states[slot].load(Ordering::Acquire) == R_IDLE {
            ReaderState::Locked
        } else {
            ReaderState::Reading
        };
        let xfer = xfer_index(s.r_xfers[slot].load(Ordering::Acquire));

        self.xfer = xfer;
        self.held = None;
        self.role = Role::Reader { slot, state };
        tracing::debug!(key = %self.key, identity = slot, ?state, "locked as reader");
        Ok(())
    }

    /// Hands the reader identity back.
    ///
    /// A slot taken but not cleared is returned to the identity's `FULL`
    /// count, so whoever claims the identity next reads it again.
    pub fn unlock_read(&mut self) -> Result<(), RingError> {
        let Role::Reader { slot, .. } = self.role else {
            return Err(RingError::role("unlock_read", "a reader", self.role));
        };

        if let Some(buf) = self.held.take() {
            self.sync().r_held[slot].store(0, Ordering::Release);
            self.data[slot].post(SEM_FULL, 1)?;
            tracing::debug!(identity = slot, buf, "returned uncleared slot");
        }

        self.sync().r_pids[slot].store(0, Ordering::Release);
        self.data[slot].post(SEM_READER_CONN, 1)?;
        self.connect.post(SEM_READ, 1)?;
        self.role = Role::Viewer(ViewerState::Attached);
        tracing::debug!(key = %self.key, identity = slot, "unlocked reader");
        Ok(())
    }

    /// Takes the next slot for reading.
    ///
    /// A reader blocks until the writer publishes another slot; its first
    /// call after claiming an identity also acknowledges the start of the
    /// transfer and begins at the declared start byte. A viewer polls the
    /// write cursor instead and may skip slots the writer has lapped.
    ///
    /// Returns `Ok(None)` at end of data.
    pub fn next_read(&mut self) -> Result<Option<ReadSlot>, RingError> {
        if self.eod() {
            return Ok(None);
        }
        match self.role {
            Role::Reader { slot, state } => self.next_read_as_reader(slot, state).map(Some),
            Role::Viewer(_) => self.next_view(),
            role => Err(RingError::role("next_read", "a reader or viewer", role)),
        }
    }

    fn next_read_as_reader(&mut self, slot: usize, state: ReaderState) -> Result<ReadSlot, RingError> {
        if self.held.is_some() {
            return Err(RingError::SlotHeld { op: "next_read" });
        }

        self.data[slot].wait(SEM_FULL, 1)?;

        let mut start_byte = 0;
        if state == ReaderState::Locked {
            let s = self.sync();
            let xfer = xfer_index(s.r_xfers[slot].load(Ordering::Acquire));
            let rec = &s.xfers[xfer];
            s.r_bufs[slot].store(rec.s_buf.load(Ordering::Acquire), Ordering::Release);
            s.r_states[slot].store(R_READING, Ordering::Release);
            start_byte = rec.s_byte.load(Ordering::Acquire);

            self.xfer = xfer;
            self.role = Role::Reader {
                slot,
                state: ReaderState::Reading,
            };
            self.data[slot].post(SEM_SODACK, 1)?;
            tracing::debug!(identity = slot, start_byte, "acknowledged start of data");
        }

        let s = self.sync();
        let buf = s.r_bufs[slot].load(Ordering::Acquire);
        s.r_held[slot].store(1, Ordering::Release);
        self.held = Some(buf);

        Ok(self.read_slot(buf, start_byte))
    }

    fn read_slot(&self, buf: u64, start_byte: u64) -> ReadSlot {
        let len = if self.ends_at(buf) {
            self.record()
                .e_byte
                .load(Ordering::Acquire)
                .saturating_sub(start_byte)
        } else {
            self.bufsz - start_byte
        };
        ReadSlot {
            buf,
            index: slot_index(buf, self.nbufs),
            offset: start_byte as usize,
            len,
        }
    }

    fn next_view(&mut self) -> Result<Option<ReadSlot>, RingError> {
        let mut start_byte = 0;

        if self.role == Role::Viewer(ViewerState::Attached) {
            let s = self.sync();
            // Follow the transfer of the first reader identity, or the
            // writer's own when the ring has no readers.
            let xfer = match self.data.len() {
                0 => s.w_xfer.load(Ordering::Acquire),
                _ => s.r_xfers[0].load(Ordering::Acquire),
            };
            let xfer = xfer_index(xfer);
            let rec = &s.xfers[xfer];
            let mut viewbuf = rec.s_buf.load(Ordering::Acquire);
            start_byte = rec.s_byte.load(Ordering::Acquire);

            // Jump to the freshest buffer rather than replaying the transfer.
            let w_buf = s.w_buf.load(Ordering::Acquire);
            if w_buf > viewbuf + 1 {
                viewbuf = w_buf - 1;
                start_byte = 0;
            }

            self.xfer = xfer;
            self.viewbuf = viewbuf;
            self.role = Role::Viewer(ViewerState::Viewing);
        }

        loop {
            let rec = self.record();
            let e_buf = rec.e_buf.load(Ordering::Acquire);
            // An end older than the record's start belongs to a previous use
            // of the record.
            let ended = rec.eod.load(Ordering::Acquire) != 0
                && e_buf != NO_END
                && e_buf >= rec.s_buf.load(Ordering::Acquire);
            if ended && self.viewbuf > e_buf {
                self.role = Role::Viewer(ViewerState::Stopped);
                tracing::debug!(key = %self.key, "viewer reached end of data");
                return Ok(None);
            }
            if self.write_count() > self.viewbuf {
                break;
            }
            thread::sleep(self.view_poll);
        }

        let w_buf = self.write_count();
        let before = self.viewbuf;
        viewer_catch_up(w_buf, &mut self.viewbuf, self.nbufs, &mut self.view_skipped);
        if self.viewbuf != before {
            start_byte = 0;
            tracing::trace!(skipped = self.viewbuf - before, "viewer lapped by writer");
        }

        let buf = self.viewbuf;
        self.viewbuf += 1;
        Ok(Some(self.read_slot(buf, start_byte)))
    }

    /// Returns a viewer to the attached state.
    pub fn stop_viewing(&mut self) {
        if self.role.is_viewer() {
            self.role = Role::Viewer(ViewerState::Attached);
        }
    }

    /// Releases the slot returned by the last [`Ring::next_read`].
    ///
    /// Clearing the last slot of a transfer acknowledges its end and stops
    /// the reader until [`Ring::reset`].
    pub fn mark_cleared(&mut self) -> Result<(), RingError> {
        let slot = match self.role {
            Role::Reader {
                slot,
                state: ReaderState::Reading,
            } => slot,
            role => return Err(RingError::role("mark_cleared", "a reading reader", role)),
        };
        let Some(buf) = self.held else {
            return Err(RingError::NoSlotHeld { op: "mark_cleared" });
        };

        self.data[slot].post(SEM_CLEAR, 1)?;
        self.held = None;

        let s = self.sync();
        s.r_held[slot].store(0, Ordering::Release);

        if self.ends_at(buf) {
            s.r_states[slot].store(R_IDLE, Ordering::Release);
            let r_xfer = s.r_xfers[slot].fetch_add(1, Ordering::AcqRel) + 1;

            self.xfer = xfer_index(r_xfer);
            self.role = Role::Reader {
                slot,
                state: ReaderState::Stopped,
            };
            self.data[slot].post(SEM_EODACK, 1)?;
            tracing::debug!(identity = slot, buf, "cleared last slot of transfer");
        } else {
            s.r_bufs[slot].fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    // ─── Reset ─────────────────────────────────────────────────────────────

    /// Cooperative reset.
    ///
    /// A stopped reader (or viewer) is rearmed for the next transfer. The
    /// writer drains every outstanding clear and acknowledgment, blocking
    /// until all readers have caught up, and then zeroes all cursors.
    pub fn reset(&mut self) -> Result<(), RingError> {
        match self.role {
            Role::Reader {
                slot,
                state: ReaderState::Stopped,
            } => {
                self.role = Role::Reader {
                    slot,
                    state: ReaderState::Locked,
                };
                Ok(())
            }
            Role::Viewer(ViewerState::Stopped) => {
                self.role = Role::Viewer(ViewerState::Attached);
                Ok(())
            }
            Role::Writer(_) => self.reset_as_writer(),
            role => Err(RingError::role("reset", "the writer or a stopped reader", role)),
        }
    }

    fn reset_as_writer(&mut self) -> Result<(), RingError> {
        if self.write_count() == 0 {
            return Ok(());
        }

        for count in self.counts() {
            while count.load(Ordering::Acquire) > 0 {
                for d in &self.data {
                    d.wait(SEM_CLEAR, 1)?;
                }
                count.fetch_sub(1, Ordering::AcqRel);
            }
        }

        let xfers = MAX_TRANSFERS as u32;
        for d in &self.data {
            d.wait(SEM_SODACK, xfers)?;
            d.wait(SEM_EODACK, xfers)?;
            d.post(SEM_SODACK, xfers)?;
            d.post(SEM_EODACK, xfers)?;
        }

        self.zero_cursors();
        tracing::info!(key = %self.key, "ring reset");
        Ok(())
    }

    fn zero_cursors(&mut self) {
        let s = self.sync();
        for i in 0..self.data.len() {
            s.r_bufs[i].store(0, Ordering::Release);
            s.r_xfers[i].store(0, Ordering::Release);
        }
        for rec in &s.xfers {
            rec.e_buf.store(NO_END, Ordering::Release);
            rec.eod.store(1, Ordering::Release);
        }
        s.w_buf.store(0, Ordering::Release);
        s.w_xfer.store(0, Ordering::Release);

        self.xfer = 0;
        self.soclock_buf = 0;
    }

    /// Forcibly zeroes every cursor, pending count and data semaphore and
    /// restores the acknowledgment budgets.
    ///
    /// Corrupts the stream of any reader that is mid-transfer; meant for
    /// operators recovering a wedged ring.
    pub fn hard_reset(&mut self) -> Result<(), RingError> {
        for count in self.counts() {
            count.store(0, Ordering::Release);
        }
        let xfers = MAX_TRANSFERS as u32;
        for d in &self.data {
            d.set_value(SEM_FULL, 0)?;
            d.set_value(SEM_CLEAR, 0)?;
            d.set_value(SEM_SODACK, xfers)?;
            d.set_value(SEM_EODACK, xfers)?;
        }

        let s = self.sync();
        s.w_state.store(W_IDLE, Ordering::Release);
        for i in 0..self.data.len() {
            s.r_states[i].store(R_IDLE, Ordering::Release);
            s.r_held[i].store(0, Ordering::Release);
        }
        self.zero_cursors();
        self.held = None;
        if self.role.is_writer() {
            self.role = Role::Writer(WriterState::PendingStart);
        }
        tracing::warn!(key = %self.key, "ring hard reset");
        Ok(())
    }

    /// Restores permits held by processes that no longer exist.
    ///
    /// A dead writer's permit is made available again (its transfer, if any,
    /// stays open for the next writer to resume). A dead reader's identity is
    /// released and any slot it held uncleared is handed back to `FULL`.
    pub fn recover(&self) -> Result<crate::stats::Recovery, RingError> {
        let s = self.sync();
        let mut report = crate::stats::Recovery::default();

        let pid = s.w_pid.load(Ordering::Acquire);
        if pid != 0 && !process_alive(pid) {
            s.w_pid.store(0, Ordering::Release);
            self.connect.set_value(SEM_WRITE, 1)?;
            tracing::warn!(key = %self.key, pid, "recovered writer permit from dead process");
            report.writer = Some(pid);
        }

        for (i, d) in self.data.iter().enumerate() {
            let pid = s.r_pids[i].load(Ordering::Acquire);
            if pid == 0 || process_alive(pid) {
                continue;
            }
            if s.r_held[i].swap(0, Ordering::AcqRel) != 0 {
                d.post(SEM_FULL, 1)?;
            }
            s.r_pids[i].store(0, Ordering::Release);
            d.set_value(SEM_READER_CONN, 1)?;
            self.connect.post(SEM_READ, 1)?;
            tracing::warn!(key = %self.key, identity = i, pid, "recovered reader identity from dead process");
            report.readers.push((i, pid));
        }

        Ok(report)
    }

    // ─── Memory ────────────────────────────────────────────────────────────

    /// Pins the descriptor and every slot into RAM.
    pub fn lock_memory(&self) -> Result<(), RingError> {
        self.sync.lock()?;
        for s in &self.slots {
            s.lock()?;
        }
        Ok(())
    }

    pub fn unlock_memory(&self) -> Result<(), RingError> {
        self.sync.unlock()?;
        for s in &self.slots {
            s.unlock()?;
        }
        Ok(())
    }

    /// Zeroes every slot, faulting all pages in.
    pub fn page(&mut self) {
        for s in &mut self.slots {
            s.as_mut_slice().fill(0);
        }
    }

    /// Contents of physical slot `index`.
    ///
    /// # Panics
    /// Panics if `index >= nbufs`.
    #[inline]
    pub fn slot(&self, index: usize) -> &[u8] {
        &self.slots[index].as_slice()[..self.bufsz as usize]
    }

    #[inline]
    pub fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        let bufsz = self.bufsz as usize;
        &mut self.slots[index].as_mut_slice()[..bufsz]
    }

    // ─── Tunables ──────────────────────────────────────────────────────────

    /// Interval between viewer polls of the write cursor.
    pub fn set_view_poll(&mut self, interval: Duration) {
        self.view_poll = interval;
    }

    pub fn view_poll(&self) -> Duration {
        self.view_poll
    }

    /// Interval between checks in [`Ring::zero_next_write`].
    pub fn set_zero_poll(&mut self, interval: Duration) {
        self.zero_poll = interval;
    }

    // ─── Queries ───────────────────────────────────────────────────────────

    #[inline]
    pub fn key(&self) -> Key {
        self.key
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn nbufs(&self) -> u64 {
        self.nbufs
    }

    #[inline]
    pub fn bufsz(&self) -> u64 {
        self.bufsz
    }

    #[inline]
    pub fn n_readers(&self) -> usize {
        self.data.len()
    }

    pub fn device(&self) -> Option<i32> {
        let d = self.sync().device;
        (d >= 0).then_some(d)
    }

    pub fn is_writer(&self) -> bool {
        self.role.is_writer()
    }

    /// Writer inside a transfer.
    pub fn is_writing(&self) -> bool {
        matches!(
            self.role,
            Role::Writer(WriterState::Writing | WriterState::EndPending)
        )
    }

    pub fn is_reader(&self) -> bool {
        self.role.is_reader()
    }

    /// Reader identity held by this handle.
    pub fn reader_slot(&self) -> Option<usize> {
        match self.role {
            Role::Reader { slot, .. } => Some(slot),
            _ => None,
        }
    }

    /// Inside a transfer, as writer or reader.
    pub fn sod(&self) -> bool {
        self.is_writing()
            || matches!(
                self.role,
                Role::Reader {
                    state: ReaderState::Reading,
                    ..
                }
            )
    }

    /// Past the end of the transfer, as reader or viewer.
    pub fn eod(&self) -> bool {
        matches!(
            self.role,
            Role::Reader {
                state: ReaderState::Stopped,
                ..
            } | Role::Viewer(ViewerState::Stopped)
        )
    }

    /// Buffers written since creation or the last reset.
    pub fn write_count(&self) -> u64 {
        self.sync().w_buf.load(Ordering::Acquire)
    }

    /// Physical slot the writer fills next.
    pub fn write_index(&self) -> usize {
        slot_index(self.write_count(), self.nbufs)
    }

    /// Transfers ended since creation or the last reset.
    pub fn write_xfer(&self) -> u64 {
        self.sync().w_xfer.load(Ordering::Acquire)
    }

    /// Whether a transfer is open, whoever the writer is.
    pub fn transfer_open(&self) -> bool {
        self.sync().w_state.load(Ordering::Acquire) == W_WRITING
    }

    pub fn writer_pid(&self) -> Option<u32> {
        let pid = self.sync().w_pid.load(Ordering::Acquire);
        (pid != 0).then_some(pid)
    }

    /// Read cursor of this handle's identity, or of identity 0.
    pub fn read_count(&self) -> u64 {
        self.read_count_of(self.reader_slot().unwrap_or(0))
    }

    pub fn read_count_of(&self, reader: usize) -> u64 {
        self.sync().r_bufs[reader].load(Ordering::Acquire)
    }

    pub fn read_index(&self) -> usize {
        slot_index(self.read_count(), self.nbufs)
    }

    pub fn read_xfer_of(&self, reader: usize) -> u64 {
        self.sync().r_xfers[reader].load(Ordering::Acquire)
    }

    pub fn reader_active(&self, reader: usize) -> bool {
        self.sync().r_states[reader].load(Ordering::Acquire) == R_READING
    }

    pub fn reader_pid(&self, reader: usize) -> Option<u32> {
        let pid = self.sync().r_pids[reader].load(Ordering::Acquire);
        (pid != 0).then_some(pid)
    }

    pub fn nfull(&self, reader: usize) -> u32 {
        self.data[reader].value(SEM_FULL)
    }

    pub fn nclear(&self, reader: usize) -> u32 {
        self.data[reader].value(SEM_CLEAR)
    }

    pub fn sodack(&self, reader: usize) -> u32 {
        self.data[reader].value(SEM_SODACK)
    }

    pub fn eodack(&self, reader: usize) -> u32 {
        self.data[reader].value(SEM_EODACK)
    }

    /// Whether some handle holds reader identity `reader`.
    pub fn reader_connected(&self, reader: usize) -> bool {
        self.data[reader].value(SEM_READER_CONN) == 0
    }

    /// Reader permits not currently claimed.
    pub fn read_permits(&self) -> u32 {
        self.connect.value(SEM_READ)
    }

    pub fn writer_locked(&self) -> bool {
        self.connect.value(SEM_WRITE) == 0
    }

    /// Largest full count across reader identities: the slowest reader's
    /// backlog. Zero for a ring without readers.
    pub fn max_full(&self) -> u32 {
        (0..self.data.len()).map(|i| self.nfull(i)).max().unwrap_or(0)
    }

    /// Slots skipped by this viewer because the writer lapped it.
    pub fn view_skipped(&self) -> u64 {
        self.view_skipped
    }

    /// Bytes from the start of the current transfer to the start of `buf`.
    pub fn tell_at(&self, buf: u64) -> u64 {
        let rec = self.record();
        tell_offset(
            buf,
            rec.s_buf.load(Ordering::Acquire),
            rec.s_byte.load(Ordering::Acquire),
            self.bufsz,
        )
    }

    /// Transfer offset of the slot the writer fills next. `None` outside a
    /// transfer.
    pub fn tell_write(&self) -> Option<u64> {
        self.is_writing().then(|| self.tell_at(self.write_count()))
    }

    /// Transfer offset of the next slot to be read. `None` at end of data.
    pub fn tell_read(&self) -> Option<u64> {
        match self.role {
            Role::Reader {
                slot,
                state: ReaderState::Reading,
            } => Some(self.tell_at(self.read_count_of(slot))),
            Role::Viewer(ViewerState::Viewing) => Some(self.tell_at(self.viewbuf)),
            _ if self.eod() => None,
            _ => Some(0),
        }
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        if let Err(e) = self.release_role() {
            tracing::warn!(key = %self.key, error = %e, "failed to release role on drop");
        }
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("key", &self.key)
            .field("nbufs", &self.nbufs)
            .field("bufsz", &self.bufsz)
            .field("readers", &self.data.len())
            .field("role", &self.role)
            .finish()
    }
}
