//! Byte-stream view of a ring.
//!
//! A [`Stream`] turns the slot protocol into plain reads and writes: writes
//! fill slots back to back and commit them as they fill, reads walk slots
//! and clear them once consumed. A transfer's data begins at its start byte
//! and stops at its end byte, so a reader sees exactly the bytes written
//! between `start` and `stop`.
//!
//! ```text
//!   slot     0          1          2          3
//!          ┌──────────┬──────────┬──────────┬──────────┐
//!   write  │ clocked  │   ▲start │ ████████ │ ████▲end │
//!          └──────────┴──────────┴──────────┴──────────┘
//!   read              └───────── transfer bytes ─────┘
//! ```
//!
//! Besides [`std::io::Read`], [`std::io::Write`] and [`std::io::Seek`], the
//! stream offers a block API handing out whole slots for in-place access.

use crate::copy::{HostCopy, SlotCopy};
use crate::error::{RingError, SeekProblem};
use crate::ringbuf::{ReadSlot, Ring};
use crate::role::{Role, WriterState};
use std::io::{self, SeekFrom};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Lock the writer permit and clock slots without publishing them until
    /// [`Stream::start`] names the first byte of the transfer.
    Write,
    /// Lock the writer permit; the transfer starts with the first slot written.
    WriteImmediate,
    /// Claim a reader identity and consume slots.
    Read,
    /// Follow the writer without consuming anything.
    View,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Closed,
    Write { started: bool },
    Read,
    View,
}

/// The slot currently open on this stream.
#[derive(Debug, Clone, Copy)]
struct Current {
    index: usize,
    /// Logical buffer number.
    buf: u64,
    /// Start of valid data in the slot.
    offset: usize,
    /// Valid bytes from `offset`.
    len: u64,
}

impl From<ReadSlot> for Current {
    fn from(s: ReadSlot) -> Self {
        Self {
            index: s.index,
            buf: s.buf,
            offset: s.offset,
            len: s.len,
        }
    }
}

pub struct Stream {
    ring: Ring,
    access: Access,
    cur: Option<Current>,
    /// Bytes written to, or consumed from, the current slot past its offset.
    bytes: u64,
    /// Requested start of data, as (buffer, byte), not yet raised on the ring.
    pending_start: Option<(u64, u64)>,
    /// Transfer offset just past the last slot released by a reader.
    end_tell: u64,
    copier: Box<dyn SlotCopy>,
}

impl Stream {
    /// A closed stream over `ring` using host memory copies.
    pub fn new(ring: Ring) -> Self {
        Self::with_copier(ring, Box::new(HostCopy))
    }

    pub fn with_copier(ring: Ring, copier: Box<dyn SlotCopy>) -> Self {
        Self {
            ring,
            access: Access::Closed,
            cur: None,
            bytes: 0,
            pending_start: None,
            end_tell: 0,
            copier,
        }
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Gives back the ring. An open stream should be closed first, otherwise
    /// its role is only released when the ring itself is dropped.
    pub fn into_ring(self) -> Ring {
        self.ring
    }

    /// Takes the role `mode` asks for.
    ///
    /// # Errors
    /// Fails if the stream is already open, if the ring lives on a device the
    /// installed copier cannot reach, or if the role cannot be claimed.
    pub fn open(&mut self, mode: OpenMode) -> Result<(), RingError> {
        if self.access != Access::Closed {
            return Err(RingError::stream("open", "stream is already open"));
        }
        let device = self.ring.device();
        if !self.copier.supports(device) {
            tracing::error!(?device, "slot copier cannot reach the ring's memory");
            return Err(RingError::DeviceCopy {
                device: device.unwrap_or(-1),
            });
        }

        self.access = match mode {
            OpenMode::Write | OpenMode::WriteImmediate => {
                self.ring.lock_write()?;
                // A writer that resumes an open transfer is already started.
                let started = mode == OpenMode::WriteImmediate || self.ring.is_writing();
                if !started {
                    if let Err(e) = self.ring.disable_sod() {
                        if let Err(unlock) = self.ring.unlock_write() {
                            tracing::warn!(error = %unlock, "could not release writer permit");
                        }
                        return Err(e);
                    }
                    self.ring.set_soclock_buf();
                }
                Access::Write { started }
            }
            OpenMode::Read => {
                self.ring.lock_read()?;
                Access::Read
            }
            OpenMode::View => Access::View,
        };

        self.cur = None;
        self.bytes = 0;
        self.pending_start = None;
        self.end_tell = 0;
        tracing::debug!(key = %self.ring.key(), ?mode, "stream opened");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.access != Access::Closed
    }

    /// Declares that the transfer begins at absolute byte `byte` of the
    /// clocked data.
    ///
    /// If that byte has already been written the start is raised at once;
    /// otherwise it is raised as soon as the slot holding it is committed.
    pub fn start(&mut self, byte: u64) -> Result<(), RingError> {
        if self.access != (Access::Write { started: false }) {
            return Err(RingError::stream("start", "stream is not clocking"));
        }
        let bufsz = self.ring.bufsz();
        let (buf, at) = (byte / bufsz, byte % bufsz);
        // An already clocked start is raised now; a rejected one leaves the
        // stream clocking.
        if self.ring.write_count() > buf {
            self.ring.enable_sod(buf, at)?;
        } else {
            self.pending_start = Some((buf, at));
        }
        self.access = Access::Write { started: true };
        tracing::debug!(byte, "start of data requested");
        Ok(())
    }

    fn check_pending_start(&mut self) -> Result<(), RingError> {
        let Some((buf, byte)) = self.pending_start else {
            return Ok(());
        };
        if self.ring.write_count() <= buf {
            return Ok(());
        }
        self.ring.enable_sod(buf, byte)?;
        self.pending_start = None;
        Ok(())
    }

    /// Ends the current transfer at the current write position and goes
    /// back to clocking. The writer permit is kept.
    pub fn stop(&mut self) -> Result<(), RingError> {
        if self.access != (Access::Write { started: true }) {
            return Err(RingError::stream("stop", "no transfer started"));
        }

        // A start inside the slot being written is raised now so that slot
        // can carry the end.
        if let (Some((buf, byte)), Some(cur)) = (self.pending_start, self.cur) {
            if cur.buf == buf && !self.ring.is_writing() {
                self.ring.enable_sod(buf, byte)?;
                self.pending_start = None;
            }
        }

        if self.ring.is_writing() {
            if self.cur.is_none() {
                self.acquire_write_slot()?;
            }
            self.ring.enable_eod()?;
            self.commit_slot()?;
            self.ring.set_soclock_buf();
        } else if self.pending_start.take().is_some() {
            tracing::debug!("cancelled a start of data that was never reached");
        }

        // An immediate writer that never wrote still has its implicit start
        // pending on the ring.
        if self.ring.role() == Role::Writer(WriterState::PendingStart) {
            self.ring.disable_sod()?;
            self.ring.set_soclock_buf();
        }

        self.access = Access::Write { started: false };
        Ok(())
    }

    /// Ends any transfer in progress and releases the role.
    pub fn close(&mut self) -> Result<(), RingError> {
        match self.access {
            Access::Closed => return Err(RingError::stream("close", "stream is not open")),
            Access::Write { started } => {
                if started {
                    self.stop()?;
                }
                // Whatever was clocked since the last end is dropped.
                self.cur = None;
                self.ring.rewind_to_last_end()?;
                self.ring.unlock_write()?;
            }
            Access::Read => {
                self.cur = None;
                self.ring.unlock_read()?;
            }
            Access::View => {
                self.cur = None;
                self.ring.stop_viewing();
            }
        }

        self.access = Access::Closed;
        self.bytes = 0;
        self.pending_start = None;
        tracing::debug!(key = %self.ring.key(), "stream closed");
        Ok(())
    }

    /// Rearms a reader or viewer that reached the end of a transfer.
    pub fn reset(&mut self) -> Result<(), RingError> {
        if !matches!(self.access, Access::Read | Access::View) {
            return Err(RingError::stream("reset", "stream is not reading"));
        }
        self.ring.reset()?;
        self.cur = None;
        self.bytes = 0;
        self.end_tell = 0;
        Ok(())
    }

    /// True once a reader or viewer has consumed the whole transfer.
    pub fn eod(&self) -> bool {
        self.ring.eod()
    }

    // ─── Writing ───────────────────────────────────────────────────────────

    fn acquire_write_slot(&mut self) -> Result<Current, RingError> {
        let index = self.ring.next_write()?;
        let cur = Current {
            index,
            buf: self.ring.write_count(),
            offset: 0,
            len: self.ring.bufsz(),
        };
        self.cur = Some(cur);
        self.bytes = 0;
        Ok(cur)
    }

    fn commit_slot(&mut self) -> Result<(), RingError> {
        self.ring.mark_filled(self.bytes)?;
        self.cur = None;
        self.bytes = 0;
        self.check_pending_start()
    }

    fn write_from(&mut self, mut src: &[u8]) -> Result<usize, RingError> {
        if !matches!(self.access, Access::Write { .. }) {
            return Err(RingError::stream("write", "stream is not open for writing"));
        }
        let bufsz = self.ring.bufsz();
        let total = src.len();

        while !src.is_empty() {
            // A full slot is only committed once more data arrives, so that
            // `stop` can still mark it as the last one.
            if self.cur.is_some() && self.bytes == bufsz {
                self.commit_slot()?;
            }
            let cur = match self.cur {
                Some(cur) => cur,
                None => self.acquire_write_slot()?,
            };

            let at = self.bytes as usize;
            let n = ((bufsz - self.bytes) as usize).min(src.len());
            let slot = self.ring.slot_mut(cur.index);
            self.copier
                .copy_in(&mut slot[at..at + n], &src[..n])
                .map_err(RingError::Copy)?;

            self.bytes += n as u64;
            src = &src[n..];
        }
        Ok(total)
    }

    // ─── Reading ───────────────────────────────────────────────────────────

    /// Consumes up to `want` bytes, copying them into `dst` when given.
    ///
    /// Stops early at end of data. Never takes a new slot once `want` bytes
    /// have been consumed.
    fn read_into(&mut self, mut dst: Option<&mut [u8]>, want: u64) -> Result<u64, RingError> {
        if !matches!(self.access, Access::Read | Access::View) {
            return Err(RingError::stream("read", "stream is not open for reading"));
        }

        let mut done = 0;
        while done < want {
            let cur = match self.cur {
                Some(cur) => cur,
                None => match self.ring.next_read()? {
                    Some(slot) => {
                        self.bytes = 0;
                        *self.cur.insert(slot.into())
                    }
                    None => break,
                },
            };

            let n = (cur.len - self.bytes).min(want - done);
            if let Some(dst) = dst.as_deref_mut() {
                let from = cur.offset + self.bytes as usize;
                let to = done as usize;
                let slot = self.ring.slot(cur.index);
                self.copier
                    .copy_out(&mut dst[to..to + n as usize], &slot[from..from + n as usize])
                    .map_err(RingError::Copy)?;
            }
            self.bytes += n;
            done += n;

            if self.bytes == cur.len {
                self.release_read_slot()?;
            }
        }
        Ok(done)
    }

    fn release_read_slot(&mut self) -> Result<(), RingError> {
        let Some(cur) = self.cur.take() else {
            return Ok(());
        };
        self.end_tell = self.ring.tell_at(cur.buf) + cur.len;
        self.bytes = 0;
        if self.access == Access::Read {
            self.ring.mark_cleared()?;
        }
        Ok(())
    }

    /// Discards up to `n` bytes. Returns how many were skipped.
    pub fn skip(&mut self, n: u64) -> Result<u64, RingError> {
        self.read_into(None, n)
    }

    // ─── Position ──────────────────────────────────────────────────────────

    /// Current byte position.
    ///
    /// Inside a transfer this counts from the transfer's first byte. A writer
    /// that is only clocking reports the absolute clocked position instead,
    /// which is what [`Stream::start`] expects.
    pub fn tell(&self) -> u64 {
        match self.access {
            Access::Closed => 0,
            Access::Write { .. } => {
                let buf = self.cur.map_or_else(|| self.ring.write_count(), |c| c.buf);
                if self.ring.is_writing() {
                    self.ring.tell_at(buf) + self.bytes
                } else {
                    buf * self.ring.bufsz() + self.bytes
                }
            }
            Access::Read | Access::View => match self.cur {
                Some(cur) => self.ring.tell_at(cur.buf) + self.bytes,
                None => self.ring.tell_read().unwrap_or(self.end_tell),
            },
        }
    }

    /// Moves the stream position.
    ///
    /// Forward seeks read and discard. Backward seeks stay within the slot
    /// currently open; released slots are gone.
    pub fn seek_to(&mut self, pos: SeekFrom) -> Result<u64, RingError> {
        let current = self.tell();
        let target = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(delta) => current.checked_add_signed(delta).ok_or(RingError::Seek {
                detail: SeekProblem::Negative,
            })?,
            SeekFrom::End(_) => {
                return Err(RingError::Seek {
                    detail: SeekProblem::FromEnd,
                });
            }
        };

        if target > current {
            self.skip(target - current)?;
        } else if target < current {
            let back = current - target;
            if back > self.bytes {
                tracing::error!(back, max = self.bytes, "seek before the open slot");
                return Err(RingError::Seek {
                    detail: SeekProblem::BeforeSlot {
                        back,
                        max: self.bytes,
                    },
                });
            }
            self.bytes -= back;
        }
        Ok(self.tell())
    }

    /// Oldest absolute byte still accepted by [`Stream::start`].
    pub fn start_minimum(&self) -> u64 {
        self.ring.sod_minbuf() * self.ring.bufsz()
    }

    /// Absolute byte at which the current clocking run began.
    pub fn soclock_byte(&self) -> u64 {
        self.ring.soclock_buf() * self.ring.bufsz()
    }

    /// Bytes the writer could still fill before blocking on the slowest reader.
    pub fn space_left(&self) -> u64 {
        let full = self.ring.max_full() as u64;
        self.ring.nbufs().saturating_sub(full) * self.ring.bufsz()
    }

    /// Fraction of slots the slowest reader has yet to consume.
    pub fn percent_full(&self) -> f64 {
        self.ring.max_full() as f64 / self.ring.nbufs() as f64
    }

    // ─── Blocks ────────────────────────────────────────────────────────────

    /// Hands out the next whole slot for in-place writing, with its physical
    /// index.
    pub fn open_block_write(&mut self) -> Result<(usize, &mut [u8]), RingError> {
        if self.access != (Access::Write { started: true }) {
            return Err(RingError::stream("open_block_write", "no transfer started"));
        }
        if self.cur.is_some() {
            return Err(RingError::stream("open_block_write", "a slot is already open"));
        }
        let cur = self.acquire_write_slot()?;
        Ok((cur.index, self.ring.slot_mut(cur.index)))
    }

    /// Records `n` more bytes as written to the open block without
    /// committing it.
    pub fn update_block_write(&mut self, n: u64) -> Result<(), RingError> {
        if self.cur.is_none() || !matches!(self.access, Access::Write { .. }) {
            return Err(RingError::stream("update_block_write", "no block is open"));
        }
        let bufsz = self.ring.bufsz();
        if self.bytes + n > bufsz {
            return Err(RingError::Overfilled {
                nbytes: self.bytes + n,
                bufsz,
            });
        }
        self.bytes += n;
        Ok(())
    }

    /// Adds `n` written bytes and commits the block.
    ///
    /// A block committed short of the slot size ends the transfer.
    pub fn close_block_write(&mut self, n: u64) -> Result<(), RingError> {
        self.update_block_write(n)?;
        self.commit_slot()
    }

    /// Zeroes the slot after the one being written.
    pub fn zero_next_block(&mut self) -> Result<(), RingError> {
        if self.access != (Access::Write { started: true }) {
            return Err(RingError::stream("zero_next_block", "no transfer started"));
        }
        self.ring.zero_next_write()
    }

    /// Hands out the valid bytes of the next slot for in-place reading, with
    /// its physical index. `None` at end of data.
    pub fn open_block_read(&mut self) -> Result<Option<(usize, &[u8])>, RingError> {
        if !matches!(self.access, Access::Read | Access::View) {
            return Err(RingError::stream("open_block_read", "stream is not open for reading"));
        }
        if self.cur.is_some() {
            return Err(RingError::stream("open_block_read", "a slot is already open"));
        }
        let Some(slot) = self.ring.next_read()? else {
            return Ok(None);
        };
        self.cur = Some(slot.into());
        self.bytes = 0;
        let data = &self.ring.slot(slot.index)[slot.offset..slot.offset + slot.len as usize];
        Ok(Some((slot.index, data)))
    }

    /// Records `n` bytes as consumed from the open block. The block is
    /// released once all of it has been consumed.
    pub fn close_block_read(&mut self, n: u64) -> Result<(), RingError> {
        let Some(cur) = self.cur else {
            return Err(RingError::stream("close_block_read", "no block is open"));
        };
        let remaining = cur.len - self.bytes;
        if n > remaining {
            return Err(RingError::stream(
                "close_block_read",
                format!("{n} bytes consumed but only {remaining} remain"),
            ));
        }
        if n != cur.len {
            tracing::warn!(consumed = n, len = cur.len, "block not consumed in one piece");
        }
        self.bytes += n;
        if self.bytes == cur.len {
            self.release_read_slot()?;
        }
        Ok(())
    }
}

impl io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_from(buf)?)
    }

    /// Slots are shared memory; there is nothing to flush. Data becomes
    /// visible to readers when its slot is committed.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = buf.len() as u64;
        Ok(self.read_into(Some(buf), want)? as usize)
    }
}

impl io::Seek for Stream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.seek_to(pos)?)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("ring", &self.ring)
            .field("access", &self.access)
            .field("bytes", &self.bytes)
            .finish()
    }
}
