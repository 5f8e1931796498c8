//! Point-in-time snapshots of ring state for monitoring tools.

use crate::ringbuf::Ring;
use serde::Serialize;

/// One reader identity as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReaderStats {
    pub identity: usize,
    /// Read cursor.
    pub nread: u64,
    /// Transfers completed.
    pub xfer: u64,
    /// Slots published to this identity and not yet taken.
    pub full: u32,
    /// Slots cleared and not yet reclaimed by the writer.
    pub clear: u32,
    /// Slots this identity still has to consume before the writer can reuse
    /// them.
    pub free: u64,
    pub sodack: u32,
    pub eodack: u32,
    pub reading: bool,
    pub connected: bool,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RingStats {
    pub key: String,
    pub nbufs: u64,
    pub bufsz: u64,
    pub device: Option<i32>,
    /// Write cursor.
    pub nwrite: u64,
    pub xfer: u64,
    pub writing: bool,
    pub writer_locked: bool,
    pub writer_pid: Option<u32>,
    pub read_permits: u32,
    pub readers: Vec<ReaderStats>,
}

/// What [`Ring::recover`] restored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Recovery {
    /// Pid of a dead writer whose permit was restored.
    pub writer: Option<u32>,
    /// Reader identities restored, with the pid that held them.
    pub readers: Vec<(usize, u32)>,
}

impl Recovery {
    pub fn is_empty(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

impl Ring {
    /// Snapshot of the ring.
    ///
    /// Fields are read one by one without a lock, so a snapshot taken while
    /// the ring is busy may mix values from neighbouring steps.
    pub fn stats(&self) -> RingStats {
        let nwrite = self.write_count();
        let readers = (0..self.n_readers())
            .map(|i| {
                let full = self.nfull(i);
                ReaderStats {
                    identity: i,
                    nread: self.read_count_of(i),
                    xfer: self.read_xfer_of(i),
                    full,
                    clear: self.nclear(i),
                    free: self.nbufs().saturating_sub(full as u64),
                    sodack: self.sodack(i),
                    eodack: self.eodack(i),
                    reading: self.reader_active(i),
                    connected: self.reader_connected(i),
                    pid: self.reader_pid(i),
                }
            })
            .collect();

        RingStats {
            key: self.key().to_string(),
            nbufs: self.nbufs(),
            bufsz: self.bufsz(),
            device: self.device(),
            nwrite,
            xfer: self.write_xfer(),
            writing: self.transfer_open(),
            writer_locked: self.writer_locked(),
            writer_pid: self.writer_pid(),
            read_permits: self.read_permits(),
            readers,
        }
    }
}
