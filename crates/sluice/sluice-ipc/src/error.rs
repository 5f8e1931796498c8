use crate::role::Role;
use sluice_shm::{Key, ShmError};
use std::fmt;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// An operation was called from a role or state that does not allow it.
    #[error("{op} requires {required}, handle is {role}")]
    Role {
        op: &'static str,
        required: &'static str,
        role: Role,
    },

    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error("ring {key} is incompatible: {reason}")]
    Incompatible { key: Key, reason: &'static str },

    #[error("ring {key} is busy: {what}")]
    Busy { key: Key, what: &'static str },

    #[error("no reader identity available on ring {key}")]
    NoReaderSlot { key: Key },

    #[error("start buffer {start_buf} is ahead of the write cursor {w_buf}")]
    StartAhead { start_buf: u64, w_buf: u64 },

    #[error("start buffer {start_buf} was already overwritten (oldest is {min_buf})")]
    StartExpired { start_buf: u64, min_buf: u64 },

    #[error("start byte {start_byte} exceeds slot size {bufsz}")]
    StartByteOutOfRange { start_byte: u64, bufsz: u64 },

    #[error("filled {nbytes} bytes into a slot of {bufsz}")]
    Overfilled { nbytes: u64, bufsz: u64 },

    #[error("{op}: the previous slot has not been cleared")]
    SlotHeld { op: &'static str },

    #[error("{op}: no slot is held")]
    NoSlotHeld { op: &'static str },

    #[error("{op}: {reason}")]
    Stream { op: &'static str, reason: String },

    #[error("seek {detail}")]
    Seek { detail: SeekProblem },

    #[error("ring lives on device {device}; install a matching slot copier")]
    DeviceCopy { device: i32 },

    #[error("slot copy failed")]
    Copy(#[source] io::Error),

    #[error("{} cleanup step(s) failed on ring {key}", errors.len())]
    Cleanup { key: Key, errors: Vec<ShmError> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekProblem {
    /// Rewinding past the start of the currently held slot.
    BeforeSlot { back: u64, max: u64 },
    /// Relative seek landing before byte 0.
    Negative,
    FromEnd,
}

impl fmt::Display for SeekProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeekProblem::BeforeSlot { back, max } => {
                write!(f, "back {back} bytes exceeds the {max} held in the current slot")
            }
            SeekProblem::Negative => f.write_str("before the start of the transfer"),
            SeekProblem::FromEnd => f.write_str("from the end is not supported on a stream"),
        }
    }
}

impl RingError {
    pub(crate) fn role(op: &'static str, required: &'static str, role: Role) -> Self {
        let err = RingError::Role { op, required, role };
        tracing::error!(error = %err, "role violation");
        err
    }

    pub(crate) fn stream(op: &'static str, reason: impl Into<String>) -> Self {
        let err = RingError::Stream {
            op,
            reason: reason.into(),
        };
        tracing::error!(error = %err, "stream misuse");
        err
    }
}

impl From<RingError> for io::Error {
    fn from(err: RingError) -> Self {
        let kind = match &err {
            RingError::Role { .. }
            | RingError::SlotHeld { .. }
            | RingError::NoSlotHeld { .. }
            | RingError::Stream { .. }
            | RingError::StartAhead { .. }
            | RingError::StartExpired { .. }
            | RingError::StartByteOutOfRange { .. }
            | RingError::Overfilled { .. }
            | RingError::Seek { .. } => io::ErrorKind::InvalidInput,
            RingError::Busy { .. } | RingError::NoReaderSlot { .. } => io::ErrorKind::WouldBlock,
            RingError::Incompatible { .. } => io::ErrorKind::InvalidData,
            RingError::DeviceCopy { .. } => io::ErrorKind::Unsupported,
            RingError::Copy(e) => e.kind(),
            RingError::Shm(_) | RingError::Cleanup { .. } => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
