//! What a connection handle is currently allowed to do.
//!
//! A handle is always attached; detaching consumes it. Each variant carries
//! only the sub-state that is meaningful for that role.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Viewer(ViewerState),
    Writer(WriterState),
    Reader { slot: usize, state: ReaderState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    /// Connected, holds no permit and has not looked at any slot.
    Attached,
    /// Following the writer without backpressure.
    Viewing,
    /// Saw the last buffer of the transfer it was following.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Holds the writer permit; filled slots only advance the cursor and are
    /// not published until a start-of-data is declared.
    Clocking,
    /// The next slot request declares start-of-data at the write cursor.
    PendingStart,
    /// Inside a transfer; filled slots are published to every reader.
    Writing,
    /// The next filled slot ends the transfer.
    EndPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Identity claimed; the next slot request acknowledges start-of-data.
    Locked,
    Reading,
    /// Cleared the last slot of a transfer; needs a reset to go on.
    Stopped,
}

impl Role {
    pub fn is_writer(&self) -> bool {
        matches!(self, Role::Writer(_))
    }

    pub fn is_reader(&self) -> bool {
        matches!(self, Role::Reader { .. })
    }

    pub fn is_viewer(&self) -> bool {
        matches!(self, Role::Viewer(_))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Viewer(ViewerState::Attached) => f.write_str("attached"),
            Role::Viewer(ViewerState::Viewing) => f.write_str("viewing"),
            Role::Viewer(ViewerState::Stopped) => f.write_str("viewer at end of data"),
            Role::Writer(WriterState::Clocking) => f.write_str("writer (clocking)"),
            Role::Writer(WriterState::PendingStart) => f.write_str("writer (start pending)"),
            Role::Writer(WriterState::Writing) => f.write_str("writer (writing)"),
            Role::Writer(WriterState::EndPending) => f.write_str("writer (end pending)"),
            Role::Reader { slot, state } => {
                let s = match state {
                    ReaderState::Locked => "locked",
                    ReaderState::Reading => "reading",
                    ReaderState::Stopped => "at end of data",
                };
                write!(f, "reader #{slot} ({s})")
            }
        }
    }
}
