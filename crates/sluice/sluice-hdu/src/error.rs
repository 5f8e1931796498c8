use sluice_ipc::{Key, RingError};

#[derive(Debug, thiserror::Error)]
pub enum HduError {
    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("unit {key} is not connected")]
    NotConnected { key: Key },

    #[error("unit {key} is already connected")]
    AlreadyConnected { key: Key },

    #[error("HDR_SIZE {hdr_size} exceeds the header slot size {slot}")]
    HeaderTooLarge { hdr_size: u64, slot: u64 },

    #[error("HDR_SIZE {0:?} is not a byte count")]
    BadHdrSize(String),

    #[error("header of {len} bytes does not fit a {slot}-byte slot")]
    HeaderOverflow { len: u64, slot: u64 },

    /// An empty header slot that was not the end of a header transfer.
    #[error("empty header slot")]
    EmptyHeader,

    #[error("{} step(s) failed on unit {key}", errors.len())]
    Teardown { key: Key, errors: Vec<RingError> },
}
