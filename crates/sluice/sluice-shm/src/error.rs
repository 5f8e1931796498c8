use crate::Key;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("segment {key} already exists")]
    Exists { key: Key },

    #[error("segment {key} does not exist")]
    Missing { key: Key },

    #[error("failed to create segment {key} ({size} bytes)")]
    Create {
        key: Key,
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to attach segment {key}")]
    Attach {
        key: Key,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove segment {key}")]
    Remove {
        key: Key,
        #[source]
        source: io::Error,
    },

    #[error("failed to (un)lock segment {key} in memory")]
    Lock {
        key: Key,
        #[source]
        source: io::Error,
    },

    #[error("segment {key} is not usable: {reason}")]
    Invalid { key: Key, reason: &'static str },

    #[error("semaphore set {key} was removed")]
    Removed { key: Key },
}

impl ShmError {
    /// Key of the resource the failure refers to.
    pub fn key(&self) -> Key {
        match self {
            ShmError::Exists { key }
            | ShmError::Missing { key }
            | ShmError::Create { key, .. }
            | ShmError::Attach { key, .. }
            | ShmError::Remove { key, .. }
            | ShmError::Lock { key, .. }
            | ShmError::Invalid { key, .. }
            | ShmError::Removed { key } => *key,
        }
    }
}
