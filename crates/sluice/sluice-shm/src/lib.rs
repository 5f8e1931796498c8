//! Key-addressed shared memory segments and counting semaphore sets.
//!
//! Every shared resource lives in a file inside a [`ShmNamespace`] directory
//! (normally `/dev/shm`) and is mapped with `memmap2`. Resources are named by
//! a numeric [`Key`], so independent processes find each other by agreeing on
//! a key rather than on a path.

mod error;
mod futex;
mod key;
mod namespace;
mod segment;
mod sem;

pub use error::ShmError;
pub use key::{KEY_INCREMENT, Key, ParseKeyError};
pub use namespace::{SHM_DIR_ENV, ShmNamespace};
pub use segment::Segment;
pub use sem::SemaphoreSet;
