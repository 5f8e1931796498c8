//! Header plus data units: a data ring and the header ring that describes
//! each of its transfers.

mod error;
mod header;
mod unit;

pub use error::HduError;
pub use header::{AsciiHeader, HDR_SIZE};
pub use unit::HeaderDataUnit;
