//! How bytes move between caller buffers and slots.
//!
//! Host rings use plain memory copies. A ring created for an accelerator
//! device needs a copier that knows how to reach that device's memory; the
//! stream refuses to open such a ring with a copier that does not claim it.

use std::io;

pub trait SlotCopy: Send {
    /// Whether this copier can reach slots on `device` (`None` is host memory).
    fn supports(&self, device: Option<i32>) -> bool;

    /// Copies `src` into the start of `slot`. `slot` is at least as long as `src`.
    fn copy_in(&mut self, slot: &mut [u8], src: &[u8]) -> io::Result<()>;

    /// Fills `dst` from the start of `slot`. `slot` is at least as long as `dst`.
    fn copy_out(&mut self, dst: &mut [u8], slot: &[u8]) -> io::Result<()>;
}

/// Plain `memcpy` for host-resident rings.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCopy;

impl SlotCopy for HostCopy {
    fn supports(&self, device: Option<i32>) -> bool {
        device.is_none()
    }

    #[inline]
    fn copy_in(&mut self, slot: &mut [u8], src: &[u8]) -> io::Result<()> {
        slot[..src.len()].copy_from_slice(src);
        Ok(())
    }

    #[inline]
    fn copy_out(&mut self, dst: &mut [u8], slot: &[u8]) -> io::Result<()> {
        dst.copy_from_slice(&slot[..dst.len()]);
        Ok(())
    }
}
