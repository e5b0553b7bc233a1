//! `unsafe` traits for byte buffers handed to the DMA channels.
//!
//! A buffer given to [`SpiDma`](crate::SpiDma) is read or written by hardware
//! while the CPU keeps running, so the memory it points to must stay at the
//! same address and stay valid until the transfer completes. The blanket
//! implementations below only accept owners whose target cannot move
//! ([`StableDeref`]); the `'static` bound on the launchers takes care of the
//! lifetime.

use as_slice::{AsMutSlice, AsSlice};
use core::ops::{Deref, DerefMut};
use stable_deref_trait::StableDeref;

/// Buffer the TX channel reads from.
///
/// # Safety
///
/// - `read_buffer` must return the same pointer and length every time it is
///   called.
/// - The returned memory must be readable by the DMA engine for as long as
///   the implementing value is alive.
pub unsafe trait ReadBuffer {
    /// Start of the buffer and its length in bytes.
    fn read_buffer(&self) -> (*const u8, usize);
}

/// Buffer the RX channel and the tail capture write into.
///
/// # Safety
///
/// - `write_buffer` must return the same pointer and length every time it is
///   called.
/// - The returned memory must be writable by the DMA engine for as long as
///   the implementing value is alive.
pub unsafe trait WriteBuffer {
    /// Start of the buffer and its length in bytes.
    fn write_buffer(&mut self) -> (*mut u8, usize);
}

unsafe impl<B> ReadBuffer for B
where
    B: Deref + StableDeref,
    B::Target: AsSlice<Element = u8>,
{
    fn read_buffer(&self) -> (*const u8, usize) {
        let slice = self.deref().as_slice();
        (slice.as_ptr(), slice.len())
    }
}

unsafe impl<B> WriteBuffer for B
where
    B: DerefMut + StableDeref,
    B::Target: AsMutSlice<Element = u8>,
{
    fn write_buffer(&mut self) -> (*mut u8, usize) {
        let slice = self.deref_mut().as_mut_slice();
        (slice.as_mut_ptr(), slice.len())
    }
}

/// Placeholder TX buffer type for transfers without transmit data.
pub type NoTx = &'static [u8];

/// Placeholder RX buffer type for transfers that discard received data.
pub type NoRx = &'static mut [u8];
