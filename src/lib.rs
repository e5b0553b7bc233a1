#![cfg_attr(not(test), no_std)]

//! DMA SPI master with auto-transmit tail capture
//!
//! Moves SPI data between memory and a synchronous serial peripheral with two
//! DMA channels, without the CPU touching individual bytes. Reads can use the
//! peripheral's auto-transmit mode, where the peripheral clocks out
//! don't-care bytes by itself so only the receive side needs a buffer.
//!
//! # The tail problem
//!
//! With auto-transmit the peripheral keeps a few bytes in flight: when the RX
//! channel's byte counter reaches zero, [`Port::TAIL_LEN`] bytes are still in
//! the pipeline. The RX channel is therefore programmed for
//! `len - TAIL_LEN` bytes and its completion does *not* end the transfer.
//! Instead it arms the transmit-complete indication; once that fires the
//! driver stops auto-transmit and reads the last bytes one receive interrupt
//! at a time. Only the final tail byte clears the transfer flags.
//!
//! # Usage
//!
//! ```ignore
//! static SPI: SpiDma<MyPort> = SpiDma::new(MyPort::new());
//!
//! // interrupt glue
//! fn dma_irq(channel: Channel) { SPI.on_dma_complete(channel) }
//! fn usart_tx_irq() { SPI.on_tx_complete() }
//! fn usart_rx_irq() { SPI.on_rx_data() }
//!
//! let (_, rx) = SPI.read(rx_buf).wait();
//! ```
//!
//! # Modules
//!
//! - [`Port`]: what the driver needs from the peripheral and its DMA channels
//! - [`SpiDma`]: launcher, completion handlers and the sleeping wait
//! - [`sim`] (feature `sim`): host model of a USART with a 3-byte pipeline
//! - `rp` (feature `rp235x`): RP2350 PL022 binding

mod fmt;

mod buffer;
mod driver;
mod port;
mod state;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

#[cfg(feature = "rp235x")]
pub mod rp;

#[cfg(test)]
mod testing;

pub use buffer::{NoRx, NoTx, ReadBuffer, WriteBuffer};
pub use driver::{Error, SpiDma, Transfer};
pub use port::{Channel, Event, Port};
pub use state::{Phase, TransferFlags};
