//! Hardware seam between the transfer state machine and a concrete
//! peripheral.

/// One of the two logical DMA channels serving the peripheral.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Channel {
    /// Memory to transmit data register.
    Tx,
    /// Receive data register to memory.
    Rx,
}

/// Hardware event delivered to [`SpiDma::dispatch`](crate::SpiDma::dispatch).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// A DMA channel has moved its whole programmed count.
    DmaComplete(Channel),
    /// The transmit pipeline has drained.
    TxComplete,
    /// A received byte is waiting in the receive data register.
    RxData,
}

/// Register-level operations the driver needs from a synchronous serial
/// peripheral and its two DMA channels.
///
/// Peripheral clocking, pin routing, frame format and the static channel
/// descriptors (byte-sized units, memory-side increment) are set up before
/// the port is handed to [`SpiDma`](crate::SpiDma). All methods are called
/// with interrupts masked.
pub trait Port {
    /// Bytes still resident in the transmit/receive pipeline when the RX
    /// channel's count runs out during auto-transmit.
    ///
    /// These bytes are collected one at a time through the byte-available
    /// interrupt. Must be non-zero.
    const TAIL_LEN: usize;

    /// Flush the receive register/FIFO.
    fn clear_rx(&mut self);

    /// Flush the transmit register/FIFO and drop a stale transmit-complete
    /// indication.
    fn clear_tx(&mut self);

    /// Spin until every byte already handed to the transmitter has been
    /// shifted out. The TX channel must not be running.
    fn wait_tx_idle(&mut self);

    /// Arm the RX channel to move `len` bytes into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `len` byte writes until the channel completes.
    unsafe fn start_rx_dma(&mut self, dst: *mut u8, len: usize);

    /// Arm the TX channel to move `len` bytes from `src`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `len` byte reads until the channel completes.
    unsafe fn start_tx_dma(&mut self, src: *const u8, len: usize);

    /// Start clocking out don't-care bytes whenever the receiver has room.
    ///
    /// `frames` is the length of the whole transfer. Peripherals whose
    /// auto-transmit is throttled by the receiver ignore it; emulations that
    /// are not throttled must not clock more than `frames` bytes.
    fn enable_auto_tx(&mut self, frames: usize);

    /// Stop generating don't-care bytes.
    fn disable_auto_tx(&mut self);

    /// Unmask the transmit-complete indication.
    fn enable_tx_complete_irq(&mut self);

    /// Mask the transmit-complete indication.
    fn disable_tx_complete_irq(&mut self);

    /// Acknowledge the transmit-complete indication.
    fn clear_tx_complete(&mut self);

    /// Unmask the byte-available interrupt.
    fn enable_rx_data_irq(&mut self);

    /// Mask the byte-available interrupt.
    fn disable_rx_data_irq(&mut self);

    /// Pop one byte from the receive data register.
    fn read_rx(&mut self) -> u8;

    /// Enter a low-power wait.
    ///
    /// Called with interrupts masked; must return once an interrupt is
    /// pending (or spuriously). The pending handler runs when the caller
    /// unmasks.
    fn wait_for_interrupt(&mut self);
}
