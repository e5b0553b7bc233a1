//! Host model of a synchronous USART master with auto-transmit and two DMA
//! channels.
//!
//! The model advances one frame per [`Usart::tick`]:
//!
//! 1. the TX channel refills the 2-level transmit buffer,
//! 2. the shifter clocks one byte out (from the transmit buffer, or a
//!    don't-care byte while auto-transmit is on and the receive path has
//!    room) and the slave's answer is shifted in,
//! 3. the RX channel drains the receive FIFO.
//!
//! The receive path holds [`RX_FIFO_DEPTH`] bytes in the FIFO plus one in the
//! shift register, which is what makes the auto-transmit tail
//! [`Usart::TAIL_LEN`](crate::Port::TAIL_LEN) bytes long. Interrupt sources
//! behave like the real ones: DMA completion is latched, TXC and RXDATAV are
//! level flags gated by their enable bits.

use heapless::{Deque, Vec};

use crate::port::{Channel, Event, Port};

/// Byte clocked out while auto-transmit generates the clock.
pub const FILL_BYTE: u8 = 0xFF;
pub const TX_BUFFER_DEPTH: usize = 2;
pub const RX_FIFO_DEPTH: usize = 2;
/// Frames kept in the bus log.
pub const LOG_CAPACITY: usize = 256;

const DEFAULT_SLEEP_BUDGET: usize = 64;

/// Slave behaviour: answer for the `n`th frame since chip select asserted,
/// given the byte the master sent.
///
/// Chip select is treated as released whenever the bus idles or the
/// transmitter is cleared for a new transfer.
pub type Slave = fn(usize, u8) -> u8;

/// One byte exchanged on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub mosi: u8,
    pub miso: u8,
}

/// Usage counters of one DMA channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Times the channel was armed.
    pub arms: usize,
    /// Count programmed by the last arm.
    pub last_len: Option<usize>,
    /// Bytes moved since the last arm.
    pub transferred: usize,
}

impl ChannelStats {
    /// The last count in the descriptor's "elements minus one" encoding.
    pub fn n_minus_1(&self) -> Option<usize> {
        self.last_len.map(|len| len - 1)
    }
}

#[derive(Default)]
struct DmaChannel {
    addr: usize,
    len: usize,
    enabled: bool,
    done_flag: bool,
    stats: ChannelStats,
}

impl DmaChannel {
    fn arm(&mut self, addr: usize, len: usize) {
        self.addr = addr;
        self.len = len;
        self.enabled = len > 0;
        self.done_flag = len == 0;
        self.stats.arms += 1;
        self.stats.last_len = Some(len);
        self.stats.transferred = 0;
    }

    fn advance(&mut self) -> usize {
        let offset = self.stats.transferred;
        self.stats.transferred += 1;
        if self.stats.transferred == self.len {
            self.enabled = false;
            self.done_flag = true;
        }
        offset
    }
}

pub struct Usart {
    slave: Slave,
    auto_tx: bool,
    ien_txc: bool,
    ien_rxdatav: bool,
    if_txc: bool,
    tx_buffer: Deque<u8, TX_BUFFER_DEPTH>,
    rx_fifo: Deque<u8, RX_FIFO_DEPTH>,
    rx_shift: Option<u8>,
    tx_dma: DmaChannel,
    rx_dma: DmaChannel,
    cs_frame: usize,
    log: Vec<Frame, LOG_CAPACITY>,
    tail: Vec<u8, LOG_CAPACITY>,
    overflows: usize,
    wakeups: usize,
    txc_enables: usize,
    rxdatav_enables: usize,
    sleep_budget: usize,
}

impl Usart {
    pub fn new(slave: Slave) -> Self {
        Self {
            slave,
            auto_tx: false,
            ien_txc: false,
            ien_rxdatav: false,
            if_txc: false,
            tx_buffer: Deque::new(),
            rx_fifo: Deque::new(),
            rx_shift: None,
            tx_dma: DmaChannel::default(),
            rx_dma: DmaChannel::default(),
            cs_frame: 0,
            log: Vec::new(),
            tail: Vec::new(),
            overflows: 0,
            wakeups: 0,
            txc_enables: 0,
            rxdatav_enables: 0,
            sleep_budget: DEFAULT_SLEEP_BUDGET,
        }
    }

    /// Frames a sleeping core lets pass before waking without an interrupt.
    pub fn with_sleep_budget(mut self, frames: usize) -> Self {
        self.sleep_budget = frames;
        self
    }

    /// Advance the bus by one frame time.
    pub fn tick(&mut self) {
        self.service_tx_dma();
        self.shift();
        self.service_rx_dma();
    }

    /// True if any enabled interrupt source is asserted.
    pub fn interrupt_pending(&self) -> bool {
        self.tx_dma.done_flag
            || self.rx_dma.done_flag
            || (self.ien_rxdatav && !self.rx_fifo.is_empty())
            || (self.ien_txc && self.if_txc)
    }

    /// Highest-priority pending interrupt. DMA completion flags are cleared
    /// on the way out, the USART sources stay asserted until handled.
    pub fn next_interrupt(&mut self) -> Option<Event> {
        if self.tx_dma.done_flag {
            self.tx_dma.done_flag = false;
            Some(Event::DmaComplete(Channel::Tx))
        } else if self.rx_dma.done_flag {
            self.rx_dma.done_flag = false;
            Some(Event::DmaComplete(Channel::Rx))
        } else if self.ien_rxdatav && !self.rx_fifo.is_empty() {
            Some(Event::RxData)
        } else if self.ien_txc && self.if_txc {
            Some(Event::TxComplete)
        } else {
            None
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
        self.tail.clear();
    }

    /// Bytes the CPU popped from the receive register.
    pub fn tail_reads(&self) -> &[u8] {
        &self.tail
    }

    pub fn channel(&self, channel: Channel) -> ChannelStats {
        match channel {
            Channel::Tx => self.tx_dma.stats,
            Channel::Rx => self.rx_dma.stats,
        }
    }

    pub fn auto_tx_enabled(&self) -> bool {
        self.auto_tx
    }

    /// True if the TXC or RXDATAV interrupt is unmasked, or a channel is
    /// still running.
    pub fn any_source_enabled(&self) -> bool {
        self.ien_txc || self.ien_rxdatav || self.tx_dma.enabled || self.rx_dma.enabled
    }

    pub fn txc_enables(&self) -> usize {
        self.txc_enables
    }

    pub fn rxdatav_enables(&self) -> usize {
        self.rxdatav_enables
    }

    pub fn overflows(&self) -> usize {
        self.overflows
    }

    pub fn wakeups(&self) -> usize {
        self.wakeups
    }

    fn service_tx_dma(&mut self) {
        while self.tx_dma.enabled && !self.tx_buffer.is_full() {
            let offset = self.tx_dma.advance();
            // SAFETY: the driver armed the channel with a buffer valid for
            // `len` reads.
            let byte = unsafe { (self.tx_dma.addr as *const u8).add(offset).read_volatile() };
            // Room was checked above.
            let _ = self.tx_buffer.push_back(byte);
        }
    }

    fn shift(&mut self) {
        let mosi = match self.tx_buffer.pop_front() {
            Some(byte) => byte,
            None if self.auto_tx && self.rx_shift.is_none() => FILL_BYTE,
            None => {
                self.if_txc = true;
                self.cs_frame = 0;
                return;
            }
        };

        let miso = (self.slave)(self.cs_frame, mosi);
        self.cs_frame += 1;
        let _ = self.log.push(Frame { mosi, miso });

        if !self.rx_fifo.is_full() {
            let _ = self.rx_fifo.push_back(miso);
        } else if self.rx_shift.is_none() {
            self.rx_shift = Some(miso);
        } else {
            self.overflows += 1;
        }
    }

    fn service_rx_dma(&mut self) {
        while self.rx_dma.enabled {
            let Some(byte) = self.pop_rx() else {
                break;
            };
            let offset = self.rx_dma.advance();
            // SAFETY: the driver armed the channel with a buffer valid for
            // `len` writes.
            unsafe { (self.rx_dma.addr as *mut u8).add(offset).write_volatile(byte) };
        }
    }

    fn pop_rx(&mut self) -> Option<u8> {
        let byte = self.rx_fifo.pop_front()?;
        if let Some(held) = self.rx_shift.take() {
            let _ = self.rx_fifo.push_back(held);
        }
        Some(byte)
    }
}

impl Port for Usart {
    const TAIL_LEN: usize = RX_FIFO_DEPTH + 1;

    fn clear_rx(&mut self) {
        self.rx_fifo.clear();
        self.rx_shift = None;
    }

    fn clear_tx(&mut self) {
        self.tx_buffer.clear();
        self.if_txc = false;
        self.cs_frame = 0;
    }

    fn wait_tx_idle(&mut self) {
        while !self.tx_buffer.is_empty() {
            self.tick();
        }
    }

    unsafe fn start_rx_dma(&mut self, dst: *mut u8, len: usize) {
        self.rx_dma.arm(dst as usize, len);
    }

    unsafe fn start_tx_dma(&mut self, src: *const u8, len: usize) {
        self.tx_dma.arm(src as usize, len);
    }

    fn enable_auto_tx(&mut self, _frames: usize) {
        self.auto_tx = true;
    }

    fn disable_auto_tx(&mut self) {
        self.auto_tx = false;
    }

    fn enable_tx_complete_irq(&mut self) {
        self.ien_txc = true;
        self.txc_enables += 1;
    }

    fn disable_tx_complete_irq(&mut self) {
        self.ien_txc = false;
    }

    fn clear_tx_complete(&mut self) {
        self.if_txc = false;
    }

    fn enable_rx_data_irq(&mut self) {
        self.ien_rxdatav = true;
        self.rxdatav_enables += 1;
    }

    fn disable_rx_data_irq(&mut self) {
        self.ien_rxdatav = false;
    }

    fn read_rx(&mut self) -> u8 {
        let byte = self.pop_rx().unwrap_or(0);
        let _ = self.tail.push(byte);
        byte
    }

    fn wait_for_interrupt(&mut self) {
        self.wakeups += 1;
        for _ in 0..self.sleep_budget {
            if self.interrupt_pending() {
                return;
            }
            self.tick();
        }
    }
}
