//! RP2350 binding: SPI0 (PL022) served by three DMA channels.
//!
//! The PL022 has no auto-transmit mode, so it is emulated with a third
//! channel that writes a constant fill byte to the data register, paced by
//! the SPI TX request and limited to the transfer length. The 8-deep receive
//! FIFO means the pipeline still holds bytes when the RX channel finishes,
//! which is what the tail capture collects.
//!
//! Clocking, pins and frame format are configured through `embassy_rp::spi`
//! in blocking mode before [`Pl022Port::init`] hands the data path to DMA.

use embassy_rp::interrupt::{self, InterruptExt};
use embassy_rp::pac;
use embassy_rp::pac::dma::vals::{DataSize, TreqSel};

use crate::driver::SpiDma;
use crate::port::{Channel, Port};
use crate::state::Phase;

const TX_CHANNEL: usize = 0;
const RX_CHANNEL: usize = 1;
const FILL_CHANNEL: usize = 2;

/// `DMA_IRQ_0` belongs to embassy-rp's own DMA driver.
const DMA_IRQ_INDEX: usize = 1;

static FILL_BYTE: u8 = 0xFF;

#[derive(Clone, Copy)]
enum Dreq {
    Tx,
    Rx,
}

struct Setup {
    read: u32,
    write: u32,
    len: usize,
    incr_read: bool,
    incr_write: bool,
    dreq: Dreq,
}

fn arm(ch: usize, setup: Setup) {
    let p = pac::DMA.ch(ch);
    p.read_addr().write_value(setup.read);
    p.write_addr().write_value(setup.write);
    p.trans_count().write(|w| {
        w.set_mode(0.into());
        w.set_count(setup.len as u32);
    });
    p.ctrl_trig().write(|w| {
        w.set_treq_sel(match setup.dreq {
            Dreq::Tx => TreqSel::SPI0_TX,
            Dreq::Rx => TreqSel::SPI0_RX,
        });
        w.set_data_size(DataSize::SIZE_BYTE);
        w.set_incr_read(setup.incr_read);
        w.set_incr_write(setup.incr_write);
        // chaining to itself disables chaining
        w.set_chain_to(ch as u8);
        w.set_en(true);
    });
}

fn abort(ch: usize) {
    pac::DMA.chan_abort().modify(|m| m.set_chan_abort(1 << ch));
    while pac::DMA.ch(ch).ctrl_trig().read().busy() {}
}

/// Transmit FIFO empty and the last frame shifted out.
fn tx_idle() -> bool {
    let sr = pac::SPI0.sr().read();
    sr.tfe() && !sr.bsy()
}

fn data_register() -> u32 {
    pac::SPI0.dr().as_ptr() as u32
}

/// SPI0 with DMA channels 0 (TX), 1 (RX) and 2 (fill).
pub struct Pl022Port {
    _private: (),
}

impl Pl022Port {
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Hand the data path to DMA and route the interrupts.
    ///
    /// Call once, after `embassy_rp::spi::Spi` has configured SPI0.
    pub fn init(&mut self) {
        let spi = pac::SPI0;
        spi.imsc().write(|_| {});
        spi.dmacr().write(|w| {
            w.set_rxdmae(true);
            w.set_txdmae(true);
        });

        let mask = (1 << TX_CHANNEL) | (1 << RX_CHANNEL);
        pac::DMA
            .inte(DMA_IRQ_INDEX)
            .modify(|w| w.set_inte(w.inte() | mask));

        interrupt::DMA_IRQ_1.unpend();
        interrupt::SPI0_IRQ.unpend();
        // SAFETY: the handlers only touch the driver through its critical
        // section.
        unsafe {
            interrupt::DMA_IRQ_1.enable();
            interrupt::SPI0_IRQ.enable();
        }
        debug!("pl022 port ready");
    }
}

impl Default for Pl022Port {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for Pl022Port {
    // Bytes left in the RX FIFO once the RX channel has taken len - 3.
    const TAIL_LEN: usize = 3;

    fn clear_rx(&mut self) {
        let spi = pac::SPI0;
        while spi.sr().read().rne() {
            let _ = spi.dr().read();
        }
        spi.icr().write(|w| {
            w.set_roric(true);
            w.set_rtic(true);
        });
    }

    fn clear_tx(&mut self) {
        // The transmit FIFO cannot be flushed; `wait_tx_idle` has emptied it.
        pac::SPI0.imsc().modify(|w| w.set_txim(false));
    }

    fn wait_tx_idle(&mut self) {
        while !tx_idle() {}
    }

    unsafe fn start_rx_dma(&mut self, dst: *mut u8, len: usize) {
        arm(
            RX_CHANNEL,
            Setup {
                read: data_register(),
                write: dst as u32,
                len,
                incr_read: false,
                incr_write: true,
                dreq: Dreq::Rx,
            },
        );
    }

    unsafe fn start_tx_dma(&mut self, src: *const u8, len: usize) {
        arm(
            TX_CHANNEL,
            Setup {
                read: src as u32,
                write: data_register(),
                len,
                incr_read: true,
                incr_write: false,
                dreq: Dreq::Tx,
            },
        );
    }

    fn enable_auto_tx(&mut self, frames: usize) {
        arm(
            FILL_CHANNEL,
            Setup {
                read: &FILL_BYTE as *const u8 as u32,
                write: data_register(),
                len: frames,
                incr_read: false,
                incr_write: false,
                dreq: Dreq::Tx,
            },
        );
    }

    fn disable_auto_tx(&mut self) {
        abort(FILL_CHANNEL);
    }

    fn enable_tx_complete_irq(&mut self) {
        pac::SPI0.imsc().modify(|w| w.set_txim(true));
    }

    fn disable_tx_complete_irq(&mut self) {
        pac::SPI0.imsc().modify(|w| w.set_txim(false));
    }

    fn clear_tx_complete(&mut self) {
        // TXRIS is a level signal, nothing latched to clear.
    }

    fn enable_rx_data_irq(&mut self) {
        pac::SPI0.imsc().modify(|w| {
            w.set_rxim(true);
            w.set_rtim(true);
        });
    }

    fn disable_rx_data_irq(&mut self) {
        pac::SPI0.imsc().modify(|w| {
            w.set_rxim(false);
            w.set_rtim(false);
        });
    }

    fn read_rx(&mut self) -> u8 {
        pac::SPI0.dr().read().data() as u8
    }

    fn wait_for_interrupt(&mut self) {
        cortex_m::asm::wfi();
    }
}

/// Body of the `DMA_IRQ_1` handler.
pub fn on_dma_interrupt(driver: &SpiDma<Pl022Port>) {
    let ints = pac::DMA.ints(DMA_IRQ_INDEX).read();
    pac::DMA.ints(DMA_IRQ_INDEX).write_value(ints);
    let bits = ints.ints();

    if bits & (1 << TX_CHANNEL) != 0 {
        driver.on_dma_complete(Channel::Tx);
    }
    if bits & (1 << RX_CHANNEL) != 0 {
        driver.on_dma_complete(Channel::Rx);
    }
}

/// Body of the `SPI0_IRQ` handler.
pub fn on_spi_interrupt(driver: &SpiDma<Pl022Port>) {
    let spi = pac::SPI0;
    let mis = spi.mis().read();

    // TXIM asserts at half-empty, so at most four queued frames plus the one
    // in the shifter are left; wait them out here instead of re-entering on
    // the level interrupt.
    if mis.txmis() {
        driver.with_port(Pl022Port::wait_tx_idle);
        driver.on_tx_complete();
    }

    if mis.rxmis() || mis.rtmis() {
        while spi.sr().read().rne() && matches!(driver.phase(), Phase::WaitBytes { .. }) {
            driver.on_rx_data();
        }
        spi.icr().write(|w| w.set_rtic(true));
    }
}
