//! DMA-driven SPI master with auto-transmit tail capture.
//!
//! # Modes
//!
//! A transfer is classified when it is launched:
//!
//! - **TX only** (`write`): the TX channel moves every byte, received data is
//!   ignored.
//! - **Full duplex** (`transfer`): TX and RX channels each move every byte;
//!   completion needs both channel callbacks, in either order.
//! - **Auto-transmit** (`read`): the peripheral clocks out don't-care bytes by
//!   itself. The RX channel only moves `len - TAIL_LEN` bytes, because the
//!   last [`Port::TAIL_LEN`] bytes are still inside the peripheral pipeline
//!   when the channel's count reaches zero. Its completion arms the
//!   transmit-complete indication; once the pipeline has drained,
//!   auto-transmit is switched off and the byte-available interrupt collects
//!   the tail one byte at a time.
//!
//! ```text
//!  launch ──► RX DMA done ──► TX complete ──► RX data × TAIL_LEN ──► idle
//!               (Idle)         (WaitDrain)      (WaitBytes)
//! ```
//!
//! # Interrupts
//!
//! The board glue forwards the DMA completion callback to
//! [`SpiDma::on_dma_complete`], the peripheral's transmit-complete interrupt
//! to [`SpiDma::on_tx_complete`] and its receive-data interrupt to
//! [`SpiDma::on_rx_data`] (or everything through [`SpiDma::dispatch`]).
//! Each handler runs inside the driver's critical section and never blocks.

use core::cell::RefCell;
use core::sync::atomic::{compiler_fence, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::buffer::{NoRx, NoTx, ReadBuffer, WriteBuffer};
use crate::port::{Channel, Event, Port};
use crate::state::{Capture, Phase, RxDone, RxTarget, State, TransferFlags};

/// Reasons a transfer is refused before any hardware is touched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The previous transfer has not completed.
    Busy,
    /// Neither a transmit nor a receive buffer was supplied.
    NoBuffers,
    /// Zero length, or an auto-transmit length not longer than the tail.
    TooShort,
    /// A buffer holds fewer bytes than the requested length.
    BufferTooSmall,
}

struct Inner<P> {
    port: P,
    state: State,
}

/// SPI master driver owning a [`Port`] and the state of the transfer in
/// flight.
///
/// Meant to live in a `static` so interrupt handlers can reach it.
pub struct SpiDma<P: Port> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<Inner<P>>>,
}

impl<P: Port> SpiDma<P> {
    pub const fn new(port: P) -> Self {
        assert!(P::TAIL_LEN > 0, "Port::TAIL_LEN must be non-zero");
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                port,
                state: State::new(),
            })),
        }
    }

    /// Start a transfer of `len` bytes.
    ///
    /// Without `tx` the transfer uses auto-transmit and `rx` is required.
    /// Without `rx` received bytes are discarded.
    ///
    /// # Panics
    ///
    /// On any condition [`try_launch`](Self::try_launch) reports as an
    /// error; launching while busy or with bad lengths is a caller bug.
    pub fn launch<T, R>(&self, tx: Option<T>, rx: Option<R>, len: usize) -> Transfer<'_, P, T, R>
    where
        T: ReadBuffer + 'static,
        R: WriteBuffer + 'static,
    {
        match self.try_launch(tx, rx, len) {
            Ok(transfer) => transfer,
            Err(e) => core::panic!("SPI DMA launch rejected: {:?}", e),
        }
    }

    /// Checked variant of [`launch`](Self::launch).
    pub fn try_launch<T, R>(
        &self,
        tx: Option<T>,
        mut rx: Option<R>,
        len: usize,
    ) -> Result<Transfer<'_, P, T, R>, Error>
    where
        T: ReadBuffer + 'static,
        R: WriteBuffer + 'static,
    {
        let auto_tx = tx.is_none();

        if tx.is_none() && rx.is_none() {
            return Err(Error::NoBuffers);
        }
        if len == 0 || (auto_tx && len <= P::TAIL_LEN) {
            return Err(Error::TooShort);
        }

        let src = match &tx {
            Some(tx) => {
                let (ptr, cap) = tx.read_buffer();
                if cap < len {
                    return Err(Error::BufferTooSmall);
                }
                Some(ptr)
            }
            None => None,
        };
        let dst = match &mut rx {
            Some(rx) => {
                let (ptr, cap) = rx.write_buffer();
                if cap < len {
                    return Err(Error::BufferTooSmall);
                }
                Some(ptr)
            }
            None => None,
        };

        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let Inner { port, state } = &mut *inner;

            if state.flags().is_active() {
                return Err(Error::Busy);
            }

            // A finished TX-only transfer may still have bytes queued; they
            // go out before the transmitter is flushed, and their answers are
            // dropped with the receive FIFO below.
            port.wait_tx_idle();

            debug!("spi dma launch: len={}, auto_tx={}", len, auto_tx);
            state.start(auto_tx, dst.and_then(RxTarget::new), len);

            // Buffer writes made by the caller must land before DMA reads them.
            compiler_fence(Ordering::Release);

            if let Some(dst) = dst {
                port.clear_rx();
                let count = if auto_tx { len - P::TAIL_LEN } else { len };
                // SAFETY: `dst` is valid for `len >= count` bytes and the
                // buffer is held by the returned `Transfer` until completion.
                unsafe { port.start_rx_dma(dst, count) };
            }

            port.clear_tx();

            match src {
                // SAFETY: as above, for reads from the TX buffer.
                Some(src) => unsafe { port.start_tx_dma(src, len) },
                None => port.enable_auto_tx(len),
            }

            Ok(())
        })?;

        Ok(Transfer {
            driver: self,
            buffers: Some((tx, rx)),
        })
    }

    /// Send `tx`, ignoring whatever comes back.
    pub fn write<T>(&self, tx: T) -> Transfer<'_, P, T, NoRx>
    where
        T: ReadBuffer + 'static,
    {
        let len = tx.read_buffer().1;
        self.launch(Some(tx), None, len)
    }

    /// Send `tx` and receive the same number of bytes into `rx`.
    pub fn transfer<T, R>(&self, tx: T, rx: R) -> Transfer<'_, P, T, R>
    where
        T: ReadBuffer + 'static,
        R: WriteBuffer + 'static,
    {
        let len = tx.read_buffer().1;
        self.launch(Some(tx), Some(rx), len)
    }

    /// Fill `rx` using auto-transmit.
    pub fn read<R>(&self, mut rx: R) -> Transfer<'_, P, NoTx, R>
    where
        R: WriteBuffer + 'static,
    {
        let len = rx.write_buffer().1;
        self.launch(None, Some(rx), len)
    }

    /// True while either half of the current transfer is running.
    pub fn is_active(&self) -> bool {
        self.flags().is_active()
    }

    pub fn flags(&self) -> TransferFlags {
        self.inner.lock(|inner| inner.borrow().state.flags())
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock(|inner| inner.borrow().state.phase())
    }

    /// Block until the current transfer has completed, sleeping between
    /// interrupts.
    ///
    /// The flags are read and the sleep entered with interrupts masked, so a
    /// completion landing between the check and the sleep still wakes the
    /// core; its handler runs once the mask is lifted and the flags are read
    /// again.
    pub fn await_completion(&self) {
        loop {
            let active = self.inner.lock(|inner| {
                let mut inner = inner.borrow_mut();
                let active = inner.state.flags().is_active();
                if active {
                    inner.port.wait_for_interrupt();
                }
                active
            });
            if !active {
                break;
            }
        }

        // DMA writes must be visible before the caller reads the buffers.
        compiler_fence(Ordering::Acquire);
    }

    /// Wait for the current transfer, then for the transmitter to shift out
    /// every queued byte.
    ///
    /// A TX-only transfer completes once its channel has handed the last byte
    /// to the peripheral. Call this before releasing chip select.
    pub fn flush(&self) {
        self.await_completion();
        self.inner.lock(|inner| inner.borrow_mut().port.wait_tx_idle());
    }

    /// DMA completion callback.
    pub fn on_dma_complete(&self, channel: Channel) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let Inner { port, state } = &mut *inner;

            trace!("dma complete: {}", channel);
            match channel {
                Channel::Tx => {
                    if !state.tx_done() {
                        warn!("unexpected TX DMA completion");
                    }
                }
                Channel::Rx => match state.rx_done() {
                    RxDone::Finished => {}
                    RxDone::WatchDrain => port.enable_tx_complete_irq(),
                    RxDone::Unexpected => warn!("unexpected RX DMA completion"),
                },
            }
        })
    }

    /// Transmit-complete interrupt: the pipeline has drained, switch to
    /// byte-at-a-time capture.
    pub fn on_tx_complete(&self) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let Inner { port, state } = &mut *inner;

            port.disable_tx_complete_irq();
            port.clear_tx_complete();

            if !state.drained(P::TAIL_LEN) {
                warn!("TX complete without a pending drain");
                return;
            }

            port.disable_auto_tx();
            port.enable_rx_data_irq();
            trace!("pipeline drained, capturing {} tail bytes", P::TAIL_LEN);
        })
    }

    /// Receive-data interrupt: store one tail byte.
    pub fn on_rx_data(&self) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            let Inner { port, state } = &mut *inner;

            let byte = port.read_rx();
            match state.capture(byte) {
                Capture::Stored => {}
                Capture::Done => {
                    port.disable_rx_data_irq();
                    trace!("tail captured, transfer complete");
                }
                Capture::Unexpected => {
                    port.disable_rx_data_irq();
                    warn!("RX data without a pending tail capture");
                }
            }
        })
    }

    /// Route a hardware event to its handler.
    pub fn dispatch(&self, event: Event) {
        match event {
            Event::DmaComplete(channel) => self.on_dma_complete(channel),
            Event::TxComplete => self.on_tx_complete(),
            Event::RxData => self.on_rx_data(),
        }
    }

    /// Run `f` on the port inside the critical section.
    ///
    /// For board glue that has to poke the peripheral outside a transfer.
    pub fn with_port<U>(&self, f: impl FnOnce(&mut P) -> U) -> U {
        self.inner.lock(|inner| f(&mut inner.borrow_mut().port))
    }

    /// Give the port back.
    ///
    /// # Panics
    ///
    /// If a transfer is still active.
    pub fn free(self) -> P {
        let inner = self.inner.into_inner().into_inner();
        assert!(
            !inner.state.flags().is_active(),
            "SPI DMA released with a transfer in flight"
        );
        inner.port
    }
}

/// A launched transfer holding its buffers.
///
/// Dropping it before completion blocks until the hardware is done with the
/// buffers; transfers cannot be cancelled.
#[must_use = "dropping a Transfer blocks until it completes"]
pub struct Transfer<'d, P: Port, T, R> {
    driver: &'d SpiDma<P>,
    // always `Some` outside of `wait` and `Drop::drop`
    buffers: Option<(Option<T>, Option<R>)>,
}

impl<'d, P: Port, T, R> Transfer<'d, P, T, R> {
    pub fn is_done(&self) -> bool {
        !self.driver.is_active()
    }

    /// Wait for completion and take the buffers back.
    pub fn wait(mut self) -> (Option<T>, Option<R>) {
        self.driver.await_completion();
        self.buffers.take().unwrap_or((None, None))
    }
}

impl<'d, P: Port, T, R> Drop for Transfer<'d, P, T, R> {
    fn drop(&mut self) {
        if self.buffers.is_some() {
            self.driver.await_completion();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Usart, FILL_BYTE};
    use crate::testing::{buffer, setup};

    fn loopback(_n: usize, mosi: u8) -> u8 {
        mosi
    }

    fn counter(n: usize, _mosi: u8) -> u8 {
        0x40 + n as u8
    }

    fn mosi(spi: &SpiDma<Usart>) -> std::vec::Vec<u8> {
        spi.with_port(|usart| usart.frames().iter().map(|f| f.mosi).collect())
    }

    const COUNTED: [u8; 10] = [0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49];

    #[test]
    fn tx_only_transfer_runs_on_the_tx_channel() {
        let spi = setup(Usart::new(loopback));
        let tx: &'static [u8] = b"Hello Worl";

        let transfer = spi.write(tx);
        assert_eq!(
            spi.flags(),
            TransferFlags {
                tx_active: true,
                rx_active: false
            }
        );
        spi.with_port(|usart| {
            let stats = usart.channel(Channel::Tx);
            assert_eq!(stats.last_len, Some(10));
            assert_eq!(stats.n_minus_1(), Some(9));
            assert_eq!(usart.channel(Channel::Rx).arms, 0);
            assert!(!usart.auto_tx_enabled());
        });

        let (sent, received) = transfer.wait();
        assert_eq!(sent, Some(tx));
        assert!(received.is_none());
        assert_eq!(spi.flags(), TransferFlags::IDLE);

        // The TX channel finishes while the last byte is still queued.
        let queued = spi.with_port(|usart| usart.frames().len());
        assert!(queued < 10);

        spi.flush();
        assert_eq!(mosi(spi), b"Hello Worl");
        spi.with_port(|usart| {
            assert_eq!(usart.channel(Channel::Tx).transferred, 10);
            assert_eq!(usart.txc_enables(), 0);
            assert_eq!(usart.rxdatav_enables(), 0);
            assert!(usart.tail_reads().is_empty());
        });
    }

    #[test]
    fn back_to_back_writes_keep_every_byte() {
        let spi = setup(Usart::new(loopback));

        let _ = spi.write(b"Hello Worl" as &'static [u8]).wait();
        let _ = spi.write(b"0123456789" as &'static [u8]).wait();
        spi.flush();

        assert_eq!(mosi(spi), b"Hello Worl0123456789");
    }

    #[test]
    fn full_duplex_after_a_write_stays_aligned() {
        let spi = setup(Usart::new(loopback));
        let tx: &'static [u8] = b"0123456789";

        let _ = spi.write(b"abcd" as &'static [u8]).wait();
        let (_, rx) = spi.transfer(tx, buffer::<10>()).wait();

        assert_eq!(&rx.unwrap()[..], tx);
        assert_eq!(mosi(spi), b"abcd0123456789");
    }

    #[test]
    fn full_duplex_moves_everything_by_dma() {
        let spi = setup(Usart::new(loopback));
        let tx: &'static [u8] = b"0123456789";

        let transfer = spi.transfer(tx, buffer::<10>());
        assert!(spi.flags().tx_active && spi.flags().rx_active);

        let (_, rx) = transfer.wait();
        let rx = rx.unwrap();
        assert_eq!(&rx[..], tx);
        assert!(!spi.is_active());
        assert_eq!(spi.phase(), Phase::Idle);

        spi.with_port(|usart| {
            assert_eq!(usart.channel(Channel::Tx).transferred, 10);
            assert_eq!(usart.channel(Channel::Rx).transferred, 10);
            assert_eq!(usart.txc_enables(), 0);
            assert_eq!(usart.rxdatav_enables(), 0);
            assert!(!usart.any_source_enabled());
        });
    }

    #[test]
    fn auto_tx_read_captures_the_tail_by_interrupt() {
        let spi = setup(Usart::new(counter));

        let transfer = spi.read(buffer::<10>());
        assert!(spi.flags().tx_active && spi.flags().rx_active);
        spi.with_port(|usart| {
            let rx = usart.channel(Channel::Rx);
            assert_eq!(rx.last_len, Some(10 - Usart::TAIL_LEN));
            assert_eq!(rx.n_minus_1(), Some(6));
            assert_eq!(usart.channel(Channel::Tx).arms, 0);
            assert!(usart.auto_tx_enabled());
        });

        let (tx, rx) = transfer.wait();
        let rx = rx.unwrap();
        assert!(tx.is_none());
        assert_eq!(*rx, COUNTED);
        assert_eq!(spi.flags(), TransferFlags::IDLE);
        assert_eq!(spi.phase(), Phase::Idle);

        spi.with_port(|usart| {
            assert_eq!(usart.channel(Channel::Rx).transferred, 7);
            assert_eq!(usart.tail_reads(), &rx[7..]);
            assert_eq!(usart.frames().len(), 10);
            assert!(usart.frames().iter().all(|f| f.mosi == FILL_BYTE));
            assert!(!usart.auto_tx_enabled());
            assert!(!usart.any_source_enabled());
            assert_eq!(usart.overflows(), 0);
        });
    }

    #[test]
    fn back_to_back_reads_are_independent() {
        let spi = setup(Usart::new(counter));

        let (_, first) = spi.read(buffer::<10>()).wait();
        let first = first.unwrap();
        let (_, second) = spi.read(buffer::<10>()).wait();
        let second = second.unwrap();

        assert_eq!(*first, COUNTED);
        assert_eq!(*second, COUNTED);
        spi.with_port(|usart| {
            assert_eq!(usart.channel(Channel::Rx).arms, 2);
            assert_eq!(usart.tail_reads().len(), 2 * Usart::TAIL_LEN);
            assert_eq!(usart.frames().len(), 20);
        });
    }

    #[test]
    fn repeated_full_duplex_transfers_are_identical() {
        let spi = setup(Usart::new(|n, mosi| mosi ^ n as u8));
        let tx: &'static [u8] = b"abcdefgh";

        let (_, a) = spi.transfer(tx, buffer::<8>()).wait();
        let log_a = spi.with_port(|usart| {
            let log = usart.frames().to_vec();
            usart.clear_log();
            log
        });
        let (_, b) = spi.transfer(tx, buffer::<8>()).wait();
        let log_b = spi.with_port(|usart| usart.frames().to_vec());

        assert_eq!(a, b);
        assert_eq!(log_a, log_b);
    }

    #[test]
    fn completion_survives_spurious_wakeups() {
        let spi = setup(Usart::new(counter).with_sleep_budget(1));

        let (_, rx) = spi.read(buffer::<10>()).wait();

        assert_eq!(*rx.unwrap(), COUNTED);
        assert!(spi.with_port(|usart| usart.wakeups()) >= 10);
    }

    #[test]
    fn events_raised_while_masked_are_handled_on_unmask() {
        let spi = setup(Usart::new(counter));
        let transfer = spi.read(buffer::<10>());

        // The hardware runs to the end of the pipeline while interrupts are
        // masked; every handler only runs once the section is left.
        spi.with_port(|usart| {
            for _ in 0..20 {
                usart.tick();
            }
            assert!(usart.interrupt_pending());
        });

        assert!(!spi.is_active());
        let (_, rx) = transfer.wait();
        assert_eq!(*rx.unwrap(), COUNTED);
        assert_eq!(spi.with_port(|usart| usart.wakeups()), 0);
    }

    #[test]
    fn launch_while_active_is_refused() {
        let spi = setup(Usart::new(counter));
        let tx: &'static [u8] = b"0123456789";

        let pending = spi.read(buffer::<10>());
        let second = spi.try_launch(Some(tx), None::<NoRx>, 10);
        assert!(matches!(second, Err(Error::Busy)));
        spi.with_port(|usart| assert_eq!(usart.channel(Channel::Tx).arms, 0));

        drop(pending);
        assert!(!spi.is_active());
    }

    #[test]
    fn malformed_requests_are_refused() {
        let spi = setup(Usart::new(counter));
        let tx: &'static [u8] = b"0123";

        assert!(matches!(
            spi.try_launch(None::<NoTx>, None::<NoRx>, 4),
            Err(Error::NoBuffers)
        ));
        assert!(matches!(
            spi.try_launch(None::<NoTx>, Some(buffer::<3>()), 3),
            Err(Error::TooShort)
        ));
        assert!(matches!(
            spi.try_launch(Some(tx), None::<NoRx>, 0),
            Err(Error::TooShort)
        ));
        assert!(matches!(
            spi.try_launch(Some(tx), None::<NoRx>, 10),
            Err(Error::BufferTooSmall)
        ));
        assert!(matches!(
            spi.try_launch(Some(tx), Some(buffer::<2>()), 4),
            Err(Error::BufferTooSmall)
        ));

        assert!(!spi.is_active());
        spi.with_port(|usart| {
            assert_eq!(usart.channel(Channel::Tx).arms, 0);
            assert_eq!(usart.channel(Channel::Rx).arms, 0);
        });
    }

    #[test]
    fn shortest_auto_tx_read_is_one_past_the_tail() {
        let spi = setup(Usart::new(counter));

        let (_, rx) = spi.read(buffer::<4>()).wait();

        assert_eq!(*rx.unwrap(), [0x40, 0x41, 0x42, 0x43]);
        spi.with_port(|usart| assert_eq!(usart.channel(Channel::Rx).transferred, 1));
    }

    #[test]
    #[should_panic]
    fn read_shorter_than_the_tail_panics() {
        let spi = setup(Usart::new(counter));
        let _ = spi.read(buffer::<2>());
    }

    #[test]
    fn stray_events_leave_an_idle_driver_alone() {
        let spi = setup(Usart::new(counter));

        spi.dispatch(Event::TxComplete);
        spi.dispatch(Event::DmaComplete(Channel::Tx));
        spi.dispatch(Event::DmaComplete(Channel::Rx));
        spi.dispatch(Event::RxData);

        assert_eq!(spi.flags(), TransferFlags::IDLE);
        assert_eq!(spi.phase(), Phase::Idle);
        spi.with_port(|usart| assert!(!usart.any_source_enabled()));
    }

    #[test]
    fn free_returns_the_port_when_idle() {
        let spi = SpiDma::new(Usart::new(counter));
        let usart = spi.free();
        assert_eq!(usart.wakeups(), 0);
    }

    #[test]
    #[should_panic]
    fn free_with_a_transfer_in_flight_panics() {
        let spi = SpiDma::new(Usart::new(counter));
        let tx: &'static [u8] = b"abcd";
        core::mem::forget(spi.write(tx));
        let _ = spi.free();
    }
}
