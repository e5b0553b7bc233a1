//! Bookkeeping for the one transfer in flight.
//!
//! Everything here is plain data mutated by [`SpiDma`](crate::SpiDma) inside
//! its critical section; nothing touches hardware.

use core::ptr::NonNull;

/// Liveness of the two halves of the current transfer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferFlags {
    pub tx_active: bool,
    pub rx_active: bool,
}

impl TransferFlags {
    pub const IDLE: Self = Self {
        tx_active: false,
        rx_active: false,
    };

    /// True while either half is still running.
    pub const fn is_active(&self) -> bool {
        self.tx_active || self.rx_active
    }
}

/// Tail-capture progress of an auto-transmit transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    /// No tail capture pending.
    Idle,
    /// RX channel exhausted, waiting for the transmit pipeline to drain.
    WaitDrain,
    /// Collecting the last bytes one interrupt at a time.
    WaitBytes { remaining: usize },
}

/// Start of the receive buffer, kept for the tail capture.
#[derive(Clone, Copy)]
pub(crate) struct RxTarget(NonNull<u8>);

// SAFETY: the pointer is only dereferenced inside the driver's critical
// section while the owning `Transfer` keeps the buffer alive.
unsafe impl Send for RxTarget {}

impl RxTarget {
    pub(crate) fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }
}

/// What the RX channel completion means for the transfer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RxDone {
    /// Receive side finished.
    Finished,
    /// Auto-transmit: start watching for the pipeline to drain.
    WatchDrain,
    /// Nothing was waiting on the RX channel.
    Unexpected,
}

/// Result of storing one tail byte.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Capture {
    Stored,
    /// Last byte stored; both flags are clear.
    Done,
    /// No tail capture was pending.
    Unexpected,
}

pub(crate) struct State {
    flags: TransferFlags,
    auto_tx: bool,
    phase: Phase,
    len: usize,
    rx: Option<RxTarget>,
}

impl State {
    pub(crate) const fn new() -> Self {
        Self {
            flags: TransferFlags::IDLE,
            auto_tx: false,
            phase: Phase::Idle,
            len: 0,
            rx: None,
        }
    }

    pub(crate) fn flags(&self) -> TransferFlags {
        self.flags
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn auto_tx(&self) -> bool {
        self.auto_tx
    }

    pub(crate) fn start(&mut self, auto_tx: bool, rx: Option<RxTarget>, len: usize) {
        self.auto_tx = auto_tx;
        self.len = len;
        self.rx = rx;
        self.phase = Phase::Idle;
        self.flags = TransferFlags {
            tx_active: true,
            rx_active: rx.is_some(),
        };
    }

    /// TX channel exhausted. Returns false if the completion was not
    /// expected (auto-transmit never arms the TX channel).
    pub(crate) fn tx_done(&mut self) -> bool {
        if self.auto_tx || !self.flags.tx_active {
            return false;
        }
        self.flags.tx_active = false;
        true
    }

    pub(crate) fn rx_done(&mut self) -> RxDone {
        if !self.flags.rx_active {
            return RxDone::Unexpected;
        }
        if !self.auto_tx {
            self.flags.rx_active = false;
            return RxDone::Finished;
        }
        match self.phase {
            Phase::Idle => {
                self.phase = Phase::WaitDrain;
                RxDone::WatchDrain
            }
            _ => RxDone::Unexpected,
        }
    }

    /// Transmit pipeline drained. Returns false unless a drain was awaited.
    pub(crate) fn drained(&mut self, tail_len: usize) -> bool {
        if self.phase != Phase::WaitDrain {
            return false;
        }
        self.phase = Phase::WaitBytes {
            remaining: tail_len,
        };
        true
    }

    pub(crate) fn capture(&mut self, byte: u8) -> Capture {
        // Auto-transmit transfers always carry a receive buffer.
        let (remaining, rx) = match (self.phase, self.rx) {
            (Phase::WaitBytes { remaining }, Some(rx)) if remaining > 0 => (remaining, rx),
            _ => return Capture::Unexpected,
        };

        // SAFETY: `len` was checked against the buffer length at launch and
        // the buffer outlives the transfer.
        unsafe { rx.0.as_ptr().add(self.len - remaining).write_volatile(byte) };

        let remaining = remaining - 1;
        if remaining == 0 {
            self.phase = Phase::Idle;
            self.flags = TransferFlags::IDLE;
            self.rx = None;
            Capture::Done
        } else {
            self.phase = Phase::WaitBytes { remaining };
            Capture::Stored
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_duplex_needs_both_completions_in_any_order() {
        let mut buf = [0u8; 4];
        let mut state = State::new();

        state.start(false, RxTarget::new(buf.as_mut_ptr()), 4);
        assert_eq!(state.rx_done(), RxDone::Finished);
        assert!(state.flags().is_active());
        assert!(state.tx_done());
        assert_eq!(state.flags(), TransferFlags::IDLE);

        state.start(false, RxTarget::new(buf.as_mut_ptr()), 4);
        assert!(state.tx_done());
        assert!(state.flags().is_active());
        assert_eq!(state.rx_done(), RxDone::Finished);
        assert!(!state.flags().is_active());
        assert_eq!(state.phase(), Phase::Idle);
    }

    #[test]
    fn tx_only_leaves_rx_inactive() {
        let mut state = State::new();
        state.start(false, None, 10);
        assert_eq!(
            state.flags(),
            TransferFlags {
                tx_active: true,
                rx_active: false
            }
        );
        assert_eq!(state.rx_done(), RxDone::Unexpected);
        assert!(state.tx_done());
        assert!(!state.flags().is_active());
    }

    #[test]
    fn auto_tx_walks_drain_then_bytes() {
        let mut buf = [0u8; 6];
        let mut state = State::new();
        state.start(true, RxTarget::new(buf.as_mut_ptr()), 6);

        assert!(!state.tx_done());
        assert!(!state.drained(3));
        assert_eq!(state.rx_done(), RxDone::WatchDrain);
        assert_eq!(state.phase(), Phase::WaitDrain);
        assert!(state.flags().is_active());

        assert!(state.drained(3));
        assert_eq!(state.phase(), Phase::WaitBytes { remaining: 3 });
        assert_eq!(state.capture(0xA3), Capture::Stored);
        assert_eq!(state.capture(0xA4), Capture::Stored);
        assert!(state.flags().is_active());
        assert_eq!(state.capture(0xA5), Capture::Done);

        assert_eq!(state.flags(), TransferFlags::IDLE);
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(buf, [0, 0, 0, 0xA3, 0xA4, 0xA5]);
    }

    #[test]
    fn capture_outside_tail_phase_is_rejected() {
        let mut buf = [0u8; 6];
        let mut state = State::new();
        assert_eq!(state.capture(1), Capture::Unexpected);

        state.start(true, RxTarget::new(buf.as_mut_ptr()), 6);
        assert_eq!(state.capture(1), Capture::Unexpected);
        assert_eq!(buf, [0; 6]);
    }

    #[test]
    fn tail_capture_needs_a_receive_buffer() {
        let mut state = State::new();
        state.start(true, None, 6);
        assert_eq!(state.rx_done(), RxDone::Unexpected);
        assert!(!state.drained(3));
        assert_eq!(state.capture(1), Capture::Unexpected);
    }

    #[test]
    fn restart_does_not_carry_the_tail_counter() {
        let mut buf = [0u8; 5];
        let mut state = State::new();
        state.start(true, RxTarget::new(buf.as_mut_ptr()), 5);
        state.rx_done();
        state.drained(3);
        state.capture(1);

        state.start(true, RxTarget::new(buf.as_mut_ptr()), 5);
        assert_eq!(state.phase(), Phase::Idle);
        assert!(!state.drained(3));
    }
}
