//! Interrupt delivery for host tests.
//!
//! Each test thread acts as one core. `critical_section` is implemented as a
//! per-thread interrupt mask: entering masks, and leaving the outermost
//! section runs the thread's pending handlers, the way a Cortex-M core takes
//! a pending interrupt as soon as PRIMASK is cleared. Handlers therefore never
//! run inside a masked window.

use core::cell::{Cell, RefCell};
use std::boxed::Box;

use crate::sim::Usart;
use crate::SpiDma;

/// Handler invocations per unmask before the test is declared hung.
const STORM_LIMIT: usize = 10_000;

struct HostCriticalSection;
critical_section::set_impl!(HostCriticalSection);

std::thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
    static HANDLER: RefCell<Option<Box<dyn Fn()>>> = const { RefCell::new(None) };
}

unsafe impl critical_section::Impl for HostCriticalSection {
    unsafe fn acquire() -> critical_section::RawRestoreState {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
    }

    unsafe fn release(_restore: critical_section::RawRestoreState) {
        let depth = DEPTH.with(|depth| {
            let left = depth.get() - 1;
            depth.set(left);
            left
        });
        if depth == 0 {
            run_pending();
        }
    }
}

fn run_pending() {
    if IN_HANDLER.with(|flag| flag.replace(true)) {
        return;
    }
    let handler = HANDLER.with(|slot| slot.borrow_mut().take());
    if let Some(handler) = &handler {
        handler();
    }
    HANDLER.with(|slot| *slot.borrow_mut() = handler);
    IN_HANDLER.with(|flag| flag.set(false));
}

/// True while the calling thread has interrupts masked.
pub(crate) fn masked() -> bool {
    DEPTH.with(|depth| depth.get() > 0)
}

/// Route the simulated interrupt lines of `driver`'s port to its handlers on
/// the calling thread.
pub(crate) fn connect(driver: &'static SpiDma<Usart>) {
    HANDLER.with(|slot| {
        *slot.borrow_mut() = Some(Box::new(move || {
            assert!(!masked(), "handler entered with interrupts masked");
            for _ in 0..STORM_LIMIT {
                match driver.with_port(Usart::next_interrupt) {
                    Some(event) => driver.dispatch(event),
                    None => return,
                }
            }
            panic!("interrupt storm: a source was never acknowledged");
        }))
    });
}

/// Leak a driver around a fresh simulator and connect its interrupts.
pub(crate) fn setup(usart: Usart) -> &'static SpiDma<Usart> {
    let driver: &'static SpiDma<Usart> = Box::leak(Box::new(SpiDma::new(usart)));
    connect(driver);
    driver
}

/// Leak a zeroed buffer for use as a DMA target.
pub(crate) fn buffer<const N: usize>() -> &'static mut [u8; N] {
    Box::leak(Box::new([0; N]))
}
