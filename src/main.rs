#![no_std]
#![no_main]

use autotx_spi::rp::{on_dma_interrupt, on_spi_interrupt, Pl022Port};
use autotx_spi::SpiDma;
use defmt::{info, unwrap};
use embassy_executor::Spawner;
use embassy_rp::gpio::{Level, Output};
use embassy_rp::interrupt;
use embassy_rp::spi::{Config, Spi};
use embassy_time::Timer;
use {defmt_rtt as _, panic_probe as _};

static SPI: SpiDma<Pl022Port> = SpiDma::new(Pl022Port::new());

const MESSAGE: &[u8] = b"Hello World! This is Pico!";
const LEN: usize = 10;

#[interrupt]
fn DMA_IRQ_1() {
    on_dma_interrupt(&SPI);
}

#[interrupt]
fn SPI0_IRQ() {
    on_spi_interrupt(&SPI);
}

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    info!("DMA SPI Example Starting");

    let p = embassy_rp::init(Default::default());

    let mut config = Config::default();
    config.frequency = 1_000_000;

    // Blocking mode only configures clocks, pins and frame format; the data
    // path is driven by the port's own DMA channels. Keep it alive for good.
    let spi = Spi::new_blocking(p.SPI0, p.PIN_2, p.PIN_3, p.PIN_4, config);
    core::mem::forget(spi);
    let mut cs = Output::new(p.PIN_5, Level::High);

    SPI.with_port(|port| port.init());

    let mut rx_a: &'static mut [u8; LEN] = unwrap!(cortex_m::singleton!(: [u8; LEN] = [0; LEN]));
    let mut rx_b: &'static mut [u8; LEN] = unwrap!(cortex_m::singleton!(: [u8; LEN] = [0; LEN]));
    let tx: &'static [u8] = &MESSAGE[..LEN];

    loop {
        info!("Running");

        cs.set_low();
        let _ = SPI.write(tx).wait();
        // The TX channel is done before the FIFO has drained.
        SPI.flush();
        cs.set_high();
        info!("Sent: {=[u8]:a}", tx);

        cs.set_low();
        let (_, rx) = SPI.transfer(tx, rx_a).wait();
        cs.set_high();
        rx_a = unwrap!(rx);
        info!("Full duplex received: {=[u8]:x}", &rx_a[..]);

        cs.set_low();
        let (_, rx) = SPI.read(rx_a).wait();
        cs.set_high();
        rx_a = unwrap!(rx);

        cs.set_low();
        let (_, rx) = SPI.read(rx_b).wait();
        cs.set_high();
        rx_b = unwrap!(rx);

        info!("Read 1: {=[u8]:x}", &rx_a[..]);
        info!("Read 2: {=[u8]:x}", &rx_b[..]);

        Timer::after_millis(1000).await;
    }
}
