//! Transmit path: arm, refuse while busy, complete from the DMA interrupt, re-arm.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicUsize, Ordering};

use cortex_m_rt::exception;
use cortex_m_semihosting::hprintln;
use testsuite::{entry, exit_failure, exit_success};
use usart_bus::TransferId;

static EVENTS: AtomicUsize = AtomicUsize::new(0);

static FRAME: [u8; 16] = *b"usart-bus frame\n";
static TAIL: [u8; 4] = *b"end\n";

fn on_event() -> bool {
    EVENTS.fetch_add(1, Ordering::Relaxed);
    true
}

#[exception]
fn PendSV() {
    testsuite::usart_interrupt();
}

#[exception]
fn SysTick() {
    testsuite::dma_interrupt();
}

#[entry]
fn main() -> ! {
    let bus = testsuite::init_bus();
    bus.set_callback(Some(on_event));

    hprintln!("tx status: {:?}", bus.tx_status());
    hprintln!("set id: {}", bus.set_tx_transfer_id(TransferId(1)));

    if let Err(e) = bus.send(&FRAME) {
        hprintln!("send failed: {:?}", e);
        exit_failure();
    }
    hprintln!("tx status: {:?} ({} bytes)", bus.tx_status(), bus.tx_size());
    hprintln!("second send: {:?}", bus.send(&TAIL));
    hprintln!("set id while busy: {}", bus.set_tx_transfer_id(TransferId(2)));
    hprintln!("transmitter enabled: {}", bus.transmitter_state());

    let sent = testsuite::drain_tx();
    bus.tx_wait();
    hprintln!("wire: {} bytes", sent);
    hprintln!(
        "tx status: {:?}, id {}, events {}",
        bus.tx_status(),
        bus.tx_transfer_id().0,
        EVENTS.load(Ordering::Relaxed)
    );

    hprintln!("third send: {:?}", bus.send(&TAIL));
    testsuite::drain_tx();
    bus.tx_wait();
    hprintln!(
        "tx status: {:?}, events {}",
        bus.tx_status(),
        EVENTS.load(Ordering::Relaxed)
    );

    hprintln!("empty send: {:?}", bus.send(&[]));
    exit_success();
}
