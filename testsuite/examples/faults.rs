//! Fault paths: line and DMA errors end transfers, stale DMA events are refused, and both
//! directions recover with the next transfer.

#![no_std]
#![no_main]

use cortex_m_rt::exception;
use cortex_m_semihosting::hprintln;
use testsuite::{DMA_RX, DMA_TX, entry, exit_failure, exit_success};
use usart_bus::hal::{DmaChannel, DmaEvents, UsartFlags};

static FRAME: [u8; 5] = *b"ping\n";

/// Prints the state the callback observes, which is final before it runs.
fn on_event() -> bool {
    if let Some(bus) = testsuite::bus() {
        hprintln!(
            "callback: rx {:?}, tx {:?}",
            bus.rx_status(),
            bus.tx_status()
        );
    }
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

    let Some(buf) = cortex_m::singleton!(: [u8; 8] = [0; 8]) else {
        exit_failure();
    };
    if bus.recv(buf).is_err() {
        exit_failure();
    }

    testsuite::feed(b"a");
    testsuite::inject(UsartFlags::OVERRUN);
    bus.rx_wait();
    hprintln!("rx error: {:?}", bus.rx_error());

    // Not receiving: cleared without a callback.
    testsuite::inject(UsartFlags::FRAMING_ERROR);
    hprintln!("rx status: {:?}", bus.rx_status());

    let Some(buf) = bus.take_rx_buffer() else {
        exit_failure();
    };
    if bus.recv(buf).is_err() {
        exit_failure();
    }
    hprintln!("rx status: {:?}", bus.rx_status());

    DMA_RX.raise(DmaEvents::ERROR);
    testsuite::raise_interrupts();

    if bus.send(&FRAME).is_err() {
        exit_failure();
    }
    DMA_TX.raise(DmaEvents::ERROR);
    testsuite::raise_interrupts();
    hprintln!("tx error: {:?}", bus.tx_error());

    // A completion flag with no transfer behind it.
    DMA_TX.raise(DmaEvents::COMPLETE);
    testsuite::pend_dma();
    hprintln!("tx events cleared: {}", DMA_TX.events().is_empty());

    hprintln!("resend: {:?}", bus.send(&FRAME));
    testsuite::drain_tx();
    bus.tx_wait();
    hprintln!("tx status: {:?}", bus.tx_status());
    exit_success();
}
