//! Receive path: idle-line completion, full-buffer completion and echo.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicUsize, Ordering};

use cortex_m_rt::exception;
use cortex_m_semihosting::hprintln;
use testsuite::{entry, exit_failure, exit_success};

static EVENTS: AtomicUsize = AtomicUsize::new(0);

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

fn print_received(buf: &[u8]) {
    match core::str::from_utf8(buf) {
        Ok(text) => hprintln!("received: {}", text),
        Err(_) => hprintln!("received: {:?}", buf),
    }
}

#[entry]
fn main() -> ! {
    let bus = testsuite::init_bus();
    bus.set_callback(Some(on_event));

    let Some(line) = cortex_m::singleton!(: [u8; 8] = [0; 8]) else {
        exit_failure();
    };
    if let Err(rejected) = bus.recv(line) {
        hprintln!("recv failed: {:?}", rejected.error);
        exit_failure();
    }
    hprintln!("rx status: {:?} ({} bytes)", bus.rx_status(), bus.rx_size());
    hprintln!("receiver enabled: {}", bus.receiver_state());

    testsuite::feed(b"hello");
    hprintln!("rx busy: {}", bus.rx_busy());
    testsuite::idle_line();
    bus.rx_wait();
    hprintln!(
        "rx status: {:?} ({} bytes), events {}",
        bus.rx_status(),
        bus.rx_size(),
        EVENTS.load(Ordering::Relaxed)
    );

    let Some(line) = bus.take_rx_buffer() else {
        exit_failure();
    };
    let line: &'static [u8] = line;
    let echo = &line[..bus.rx_size()];
    print_received(echo);

    // Echo what arrived.
    if bus.send(echo).is_err() {
        exit_failure();
    }
    testsuite::drain_tx();
    bus.tx_wait();

    let Some(word) = cortex_m::singleton!(: [u8; 4] = [0; 4]) else {
        exit_failure();
    };
    if bus.recv(word).is_err() {
        exit_failure();
    }
    testsuite::feed(b"abcd");
    bus.rx_wait();
    hprintln!(
        "rx status: {:?} ({} bytes), events {}",
        bus.rx_status(),
        bus.rx_size(),
        EVENTS.load(Ordering::Relaxed)
    );

    // The idle line after a full buffer completes nothing.
    testsuite::idle_line();
    hprintln!("after idle: events {}", EVENTS.load(Ordering::Relaxed));

    match bus.take_rx_buffer() {
        Some(word) => print_received(word),
        None => exit_failure(),
    }
    exit_success();
}
