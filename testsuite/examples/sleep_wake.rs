//! Receiver muting: `sleep` drops the rest of a line, `wake` restarts capture at once.

#![no_std]
#![no_main]

use cortex_m_rt::exception;
use cortex_m_semihosting::hprintln;
use testsuite::{USART, entry, exit_failure, exit_success};
use usart_bus::hal::Usart;

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

    let Some(buf) = cortex_m::singleton!(: [u8; 8] = [0; 8]) else {
        exit_failure();
    };
    if bus.recv(buf).is_err() {
        exit_failure();
    }

    testsuite::feed(b"no");
    bus.sleep();
    hprintln!(
        "rx status: {:?}, muted: {}",
        bus.rx_status(),
        USART.is_muted()
    );

    testsuite::feed(b"ignored");
    testsuite::idle_line();
    hprintln!(
        "rx status: {:?}, muted: {}",
        bus.rx_status(),
        USART.is_muted()
    );

    if bus.wake().is_err() {
        exit_failure();
    }
    hprintln!("rx status: {:?} ({} bytes)", bus.rx_status(), bus.rx_size());
    hprintln!("take while receiving: {}", bus.take_rx_buffer().is_some());
    hprintln!("wake while receiving: {:?}", bus.wake());

    testsuite::feed(b"yes");
    testsuite::idle_line();
    bus.rx_wait();
    hprintln!("rx status: {:?} ({} bytes)", bus.rx_status(), bus.rx_size());

    let Some(buf) = bus.take_rx_buffer() else {
        exit_failure();
    };
    match core::str::from_utf8(&buf[..bus.rx_size()]) {
        Ok(text) => hprintln!("received: {}", text),
        Err(_) => exit_failure(),
    }

    // Nothing parked any more: waking only unmutes.
    bus.sleep();
    hprintln!("wake: {:?}", bus.wake());
    hprintln!(
        "rx status: {:?}, muted: {}",
        bus.rx_status(),
        USART.is_muted()
    );
    exit_success();
}
