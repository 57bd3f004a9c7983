//! Chained transfers: the callback arms the next transfer from interrupt context.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicUsize, Ordering};

use cortex_m_rt::exception;
use cortex_m_semihosting::hprintln;
use testsuite::{entry, exit_failure, exit_success};
use usart_bus::Status;

static CHUNKS: [&[u8]; 3] = [b"one ", b"two ", b"three\n"];
static NEXT_CHUNK: AtomicUsize = AtomicUsize::new(1);
static LINES: AtomicUsize = AtomicUsize::new(0);

fn on_event() -> bool {
    let Some(bus) = testsuite::bus() else {
        return false;
    };

    if bus.tx_status() == Status::Transferred {
        let next = NEXT_CHUNK.load(Ordering::Relaxed);
        if let Some(&chunk) = CHUNKS.get(next) {
            if bus.send(chunk).is_ok() {
                NEXT_CHUNK.store(next + 1, Ordering::Relaxed);
            }
        }
    }

    if bus.rx_status() == Status::Transferred {
        if let Some(buf) = bus.take_rx_buffer() {
            LINES.fetch_add(1, Ordering::Relaxed);
            match core::str::from_utf8(&buf[..bus.rx_size()]) {
                Ok(line) => hprintln!("line: {}", line),
                Err(_) => hprintln!("line: not utf-8"),
            }
            if bus.recv(buf).is_err() {
                hprintln!("re-arm failed");
            }
        }
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

    if bus.send(CHUNKS[0]).is_err() {
        exit_failure();
    }
    let mut frames = 0;
    while testsuite::drain_tx() > 0 {
        frames += 1;
    }
    hprintln!("frames: {}, tx status: {:?}", frames, bus.tx_status());

    let Some(buf) = cortex_m::singleton!(: [u8; 16] = [0; 16]) else {
        exit_failure();
    };
    if bus.recv(buf).is_err() {
        exit_failure();
    }
    for line in [&b"first"[..], b"second", b"third"] {
        testsuite::feed(line);
        testsuite::idle_line();
    }
    hprintln!(
        "lines: {}, rx status: {:?}",
        LINES.load(Ordering::Relaxed),
        bus.rx_status()
    );
    exit_success();
}
