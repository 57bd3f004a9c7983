#![no_std]

pub mod uart;

use core::future::Future;
use core::pin::pin;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use cortex_m::peripheral::SCB;
use cortex_m_semihosting::debug::{self, EXIT_FAILURE, EXIT_SUCCESS};
use cortex_m_semihosting::hprintln;
use panic_semihosting as _;
use usart_bus::hal::UsartFlags;
use usart_bus::sim::{SimDma, SimUsart};
use usart_bus::{Config, UsartBus};

pub use cortex_m_rt::entry;

/// The bus every scenario runs, wired to the simulated peripheral below.
pub type Bus = UsartBus<'static, SimUsart, SimDma, SimDma>;

pub static USART: SimUsart = SimUsart::new();
pub static DMA_RX: SimDma = SimDma::new();
pub static DMA_TX: SimDma = SimDma::new();

static BUS: AtomicPtr<Bus> = AtomicPtr::new(ptr::null_mut());

pub fn exit_success() -> ! {
    debug::exit(EXIT_SUCCESS);
    #[allow(clippy::empty_loop)]
    loop {}
}

pub fn exit_failure() -> ! {
    debug::exit(EXIT_FAILURE);
    #[allow(clippy::empty_loop)]
    loop {}
}

/// Create the bus and publish it to the exception handlers. Call once.
pub fn init_bus() -> &'static Bus {
    let bus: &'static Bus = cortex_m::singleton!(: Bus = match UsartBus::new(Config {
        usart: &USART,
        dma_rx: &DMA_RX,
        dma_tx: &DMA_TX,
    }) {
        Ok(bus) => bus,
        Err(e) => {
            hprintln!("bus init failed: {:?}", e);
            exit_failure();
        }
    })
    .unwrap_or_else(|| exit_failure());

    BUS.store(ptr::from_ref(bus).cast_mut(), Ordering::Release);
    bus
}

/// The bus created by [`init_bus`], if any.
pub fn bus() -> Option<&'static Bus> {
    // SAFETY: only ever set to a `'static` bus by `init_bus`, and only shared references are
    // handed out.
    unsafe { BUS.load(Ordering::Acquire).as_ref() }
}

/// Body of the exception standing in for the USART interrupt (PendSV).
pub fn usart_interrupt() {
    if let Some(bus) = bus() {
        bus.irq_handler();
    }
}

/// Body of the exception standing in for the shared DMA interrupt (SysTick).
pub fn dma_interrupt() {
    if let Some(bus) = bus() {
        let rx = bus.dma_rx_channel_irq_handler();
        let tx = bus.dma_tx_channel_irq_handler();
        if !rx && !tx {
            hprintln!("dma interrupt not handled");
        }
    }
}

/// Pend the USART exception.
pub fn pend_usart() {
    SCB::set_pendsv();
    sync();
}

/// Pend the DMA exception.
pub fn pend_dma() {
    SCB::set_pendst();
    sync();
}

/// Pend the exceptions whose simulated interrupt conditions are flagged, as the NVIC would.
pub fn raise_interrupts() {
    if USART.pending() {
        SCB::set_pendsv();
    }
    if DMA_RX.pending() || DMA_TX.pending() {
        SCB::set_pendst();
    }
    sync();
}

/// Clock `bytes` in from the line.
pub fn feed(bytes: &[u8]) {
    for &byte in bytes {
        USART.receive(byte, &DMA_RX);
        raise_interrupts();
    }
}

/// Hold the line idle for a frame time.
pub fn idle_line() {
    USART.line_idle();
    raise_interrupts();
}

/// Inject status flags, e.g. a line fault.
pub fn inject(flags: UsartFlags) {
    USART.raise(flags);
    raise_interrupts();
}

/// Let the tx DMA channel drain onto the wire, mirroring the bytes to UART0.
pub fn drain_tx() -> usize {
    let mut wire = [0; 64];
    let sent = USART.transmit(&DMA_TX, &mut wire);
    uart::write_bytes(&wire[..sent]);
    raise_interrupts();
    sent
}

/// Make a pended exception take effect before the next instruction.
fn sync() {
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Yield once to allow other tasks to run.
pub async fn yield_once() {
    let mut yielded = false;
    core::future::poll_fn(|_cx| {
        if yielded {
            Poll::Ready(())
        } else {
            yielded = true;
            Poll::Pending
        }
    })
    .await
}

/// Minimal block_on executor for testing.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    let mut fut = pin!(fut);

    // Create a no-op waker.
    const VTABLE: RawWakerVTable = RawWakerVTable::new(
        |_| RawWaker::new(core::ptr::null(), &VTABLE),
        |_| {},
        |_| {},
        |_| {},
    );
    let raw_waker = RawWaker::new(core::ptr::null(), &VTABLE);
    let waker = unsafe { Waker::from_raw(raw_waker) };
    let mut cx = Context::from_waker(&waker);

    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(val) => return val,
            Poll::Pending => {
                cortex_m::asm::nop();
            }
        }
    }
}

/// Join two futures, polling them alternately until both complete.
pub async fn join<A, B, T, U>(a: A, b: B) -> (T, U)
where
    A: Future<Output = T>,
    B: Future<Output = U>,
{
    let mut a = pin!(a);
    let mut b = pin!(b);
    let mut a_done: Option<T> = None;
    let mut b_done: Option<U> = None;

    core::future::poll_fn(|cx| {
        if a_done.is_none() {
            if let Poll::Ready(val) = a.as_mut().poll(cx) {
                a_done = Some(val);
            }
        }
        if b_done.is_none() {
            if let Poll::Ready(val) = b.as_mut().poll(cx) {
                b_done = Some(val);
            }
        }
        match (a_done.take(), b_done.take()) {
            (Some(a), Some(b)) => Poll::Ready((a, b)),
            (a, b) => {
                a_done = a;
                b_done = b;
                Poll::Pending
            }
        }
    })
    .await
}
