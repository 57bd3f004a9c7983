//! Interrupt handlers.
//!
//! The owner calls these from its vector table: [`UsartBus::irq_handler`] from the USART
//! interrupt, the DMA handlers from the interrupts of the two channels. Every flag a handler
//! looks at is cleared before it returns, otherwise the interrupt would fire again immediately.

use core::cell::Cell;

use critical_section::Mutex;

use crate::UsartBus;
use crate::hal::{DmaChannel, DmaEvents, Usart, UsartFlags};
use crate::state::{Channel, Fault, Status};

/// The fault reported for a set of error flags. Parity wins over noise, over overrun, over
/// framing.
fn fault(flags: UsartFlags) -> Option<Fault> {
    if flags.contains(UsartFlags::PARITY_ERROR) {
        Some(Fault::Parity)
    } else if flags.contains(UsartFlags::NOISE) {
        Some(Fault::Noise)
    } else if flags.contains(UsartFlags::OVERRUN) {
        Some(Fault::Overrun)
    } else if flags.contains(UsartFlags::FRAMING_ERROR) {
        Some(Fault::Framing)
    } else {
        None
    }
}

impl<U: Usart, RX: DmaChannel, TX: DmaChannel> UsartBus<'_, U, RX, TX> {
    /// USART interrupt handler.
    ///
    /// In order:
    /// 1. A line fault (parity, noise, overrun, framing) ends an active reception with
    ///    [`Status::Error`].
    /// 2. An idle line ends an active reception early with [`Status::Transferred`];
    ///    [`rx_size`](Self::rx_size) then holds the number of bytes received.
    /// 3. A received byte is handed to the rx callback, whether or not a reception is active.
    ///
    /// A line fault seen while no reception is active has no transfer to end: its flags are
    /// cleared and it is logged at `warn`, but [`rx_status`](Self::rx_status) keeps its value
    /// and the callback is not invoked.
    ///
    /// The callback is invoked after each state change, outside of the critical section.
    pub fn irq_handler(&self) {
        let flags = self.usart.flags();

        if let Some(fault) = fault(flags) {
            self.usart.clear_flags(flags & UsartFlags::ERRORS);

            let failed = critical_section::with(|cs| {
                let cell = self.rx.borrow(cs);
                let mut rx = cell.get();
                if !rx.status.is_busy() {
                    return false;
                }
                self.stop_rx();
                rx.fail(fault);
                cell.set(rx);
                true
            });

            if failed {
                warn!("rx fault: {}", fault);
                self.notify_rx();
            } else {
                warn!("line fault while not receiving: {}", fault);
            }
        }

        if flags.contains(UsartFlags::IDLE) {
            self.usart.clear_flags(UsartFlags::IDLE);

            let received = critical_section::with(|cs| {
                let cell = self.rx.borrow(cs);
                let mut rx = cell.get();
                if !rx.status.is_busy() {
                    return None;
                }
                let received = rx.size.saturating_sub(self.dma_rx.remaining());
                // An idle line left over from before the transfer was armed.
                if received == 0 {
                    return None;
                }
                self.stop_rx();
                rx.complete(received);
                cell.set(rx);
                Some(received)
            });

            if let Some(received) = received {
                trace!("rx idle after {=usize} bytes", received);
                self.notify_rx();
            }
        }

        // Fault clearing may have consumed the data register, so look again.
        if self.usart.flags().contains(UsartFlags::RX_NOT_EMPTY) {
            if let Some(on_byte) = self.rx_callback() {
                let _handled = on_byte(self.usart.read_data());
            }
        }
    }

    /// Interrupt handler for the rx DMA channel.
    ///
    /// Returns `false` if the channel has no completion or error pending for this bus, so a
    /// shared interrupt line can be offered to the next bus. Stale flags on a channel without an
    /// armed transfer are cleared as well.
    pub fn dma_rx_channel_irq_handler(&self) -> bool {
        let Some(status) = dma_channel_event(self.dma_rx, &self.rx, || self.stop_rx()) else {
            return false;
        };

        match status {
            Status::Error(_) => warn!("rx dma error"),
            _ => trace!("rx dma complete"),
        }
        self.notify_rx();
        true
    }

    /// Interrupt handler for the tx DMA channel.
    ///
    /// Same contract as [`dma_rx_channel_irq_handler`](Self::dma_rx_channel_irq_handler).
    pub fn dma_tx_channel_irq_handler(&self) -> bool {
        let Some(status) = dma_channel_event(self.dma_tx, &self.tx, || self.stop_tx()) else {
            return false;
        };

        match status {
            Status::Error(_) => warn!("tx dma error"),
            _ => trace!("tx dma complete"),
        }
        self.notify_tx();
        true
    }

    fn notify_rx(&self) {
        self.notify();
        #[cfg(feature = "async-await")]
        self.rx_waker.wake();
    }

    fn notify_tx(&self) {
        self.notify();
        #[cfg(feature = "async-await")]
        self.tx_waker.wake();
    }

    fn notify(&self) {
        if let Some(callback) = self.callback() {
            let _handled = callback();
        }
    }
}

/// Settles a DMA channel event against the direction it serves.
///
/// Returns the new status, or `None` if the event does not belong to an armed transfer.
fn dma_channel_event<D: DmaChannel>(
    dma: &D,
    channel: &Mutex<Cell<Channel>>,
    stop: impl FnOnce(),
) -> Option<Status> {
    // Sampling the events and checking the lock must not be split by a completion from a
    // nested handler, or a stale event would settle the next transfer.
    critical_section::with(|cs| {
        let events = dma.events();
        if !events.intersects(DmaEvents::COMPLETE | DmaEvents::ERROR) {
            return None;
        }
        dma.clear_events(events);

        let cell = channel.borrow(cs);
        let mut state = cell.get();
        if !state.locked {
            warn!("dma events {} without a transfer", events);
            return None;
        }
        stop();
        if events.contains(DmaEvents::ERROR) {
            state.fail(Fault::Dma);
        } else {
            state.complete(state.size);
        }
        cell.set(state);
        Some(state.status)
    })
}

#[cfg(test)]
mod test {
    extern crate std;

    use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
    use std::sync::OnceLock;

    use super::*;
    use crate::sim::{SimDma, SimUsart};
    use crate::{Config, TransferId};

    type SimBus = UsartBus<'static, SimUsart, SimDma, SimDma>;

    fn bus<'d>(
        usart: &'d SimUsart,
        dma_rx: &'d SimDma,
        dma_tx: &'d SimDma,
    ) -> UsartBus<'d, SimUsart, SimDma, SimDma> {
        UsartBus::new(Config {
            usart,
            dma_rx,
            dma_tx,
        })
        .unwrap()
    }

    /// Runs the USART handler as long as the simulated peripheral requests it.
    fn service_usart(usart: &SimUsart, bus: &UsartBus<'_, SimUsart, SimDma, SimDma>) {
        while usart.pending() {
            bus.irq_handler();
        }
    }

    #[test]
    fn fault_priority() {
        assert_eq!(fault(UsartFlags::empty()), None);
        assert_eq!(fault(UsartFlags::IDLE), None);
        assert_eq!(fault(UsartFlags::FRAMING_ERROR), Some(Fault::Framing));
        assert_eq!(
            fault(UsartFlags::FRAMING_ERROR | UsartFlags::OVERRUN),
            Some(Fault::Overrun)
        );
        assert_eq!(
            fault(UsartFlags::OVERRUN | UsartFlags::NOISE),
            Some(Fault::Noise)
        );
        assert_eq!(fault(UsartFlags::ERRORS), Some(Fault::Parity));
    }

    #[test]
    fn send_completes_and_unlocks() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn on_event() -> bool {
            CALLS.fetch_add(1, Ordering::Relaxed);
            true
        }

        let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let data: [u8; 16] = core::array::from_fn(|i| i as u8);
        let again = [0xEE; 3];
        let bus = bus(&usart, &dma_rx, &dma_tx);
        bus.set_callback(Some(on_event));

        assert_eq!(bus.send(&data), Ok(()));
        assert_eq!(bus.tx_status(), Status::Transferring);
        assert!(bus.tx_busy());
        assert_eq!(bus.send(&data), Err(crate::Error::Busy));

        let mut wire = [0; 32];
        assert_eq!(usart.transmit(&dma_tx, &mut wire), 16);
        assert_eq!(&wire[..16], &data);
        assert!(dma_tx.pending());

        assert!(bus.dma_tx_channel_irq_handler());
        assert_eq!(bus.tx_status(), Status::Transferred);
        assert!(!bus.tx_busy());
        assert_eq!(bus.tx_size(), 16);
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
        assert!(!dma_tx.pending());
        assert!(!dma_tx.is_enabled());

        // Unlocked: the next transfer is accepted.
        assert_eq!(bus.send(&again), Ok(()));
        assert_eq!(bus.tx_status(), Status::Transferring);
        assert_eq!(usart.transmit(&dma_tx, &mut wire), 3);
        assert_eq!(&wire[..3], &again);
    }

    #[test]
    fn recv_ends_early_on_idle_line() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn on_event() -> bool {
            CALLS.fetch_add(1, Ordering::Relaxed);
            true
        }

        let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let mut buf = [0; 8];
        let bus = bus(&usart, &dma_rx, &dma_tx);
        bus.set_callback(Some(on_event));

        bus.recv(&mut buf).unwrap();
        for byte in b"hello" {
            usart.receive(*byte, &dma_rx);
        }
        assert!(!usart.pending());
        assert!(bus.rx_busy());

        usart.line_idle();
        assert!(usart.pending());
        bus.irq_handler();

        assert!(!usart.pending());
        assert_eq!(bus.rx_status(), Status::Transferred);
        assert_eq!(bus.rx_size(), 5);
        assert!(!bus.rx_state().locked);
        assert!(!dma_rx.is_enabled());
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);

        // Nothing left for the DMA handler.
        assert!(!bus.dma_rx_channel_irq_handler());
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);

        let buf = bus.take_rx_buffer().unwrap();
        assert_eq!(&buf[..bus.rx_size()], b"hello");
    }

    #[test]
    fn recv_completes_when_buffer_fills() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn on_event() -> bool {
            CALLS.fetch_add(1, Ordering::Relaxed);
            true
        }

        let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let mut buf = [0; 4];
        let bus = bus(&usart, &dma_rx, &dma_tx);
        bus.set_callback(Some(on_event));

        bus.recv(&mut buf).unwrap();
        for byte in [1, 2, 3, 4] {
            usart.receive(byte, &dma_rx);
        }
        assert!(dma_rx.pending());
        assert!(bus.dma_rx_channel_irq_handler());
        assert_eq!(bus.rx_status(), Status::Transferred);
        assert_eq!(bus.rx_size(), 4);

        // The idle line after a full buffer finds nothing to finish.
        usart.line_idle();
        service_usart(&usart, &bus);
        assert_eq!(bus.rx_status(), Status::Transferred);
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
        assert_eq!(bus.take_rx_buffer(), Some(&mut [1, 2, 3, 4][..]));
    }

    #[test]
    fn idle_line_and_full_buffer_complete_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn on_event() -> bool {
            CALLS.fetch_add(1, Ordering::Relaxed);
            true
        }

        let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let mut buf = [0; 2];
        let bus = bus(&usart, &dma_rx, &dma_tx);
        bus.set_callback(Some(on_event));

        bus.recv(&mut buf).unwrap();
        usart.receive(0xA0, &dma_rx);
        usart.receive(0xA1, &dma_rx);
        usart.line_idle();

        // The USART interrupt wins the race against the DMA interrupt.
        bus.irq_handler();
        assert!(!bus.dma_rx_channel_irq_handler());
        assert_eq!(bus.rx_status(), Status::Transferred);
        assert_eq!(bus.rx_size(), 2);
        assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    }

    /// rx DMA channel that hands the CPU to another context the first time its events are
    /// sampled, standing in for a higher priority interrupt arriving at that moment.
    struct PreemptedDma {
        inner: SimDma,
        armed: AtomicBool,
        preempt: AtomicBool,
    }

    impl DmaChannel for PreemptedDma {
        unsafe fn configure(&self, request: crate::hal::DmaRequest) {
            // SAFETY: forwarded with the caller's guarantees.
            unsafe { self.inner.configure(request) }
        }

        fn enable(&self) {
            self.inner.enable();
        }

        fn disable(&self) {
            self.inner.disable();
        }

        fn is_enabled(&self) -> bool {
            self.inner.is_enabled()
        }

        fn remaining(&self) -> usize {
            self.inner.remaining()
        }

        fn events(&self) -> DmaEvents {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.preempt.store(true, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            self.inner.events()
        }

        fn clear_events(&self, events: DmaEvents) {
            self.inner.clear_events(events);
        }

        fn set_interrupts(&self, events: DmaEvents, enabled: bool) {
            self.inner.set_interrupts(events, enabled);
        }
    }

    static NESTED_BUS: OnceLock<UsartBus<'static, SimUsart, PreemptedDma, SimDma>> =
        OnceLock::new();
    static NESTED_CALLS: AtomicUsize = AtomicUsize::new(0);
    static NESTED_REARMED: AtomicBool = AtomicBool::new(false);
    static mut NESTED_NEXT: [u8; 4] = [0; 4];

    #[test]
    fn nested_idle_line_does_not_complete_next_reception() {
        static USART: SimUsart = SimUsart::new();
        static DMA_RX: PreemptedDma = PreemptedDma {
            inner: SimDma::new(),
            armed: AtomicBool::new(false),
            preempt: AtomicBool::new(false),
        };
        static DMA_TX: SimDma = SimDma::new();
        static mut FIRST: [u8; 2] = [0; 2];

        fn on_event() -> bool {
            NESTED_CALLS.fetch_add(1, Ordering::SeqCst);
            let bus = NESTED_BUS.get().unwrap();
            if bus.rx_status() == Status::Transferred && !NESTED_REARMED.swap(true, Ordering::SeqCst)
            {
                // SAFETY: armed once, only this test touches `NESTED_NEXT`.
                bus.recv(unsafe { &mut *(&raw mut NESTED_NEXT) }).unwrap();
            }
            true
        }

        let bus = NESTED_BUS.get_or_init(|| {
            UsartBus::new(Config {
                usart: &USART,
                dma_rx: &DMA_RX,
                dma_tx: &DMA_TX,
            })
            .unwrap()
        });
        bus.set_callback(Some(on_event));

        // SAFETY: only this test touches `FIRST`.
        bus.recv(unsafe { &mut *(&raw mut FIRST) }).unwrap();
        USART.receive(1, &DMA_RX.inner);
        USART.receive(2, &DMA_RX.inner);
        USART.line_idle();
        assert!(DMA_RX.inner.pending());
        assert!(USART.pending());

        // The buffer filled and the line went idle: both interrupts fire, and the USART one
        // lands while the DMA handler is running.
        DMA_RX.armed.store(true, Ordering::SeqCst);
        let handled = std::thread::scope(|s| {
            s.spawn(|| {
                while !DMA_RX.preempt.load(Ordering::SeqCst) {
                    std::thread::yield_now();
                }
                bus.irq_handler();
            });
            bus.dma_rx_channel_irq_handler()
        });

        assert!(handled);
        assert_eq!(NESTED_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(bus.rx_status(), Status::Transferring);
        assert_eq!(bus.rx_size(), 4);
        assert!(DMA_RX.is_enabled());
        assert_eq!(DMA_RX.remaining(), 4);
    }

    #[test]
    fn stale_idle_line_does_not_end_reception() {
        let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let mut buf = [0; 4];
        let bus = bus(&usart, &dma_rx, &dma_tx);

        usart.raise(UsartFlags::IDLE);
        bus.recv(&mut buf).unwrap();
        bus.irq_handler();

        assert!(!usart.pending());
        assert_eq!(bus.rx_status(), Status::Transferring);
        assert!(bus.rx_state().locked);
    }

    static OVERRUN_BUS: OnceLock<SimBus> = OnceLock::new();
    static OVERRUN_SEEN: AtomicU8 = AtomicU8::new(0);

    #[test]
    fn overrun_fails_reception_before_callback() {
        static USART: SimUsart = SimUsart::new();
        static DMA_RX: SimDma = SimDma::new();
        static DMA_TX: SimDma = SimDma::new();
        static mut BUF: [u8; 8] = [0; 8];

        fn on_event() -> bool {
            let bus = OVERRUN_BUS.get().unwrap();
            // The state is final before the callback runs.
            let seen = match (bus.rx_status(), bus.rx_state().locked) {
                (Status::Error(Fault::Overrun), false) => 1,
                _ => 2,
            };
            OVERRUN_SEEN.store(seen, Ordering::Relaxed);
            true
        }

        let bus = OVERRUN_BUS.get_or_init(|| bus(&USART, &DMA_RX, &DMA_TX));
        bus.set_callback(Some(on_event));

        // SAFETY: only this test touches `BUF`.
        bus.recv(unsafe { &mut *(&raw mut BUF) }).unwrap();
        USART.receive(1, &DMA_RX);
        USART.raise(UsartFlags::OVERRUN);
        assert!(USART.pending());
        bus.irq_handler();

        assert!(!USART.pending());
        assert_eq!(OVERRUN_SEEN.load(Ordering::Relaxed), 1);
        assert_eq!(bus.rx_status(), Status::Error(Fault::Overrun));
        assert_eq!(bus.rx_error(), Some(Fault::Overrun));
        assert!(!bus.rx_busy());
        assert!(!DMA_RX.is_enabled());

        // The fault does not stick: a fresh reception is accepted.
        let buf = bus.take_rx_buffer().unwrap();
        bus.recv(buf).unwrap();
        assert_eq!(bus.rx_status(), Status::Transferring);
        assert_eq!(bus.rx_error(), None);
    }

    #[test]
    fn line_faults_map_to_errors() {
        for (flag, expected) in [
            (UsartFlags::PARITY_ERROR, Fault::Parity),
            (UsartFlags::NOISE, Fault::Noise),
            (UsartFlags::FRAMING_ERROR, Fault::Framing),
        ] {
            let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
            let mut buf = [0; 4];
            let bus = bus(&usart, &dma_rx, &dma_tx);

            bus.recv(&mut buf).unwrap();
            usart.raise(flag);
            service_usart(&usart, &bus);

            assert_eq!(bus.rx_status(), Status::Error(expected));
            assert!(!bus.rx_state().locked);
            assert!(usart.flags().is_empty());
        }
    }

    #[test]
    fn line_fault_while_idle_is_cleared_only() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn on_event() -> bool {
            CALLS.fetch_add(1, Ordering::Relaxed);
            true
        }

        let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let bus = bus(&usart, &dma_rx, &dma_tx);
        bus.set_callback(Some(on_event));

        usart.raise(UsartFlags::FRAMING_ERROR);
        bus.irq_handler();

        assert!(!usart.pending());
        assert_eq!(bus.rx_status(), Status::Idle);
        assert_eq!(CALLS.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn dma_error_fails_transfer() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn on_event() -> bool {
            CALLS.fetch_add(1, Ordering::Relaxed);
            true
        }

        let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let data = [3; 6];
        let mut buf = [0; 6];
        let bus = bus(&usart, &dma_rx, &dma_tx);
        bus.set_callback(Some(on_event));

        bus.send(&data).unwrap();
        dma_tx.raise(DmaEvents::ERROR);
        assert!(bus.dma_tx_channel_irq_handler());
        assert_eq!(bus.tx_status(), Status::Error(Fault::Dma));
        assert_eq!(bus.tx_error(), Some(Fault::Dma));
        assert!(!bus.tx_state().locked);

        bus.recv(&mut buf).unwrap();
        dma_rx.raise(DmaEvents::ERROR | DmaEvents::COMPLETE);
        assert!(bus.dma_rx_channel_irq_handler());
        assert_eq!(bus.rx_status(), Status::Error(Fault::Dma));
        assert_eq!(CALLS.load(Ordering::Relaxed), 2);

        // Recovery.
        assert_eq!(bus.send(&data), Ok(()));
        assert_eq!(bus.tx_error(), None);
    }

    #[test]
    fn dma_handlers_report_foreign_interrupts() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn on_event() -> bool {
            CALLS.fetch_add(1, Ordering::Relaxed);
            true
        }

        let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let data = [0; 4];
        let bus = bus(&usart, &dma_rx, &dma_tx);
        bus.set_callback(Some(on_event));

        // Nothing flagged.
        assert!(!bus.dma_rx_channel_irq_handler());
        assert!(!bus.dma_tx_channel_irq_handler());

        // A half-transfer event is not ours to handle.
        bus.send(&data).unwrap();
        dma_tx.raise(DmaEvents::HALF);
        assert!(!bus.dma_tx_channel_irq_handler());
        assert!(bus.tx_busy());

        // Stale flags on an unarmed channel are drained.
        dma_rx.raise(DmaEvents::COMPLETE);
        assert!(!bus.dma_rx_channel_irq_handler());
        assert!(dma_rx.events().is_empty());
        assert_eq!(bus.rx_status(), Status::Idle);
        assert_eq!(CALLS.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn shared_dma_line_dispatch() {
        let (usart_a, rx_a, tx_a) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let (usart_b, rx_b, tx_b) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let data = [0x42; 2];
        let a = bus(&usart_a, &rx_a, &tx_a);
        let b = bus(&usart_b, &rx_b, &tx_b);

        a.send(&data).unwrap();
        b.send(&data).unwrap();
        let mut wire = [0; 2];
        usart_b.transmit(&tx_b, &mut wire);

        // One interrupt line for all four channels.
        let handled = [
            a.dma_rx_channel_irq_handler(),
            a.dma_tx_channel_irq_handler(),
            b.dma_rx_channel_irq_handler(),
            b.dma_tx_channel_irq_handler(),
        ];
        assert_eq!(handled, [false, false, false, true]);
        assert_eq!(a.tx_status(), Status::Transferring);
        assert_eq!(b.tx_status(), Status::Transferred);
    }

    #[test]
    fn rx_callback_sees_every_byte() {
        static LAST: AtomicU8 = AtomicU8::new(0);
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        fn on_byte(byte: u8) -> bool {
            LAST.store(byte, Ordering::Relaxed);
            COUNT.fetch_add(1, Ordering::Relaxed);
            true
        }

        let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let bus = bus(&usart, &dma_rx, &dma_tx);
        usart.set_receiver(true);
        bus.set_rx_callback(Some(on_byte));

        for byte in [0x10, 0x20, 0x30] {
            usart.receive(byte, &dma_rx);
            assert!(usart.pending());
            bus.irq_handler();
            assert_eq!(LAST.load(Ordering::Relaxed), byte);
        }
        assert_eq!(COUNT.load(Ordering::Relaxed), 3);
        assert_eq!(bus.rx_status(), Status::Idle);
    }

    #[test]
    fn unread_byte_overruns_without_reception() {
        let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let bus = bus(&usart, &dma_rx, &dma_tx);
        usart.set_receiver(true);

        usart.receive(1, &dma_rx);
        usart.receive(2, &dma_rx);
        assert!(usart.flags().contains(UsartFlags::OVERRUN));

        bus.irq_handler();
        assert!(!usart.flags().intersects(UsartFlags::ERRORS));
        assert_eq!(bus.rx_status(), Status::Idle);
    }

    static REARM_BUS: OnceLock<SimBus> = OnceLock::new();
    static REARM_DATA: [u8; 3] = [7, 8, 9];

    #[test]
    fn callback_rearms_next_send() {
        static USART: SimUsart = SimUsart::new();
        static DMA_RX: SimDma = SimDma::new();
        static DMA_TX: SimDma = SimDma::new();
        static SENT: AtomicUsize = AtomicUsize::new(0);

        fn on_event() -> bool {
            let bus = REARM_BUS.get().unwrap();
            if bus.tx_status() == Status::Transferred && SENT.fetch_add(1, Ordering::Relaxed) < 2
            {
                bus.set_tx_transfer_id(TransferId(SENT.load(Ordering::Relaxed) as u8));
                bus.send(&REARM_DATA).unwrap();
            }
            true
        }

        let bus = REARM_BUS.get_or_init(|| bus(&USART, &DMA_RX, &DMA_TX));
        bus.set_callback(Some(on_event));
        bus.send(&REARM_DATA).unwrap();

        let mut wire = [0; 3];
        let mut frames = 0;
        while bus.tx_busy() {
            assert_eq!(USART.transmit(&DMA_TX, &mut wire), 3);
            assert_eq!(wire, REARM_DATA);
            assert!(bus.dma_tx_channel_irq_handler());
            frames += 1;
        }

        assert_eq!(frames, 3);
        assert_eq!(bus.tx_transfer_id(), TransferId(2));
        assert_eq!(bus.tx_status(), Status::Transferred);
    }

    #[test]
    fn tx_wait_returns_after_completion_in_other_context() {
        let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let data = [1; 5];
        let bus = bus(&usart, &dma_rx, &dma_tx);

        bus.send(&data).unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                let mut wire = [0; 5];
                while usart.transmit(&dma_tx, &mut wire) == 0 {
                    std::thread::yield_now();
                }
                assert!(bus.dma_tx_channel_irq_handler());
            });
            bus.tx_wait();
        });

        assert_eq!(bus.tx_status(), Status::Transferred);
    }

    #[test]
    fn rx_wait_returns_after_fault() {
        let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let mut buf = [0; 5];
        let bus = bus(&usart, &dma_rx, &dma_tx);

        bus.recv(&mut buf).unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                usart.raise(UsartFlags::NOISE);
                bus.irq_handler();
            });
            bus.rx_wait();
        });

        assert_eq!(bus.rx_error(), Some(Fault::Noise));
    }

    #[cfg(feature = "async-await")]
    #[test]
    fn tx_done_resolves_after_interrupt() {
        use core::future::Future;
        use core::pin::pin;
        use core::task::{Context, Poll, Waker};

        let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let data = [4; 4];
        let bus = bus(&usart, &dma_rx, &dma_tx);
        let mut cx = Context::from_waker(Waker::noop());

        bus.send(&data).unwrap();
        let mut done = pin!(bus.tx_done());
        assert_eq!(done.as_mut().poll(&mut cx), Poll::Pending);

        let mut wire = [0; 4];
        usart.transmit(&dma_tx, &mut wire);
        assert!(bus.dma_tx_channel_irq_handler());
        assert_eq!(
            done.as_mut().poll(&mut cx),
            Poll::Ready(Status::Transferred)
        );
    }

    #[cfg(feature = "async-await")]
    #[test]
    fn rx_done_reports_fault() {
        use core::future::Future;
        use core::pin::pin;
        use core::task::{Context, Poll, Waker};

        let (usart, dma_rx, dma_tx) = (SimUsart::new(), SimDma::new(), SimDma::new());
        let mut buf = [0; 4];
        let bus = bus(&usart, &dma_rx, &dma_tx);
        let mut cx = Context::from_waker(Waker::noop());

        bus.recv(&mut buf).unwrap();
        let mut done = pin!(bus.rx_done());
        assert_eq!(done.as_mut().poll(&mut cx), Poll::Pending);

        dma_rx.raise(DmaEvents::ERROR);
        assert!(bus.dma_rx_channel_irq_handler());
        assert_eq!(
            done.as_mut().poll(&mut cx),
            Poll::Ready(Status::Error(Fault::Dma))
        );
    }
}
