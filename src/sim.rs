//! Simulated USART and DMA channel.
//!
//! The simulation keeps register state in atomics and implements the [`hal`](crate::hal)
//! traits, so a [`UsartBus`](crate::UsartBus) can run against it on the host or on a target
//! without the real peripheral. Test code plays the part of the line and of the DMA engine:
//! [`SimUsart::receive`] clocks a byte in, [`SimUsart::line_idle`] ends a frame, and
//! [`SimUsart::transmit`] lets the tx channel drain memory onto the wire.
//!
//! Interrupts are not raised by the simulation. Callers poll [`SimUsart::pending`] and
//! [`SimDma::pending`] and invoke the bus handlers (or pend a real exception that does).

use core::ptr::{with_exposed_provenance, with_exposed_provenance_mut};
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicUsize, Ordering};

use crate::hal::{
    Direction, DmaChannel, DmaEvents, DmaRequest, Usart, UsartFlags, UsartInterrupts,
};

/// Simulated USART register block.
pub struct SimUsart {
    enabled: AtomicBool,
    status: AtomicU16,
    data: AtomicU8,
    interrupts: AtomicU8,
    transmitter: AtomicBool,
    receiver: AtomicBool,
    half_duplex: AtomicBool,
    muted: AtomicBool,
    rx_dma: AtomicBool,
    tx_dma: AtomicBool,
    /// A byte was received since the last idle line.
    framing: AtomicBool,
}

impl SimUsart {
    /// An enabled peripheral with transmitter and receiver off.
    pub const fn new() -> Self {
        Self::with_enable(true)
    }

    /// A peripheral whose enable bit is clear.
    pub const fn disabled() -> Self {
        Self::with_enable(false)
    }

    const fn with_enable(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            status: AtomicU16::new(0),
            data: AtomicU8::new(0),
            interrupts: AtomicU8::new(0),
            transmitter: AtomicBool::new(false),
            receiver: AtomicBool::new(false),
            half_duplex: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            rx_dma: AtomicBool::new(false),
            tx_dma: AtomicBool::new(false),
            framing: AtomicBool::new(false),
        }
    }

    /// Selects half-duplex mode.
    pub fn set_half_duplex(&self, enabled: bool) {
        self.half_duplex.store(enabled, Ordering::Relaxed);
    }

    /// Enabled interrupt sources.
    pub fn interrupts(&self) -> UsartInterrupts {
        UsartInterrupts::from_bits_truncate(self.interrupts.load(Ordering::Relaxed))
    }

    /// Sets status flags, e.g. to inject a line fault.
    pub fn raise(&self, flags: UsartFlags) {
        self.status.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Returns `true` if an enabled interrupt condition is flagged.
    pub fn pending(&self) -> bool {
        let flags = self.flags();
        let irq = self.interrupts();

        (irq.contains(UsartInterrupts::IDLE) && flags.contains(UsartFlags::IDLE))
            || (irq.contains(UsartInterrupts::PARITY) && flags.contains(UsartFlags::PARITY_ERROR))
            || (irq.contains(UsartInterrupts::ERROR)
                && flags.intersects(
                    UsartFlags::FRAMING_ERROR | UsartFlags::NOISE | UsartFlags::OVERRUN,
                ))
            || (irq.contains(UsartInterrupts::RX_NOT_EMPTY)
                && flags.intersects(UsartFlags::RX_NOT_EMPTY | UsartFlags::OVERRUN))
    }

    /// Clocks `byte` in from the line.
    ///
    /// With DMA reception enabled and `dma` armed the byte goes straight to memory. Otherwise it
    /// lands in the data register, overrunning if the previous byte was not read. A muted or
    /// disabled receiver drops the byte.
    pub fn receive(&self, byte: u8, dma: &SimDma) {
        if !self.receiver.load(Ordering::Relaxed) || self.muted.load(Ordering::Relaxed) {
            return;
        }
        self.framing.store(true, Ordering::Relaxed);

        if self.rx_dma.load(Ordering::Relaxed) && dma.push(byte) {
            return;
        }

        if self.flags().contains(UsartFlags::RX_NOT_EMPTY) {
            self.raise(UsartFlags::OVERRUN);
        } else {
            self.data.store(byte, Ordering::Relaxed);
            self.raise(UsartFlags::RX_NOT_EMPTY);
        }
    }

    /// Holds the line idle for a frame time.
    ///
    /// A muted receiver wakes up. Otherwise the idle flag is set if anything was received since
    /// the last idle line.
    pub fn line_idle(&self) {
        if self.muted.swap(false, Ordering::Relaxed) {
            return;
        }
        if self.framing.swap(false, Ordering::Relaxed) {
            self.raise(UsartFlags::IDLE);
        }
    }

    /// Lets `dma` feed the transmitter, copying what goes out on the wire into `wire`.
    ///
    /// Returns the number of bytes sent. Nothing is sent unless the transmitter and DMA
    /// transmission are enabled.
    pub fn transmit(&self, dma: &SimDma, wire: &mut [u8]) -> usize {
        if !self.transmitter.load(Ordering::Relaxed) || !self.tx_dma.load(Ordering::Relaxed) {
            return 0;
        }
        let sent = dma.pull(wire);
        if sent > 0 {
            self.raise(UsartFlags::TX_COMPLETE | UsartFlags::TX_EMPTY);
        }
        sent
    }
}

impl Default for SimUsart {
    fn default() -> Self {
        Self::new()
    }
}

impl Usart for SimUsart {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn flags(&self) -> UsartFlags {
        UsartFlags::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    fn clear_flags(&self, flags: UsartFlags) {
        self.status.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    fn read_data(&self) -> u8 {
        self.clear_flags(UsartFlags::RX_NOT_EMPTY);
        self.data.load(Ordering::Relaxed)
    }

    fn data_address(&self) -> usize {
        self.data.as_ptr().expose_provenance()
    }

    fn set_interrupts(&self, interrupts: UsartInterrupts, enabled: bool) {
        if enabled {
            self.interrupts.fetch_or(interrupts.bits(), Ordering::Relaxed);
        } else {
            self.interrupts.fetch_and(!interrupts.bits(), Ordering::Relaxed);
        }
    }

    fn set_transmitter(&self, enabled: bool) {
        self.transmitter.store(enabled, Ordering::Relaxed);
    }

    fn transmitter_enabled(&self) -> bool {
        self.transmitter.load(Ordering::Relaxed)
    }

    fn set_receiver(&self, enabled: bool) {
        self.receiver.store(enabled, Ordering::Relaxed);
    }

    fn receiver_enabled(&self) -> bool {
        self.receiver.load(Ordering::Relaxed)
    }

    fn half_duplex(&self) -> bool {
        self.half_duplex.load(Ordering::Relaxed)
    }

    fn set_mute(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    fn set_rx_dma(&self, enabled: bool) {
        self.rx_dma.store(enabled, Ordering::Relaxed);
    }

    fn set_tx_dma(&self, enabled: bool) {
        self.tx_dma.store(enabled, Ordering::Relaxed);
    }
}

/// Simulated DMA channel.
pub struct SimDma {
    memory: AtomicUsize,
    len: AtomicUsize,
    to_memory: AtomicBool,
    remaining: AtomicUsize,
    enabled: AtomicBool,
    events: AtomicU8,
    interrupts: AtomicU8,
    configured: AtomicUsize,
}

impl SimDma {
    /// An idle, unconfigured channel.
    pub const fn new() -> Self {
        Self {
            memory: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
            to_memory: AtomicBool::new(false),
            remaining: AtomicUsize::new(0),
            enabled: AtomicBool::new(false),
            events: AtomicU8::new(0),
            interrupts: AtomicU8::new(0),
            configured: AtomicUsize::new(0),
        }
    }

    /// Sets event flags, e.g. to inject a bus error.
    pub fn raise(&self, events: DmaEvents) {
        self.events.fetch_or(events.bits(), Ordering::AcqRel);
    }

    /// Returns `true` if an enabled event is flagged.
    pub fn pending(&self) -> bool {
        self.events().intersects(self.interrupts())
    }

    /// Enabled interrupt events.
    pub fn interrupts(&self) -> DmaEvents {
        DmaEvents::from_bits_truncate(self.interrupts.load(Ordering::Relaxed))
    }

    /// Number of times the channel has been programmed.
    pub fn configured(&self) -> usize {
        self.configured.load(Ordering::Relaxed)
    }

    /// Moves a byte from the peripheral to memory. Returns `false` if the channel does not
    /// accept it.
    fn push(&self, byte: u8) -> bool {
        if !self.accepts(true) {
            return false;
        }
        let offset = self.advance(1);
        let addr = self.memory.load(Ordering::Relaxed) + offset;
        // SAFETY: `addr` is inside the region handed to `configure`, whose contract keeps it
        // valid for writes while the channel is enabled.
        unsafe { with_exposed_provenance_mut::<u8>(addr).write_volatile(byte) };
        self.complete_if_done();
        true
    }

    /// Moves bytes from memory to the peripheral, at most `wire.len()`.
    fn pull(&self, wire: &mut [u8]) -> usize {
        if !self.accepts(false) {
            return 0;
        }
        let count = wire.len().min(self.remaining.load(Ordering::Relaxed));
        let offset = self.advance(count);
        let base = self.memory.load(Ordering::Relaxed) + offset;
        for (i, slot) in wire[..count].iter_mut().enumerate() {
            // SAFETY: `base + i` is inside the region handed to `configure`, whose contract
            // keeps it valid for reads while the channel is enabled.
            *slot = unsafe { with_exposed_provenance::<u8>(base + i).read_volatile() };
        }
        self.complete_if_done();
        count
    }

    fn accepts(&self, to_memory: bool) -> bool {
        self.enabled.load(Ordering::Relaxed)
            && self.to_memory.load(Ordering::Relaxed) == to_memory
            && self.remaining.load(Ordering::Relaxed) > 0
    }

    /// Consumes `count` from the counter and returns the offset of the first byte.
    fn advance(&self, count: usize) -> usize {
        let remaining = self.remaining.fetch_sub(count, Ordering::AcqRel);
        self.len.load(Ordering::Relaxed) - remaining
    }

    fn complete_if_done(&self) {
        if self.remaining.load(Ordering::Acquire) == 0 {
            self.raise(DmaEvents::COMPLETE);
        }
    }
}

impl Default for SimDma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaChannel for SimDma {
    unsafe fn configure(&self, request: DmaRequest) {
        self.memory.store(request.memory, Ordering::Relaxed);
        self.len.store(request.len, Ordering::Relaxed);
        self.remaining.store(request.len, Ordering::Relaxed);
        self.to_memory.store(
            request.direction == Direction::PeripheralToMemory,
            Ordering::Relaxed,
        );
        self.configured.fetch_add(1, Ordering::Relaxed);
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    fn events(&self) -> DmaEvents {
        DmaEvents::from_bits_truncate(self.events.load(Ordering::Acquire))
    }

    fn clear_events(&self, events: DmaEvents) {
        self.events.fetch_and(!events.bits(), Ordering::AcqRel);
    }

    fn set_interrupts(&self, events: DmaEvents, enabled: bool) {
        if enabled {
            self.interrupts.fetch_or(events.bits(), Ordering::Relaxed);
        } else {
            self.interrupts.fetch_and(!events.bits(), Ordering::Relaxed);
        }
    }
}
