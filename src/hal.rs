//! Hardware collaborators of the bus.
//!
//! The driver does not touch registers itself. A board support crate implements [`Usart`] for
//! its serial register block and [`DmaChannel`] for each DMA channel, with clocks, pins, baud
//! rate and frame format already configured.
//!
//! Every method takes `&self`: register blocks are shared between foreground code and several
//! interrupt handlers, so implementations use volatile accesses (as PAC register proxies do).

use bitflags::bitflags;

bitflags! {
    /// Snapshot of the USART status register.
    ///
    /// Bit positions follow the STM32F1 `USART_SR` layout so an implementation can usually
    /// return the raw register value through [`UsartFlags::from_bits_truncate`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsartFlags: u16 {
        /// Parity error (PE).
        const PARITY_ERROR = 1 << 0;
        /// Framing error (FE).
        const FRAMING_ERROR = 1 << 1;
        /// Noise detected (NE).
        const NOISE = 1 << 2;
        /// Overrun error (ORE).
        const OVERRUN = 1 << 3;
        /// Idle line detected (IDLE).
        const IDLE = 1 << 4;
        /// Read data register not empty (RXNE).
        const RX_NOT_EMPTY = 1 << 5;
        /// Transmission complete (TC).
        const TX_COMPLETE = 1 << 6;
        /// Transmit data register empty (TXE).
        const TX_EMPTY = 1 << 7;
    }
}

impl UsartFlags {
    /// All receive fault conditions.
    pub const ERRORS: Self = Self::PARITY_ERROR
        .union(Self::FRAMING_ERROR)
        .union(Self::NOISE)
        .union(Self::OVERRUN);
}

bitflags! {
    /// USART interrupt sources.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsartInterrupts: u8 {
        /// Idle line (IDLEIE).
        const IDLE = 1 << 0;
        /// Framing, noise and overrun errors while DMA receive is active (EIE).
        const ERROR = 1 << 1;
        /// Parity error (PEIE).
        const PARITY = 1 << 2;
        /// Received byte ready (RXNEIE).
        const RX_NOT_EMPTY = 1 << 3;
    }
}

bitflags! {
    /// DMA channel event flags, also used as interrupt enables.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaEvents: u8 {
        /// Transfer complete (TCIF).
        const COMPLETE = 1 << 0;
        /// Half transfer (HTIF).
        const HALF = 1 << 1;
        /// Transfer error (TEIF).
        const ERROR = 1 << 2;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for UsartFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "UsartFlags({=u16:#b})", self.bits())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for DmaEvents {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "DmaEvents({=u8:#b})", self.bits())
    }
}

/// Direction of a DMA transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Peripheral data register to memory (reception).
    PeripheralToMemory,
    /// Memory to peripheral data register (transmission).
    MemoryToPeripheral,
}

/// A one-shot, byte-wide DMA transfer with memory increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmaRequest {
    /// Address of the peripheral data register.
    pub peripheral: usize,
    /// Address of the first memory byte, with exposed provenance.
    pub memory: usize,
    /// Number of bytes to move.
    pub len: usize,
    /// Transfer direction.
    pub direction: Direction,
}

/// A USART peripheral.
pub trait Usart {
    /// Returns `true` if the peripheral is enabled (UE).
    fn is_enabled(&self) -> bool;

    /// Reads the status register.
    fn flags(&self) -> UsartFlags;

    /// Clears `flags` using the documented sequence for the part.
    ///
    /// On STM32F1 the error and idle flags are cleared by a status register read followed by a
    /// data register read.
    fn clear_flags(&self, flags: UsartFlags);

    /// Reads the data register.
    fn read_data(&self) -> u8;

    /// Address of the data register, used as the DMA peripheral address.
    fn data_address(&self) -> usize;

    /// Enables or disables interrupt sources.
    fn set_interrupts(&self, interrupts: UsartInterrupts, enabled: bool);

    /// Enables or disables the transmitter (TE).
    fn set_transmitter(&self, enabled: bool);

    /// Returns `true` if the transmitter is enabled.
    fn transmitter_enabled(&self) -> bool;

    /// Enables or disables the receiver (RE).
    fn set_receiver(&self, enabled: bool);

    /// Returns `true` if the receiver is enabled.
    fn receiver_enabled(&self) -> bool;

    /// Returns `true` if half-duplex mode is selected (HDSEL).
    fn half_duplex(&self) -> bool;

    /// Enters or leaves receiver mute mode (RWU).
    ///
    /// The peripheral must be configured for idle-line wakeup: hardware leaves mute mode by
    /// itself when it detects an idle line.
    fn set_mute(&self, muted: bool);

    /// Returns `true` while the receiver is muted.
    fn is_muted(&self) -> bool;

    /// Enables or disables DMA requests for reception (DMAR).
    fn set_rx_dma(&self, enabled: bool);

    /// Enables or disables DMA requests for transmission (DMAT).
    fn set_tx_dma(&self, enabled: bool);
}

/// A DMA channel wired to a USART request line.
pub trait DmaChannel {
    /// Largest transfer count accepted by [`configure`](DmaChannel::configure).
    const MAX_TRANSFER: usize = u16::MAX as usize;

    /// Programs the channel for `request`. Does not enable it.
    ///
    /// # Safety
    ///
    /// `request.memory` must be valid for `request.len` byte accesses in `request.direction`
    /// until the channel completes, faults, or is disabled.
    unsafe fn configure(&self, request: DmaRequest);

    /// Enables the channel.
    fn enable(&self);

    /// Disables the channel. An active transfer stops at the current position.
    fn disable(&self);

    /// Returns `true` while the channel is enabled.
    fn is_enabled(&self) -> bool;

    /// Number of bytes not yet transferred (CNDTR).
    fn remaining(&self) -> usize;

    /// Reads the channel's event flags.
    fn events(&self) -> DmaEvents;

    /// Clears event flags.
    fn clear_events(&self, events: DmaEvents);

    /// Enables or disables interrupts for events.
    fn set_interrupts(&self, events: DmaEvents, enabled: bool);
}
