//! Per-direction transfer state.

/// Lifecycle of the transfer on one direction of the bus.
///
/// `Transferred` and `Error` are kept until the next transfer is started on the same direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    /// Nothing armed.
    #[default]
    Idle,
    /// A DMA transfer is armed and has not completed yet.
    Transferring,
    /// The last transfer completed.
    Transferred,
    /// The last transfer was terminated by a fault.
    Error(Fault),
}

impl Status {
    /// Returns `true` for [`Status::Transferring`].
    #[inline]
    pub const fn is_busy(self) -> bool {
        matches!(self, Status::Transferring)
    }

    /// The fault that terminated the last transfer, if any.
    #[inline]
    pub const fn fault(self) -> Option<Fault> {
        match self {
            Status::Error(fault) => Some(fault),
            _ => None,
        }
    }
}

/// Hardware condition that terminated a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fault {
    /// Parity error.
    Parity,
    /// Noise detected on the line.
    Noise,
    /// A byte arrived while the receive register was still full.
    Overrun,
    /// Stop bit not found.
    Framing,
    /// The DMA controller reported a transfer error.
    Dma,
}

/// Tag correlating a completion with the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferId(pub u8);

impl TransferId {
    /// No specific owner.
    pub const DEFAULT: Self = Self(0);
}

/// Soft state of one direction.
///
/// Always read and written as a whole inside one critical section, so a concurrent reader sees
/// either the state before or after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Channel {
    pub(crate) status: Status,
    /// Set while the DMA channel is reserved by an armed transfer.
    pub(crate) locked: bool,
    pub(crate) id: TransferId,
    /// Requested size while transferring, actual size once transferred.
    pub(crate) size: usize,
}

impl Channel {
    pub(crate) const fn new() -> Self {
        Self {
            status: Status::Idle,
            locked: false,
            id: TransferId::DEFAULT,
            size: 0,
        }
    }

    /// Reserves the channel for a transfer of `size` bytes.
    ///
    /// Callers check `locked` first; starting over an armed transfer is a logic error.
    pub(crate) fn start(&mut self, size: usize) {
        debug_assert!(!self.locked);
        self.status = Status::Transferring;
        self.locked = true;
        self.size = size;
    }

    /// Marks the armed transfer as completed with `size` bytes moved.
    pub(crate) fn complete(&mut self, size: usize) {
        self.status = Status::Transferred;
        self.locked = false;
        self.size = size;
    }

    /// Marks the armed transfer as terminated by `fault`.
    pub(crate) fn fail(&mut self, fault: Fault) {
        self.status = Status::Error(fault);
        self.locked = false;
    }

    /// Returns the channel to idle without a completion.
    pub(crate) fn release(&mut self) {
        self.status = Status::Idle;
        self.locked = false;
    }

    /// Stores `id` if the channel is not reserved.
    pub(crate) fn set_id(&mut self, id: TransferId) -> bool {
        if self.locked {
            return false;
        }
        self.id = id;
        true
    }
}
