use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::slice;

use critical_section::Mutex;

#[cfg(feature = "async-await")]
use crate::atomic_waker::AtomicWaker;
use crate::hal::{Direction, DmaChannel, DmaEvents, DmaRequest, Usart, UsartInterrupts};
use crate::state::{Channel, Fault, Status, TransferId};

/// Completion and error notification, shared by both directions.
///
/// Runs in interrupt context after the direction's state has been updated. The return value
/// tells the owner's own dispatch whether the event was handled; the bus ignores it.
pub type Callback = fn() -> bool;

/// Per-byte receive notification. Runs in interrupt context.
pub type RxCallback = fn(u8) -> bool;

/// Error returned by [`UsartBus::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitError {
    /// The USART enable bit is clear.
    PeripheralDisabled,
    /// The rx and tx DMA references name the same channel.
    SharedDmaChannel,
}

/// Error returned by the transfer control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A transfer is armed on the channel.
    Busy,
    /// The buffer is empty or longer than the DMA channel can count.
    InvalidSize,
}

/// A refused [`UsartBus::recv`], handing the buffer back.
#[derive(Debug, PartialEq, Eq)]
pub struct Rejected<'d> {
    /// Why the call was refused.
    pub error: Error,
    /// The buffer passed to `recv`.
    pub buf: &'d mut [u8],
}

/// Hardware bound to a bus.
///
/// The peripheral and both channels must already be clocked, pin-routed and configured for the
/// frame format.
pub struct Config<'d, U, RX, TX> {
    /// The USART peripheral.
    pub usart: &'d U,
    /// DMA channel serving the peripheral's receive request.
    pub dma_rx: &'d RX,
    /// DMA channel serving the peripheral's transmit request.
    pub dma_tx: &'d TX,
}

/// The receive buffer parked in the bus while the DMA channel may write to it.
#[derive(Clone, Copy)]
struct RxBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: `RxBuffer` stands for a `&'d mut [u8]` moved into the bus, which is `Send`. It is only
// turned back into a slice by `take_rx_buffer`, inside a critical section, once.
unsafe impl Send for RxBuffer {}

impl RxBuffer {
    fn new(buf: &mut [u8]) -> Self {
        Self {
            ptr: NonNull::from(&mut *buf).cast(),
            len: buf.len(),
        }
    }
}

/// One USART with a DMA channel per direction.
///
/// All methods take `&self`: the bus is meant to live in a `static` shared by foreground code
/// and the interrupt handlers ([`irq_handler`](UsartBus::irq_handler),
/// [`dma_rx_channel_irq_handler`](UsartBus::dma_rx_channel_irq_handler) and
/// [`dma_tx_channel_irq_handler`](UsartBus::dma_tx_channel_irq_handler)), which the owner routes
/// from its vector table.
///
/// Each direction has at most one transfer in flight. Direction state is only changed inside
/// critical sections, so foreground code never observes a half-done transition. Callbacks run
/// outside of them and may start the next transfer.
///
/// Buffers passed to [`send`](UsartBus::send) and [`recv`](UsartBus::recv) are borrowed for
/// `'d`, the lifetime of the hardware references. Dropping the bus stops both DMA channels;
/// leaking it with [`core::mem::forget`] while a transfer is armed leaves the DMA engine with
/// the buffer address and must be avoided.
pub struct UsartBus<'d, U: Usart, RX: DmaChannel, TX: DmaChannel> {
    pub(crate) usart: &'d U,
    pub(crate) dma_rx: &'d RX,
    pub(crate) dma_tx: &'d TX,
    callback: Mutex<Cell<Option<Callback>>>,
    rx_callback: Mutex<Cell<Option<RxCallback>>>,
    pub(crate) rx: Mutex<Cell<Channel>>,
    pub(crate) tx: Mutex<Cell<Channel>>,
    rx_buffer: Mutex<Cell<Option<RxBuffer>>>,
    #[cfg(feature = "async-await")]
    pub(crate) rx_waker: AtomicWaker,
    #[cfg(feature = "async-await")]
    pub(crate) tx_waker: AtomicWaker,
    _buffers: PhantomData<&'d mut [u8]>,
}

impl<'d, U: Usart, RX: DmaChannel, TX: DmaChannel> UsartBus<'d, U, RX, TX> {
    /// Binds the bus to its hardware and enables the USART interrupts it relies on.
    ///
    /// Idle-line, parity and error interrupts are enabled on the peripheral. DMA channel
    /// interrupts are enabled per transfer. Both directions start idle, unlocked and with
    /// [`TransferId::DEFAULT`].
    ///
    /// Call this before unmasking the USART and DMA interrupts.
    ///
    /// # Errors
    ///
    /// - [`InitError::PeripheralDisabled`]: the USART is not enabled.
    /// - [`InitError::SharedDmaChannel`]: `dma_rx` and `dma_tx` are the same channel.
    pub fn new(config: Config<'d, U, RX, TX>) -> Result<Self, InitError> {
        let Config {
            usart,
            dma_rx,
            dma_tx,
        } = config;

        if !usart.is_enabled() {
            return Err(InitError::PeripheralDisabled);
        }
        // Zero-sized handles carry no address, so they cannot be told apart here.
        if size_of::<RX>() != 0
            && size_of::<TX>() != 0
            && ptr::addr_eq(ptr::from_ref(dma_rx), ptr::from_ref(dma_tx))
        {
            return Err(InitError::SharedDmaChannel);
        }

        dma_rx.disable();
        dma_rx.clear_events(DmaEvents::all());
        dma_tx.disable();
        dma_tx.clear_events(DmaEvents::all());
        usart.set_interrupts(
            UsartInterrupts::IDLE | UsartInterrupts::ERROR | UsartInterrupts::PARITY,
            true,
        );
        debug!("usart bus initialized");

        Ok(Self {
            usart,
            dma_rx,
            dma_tx,
            callback: Mutex::new(Cell::new(None)),
            rx_callback: Mutex::new(Cell::new(None)),
            rx: Mutex::new(Cell::new(Channel::new())),
            tx: Mutex::new(Cell::new(Channel::new())),
            rx_buffer: Mutex::new(Cell::new(None)),
            #[cfg(feature = "async-await")]
            rx_waker: AtomicWaker::new(),
            #[cfg(feature = "async-await")]
            tx_waker: AtomicWaker::new(),
            _buffers: PhantomData,
        })
    }

    /// Starts transmitting `data`.
    ///
    /// Returns as soon as the tx DMA channel is armed. Completion is reported through
    /// [`tx_status`](Self::tx_status), [`tx_wait`](Self::tx_wait) and the callback.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`]: `data` is empty or longer than `TX::MAX_TRANSFER`.
    /// - [`Error::Busy`]: a transmission is in flight. Nothing is changed.
    pub fn send(&self, data: &'d [u8]) -> Result<(), Error> {
        check_size::<TX>(data.len())?;

        critical_section::with(|cs| {
            let cell = self.tx.borrow(cs);
            let mut tx = cell.get();
            if tx.locked {
                return Err(Error::Busy);
            }

            self.dma_tx.disable();
            self.dma_tx.clear_events(DmaEvents::all());
            // SAFETY: `data` is borrowed for `'d`, which outlives the bus, and the channel is
            // disabled before the bus goes away (handlers or `Drop`).
            unsafe {
                self.dma_tx.configure(DmaRequest {
                    peripheral: self.usart.data_address(),
                    memory: data.as_ptr().expose_provenance(),
                    len: data.len(),
                    direction: Direction::MemoryToPeripheral,
                })
            };
            self.dma_tx
                .set_interrupts(DmaEvents::COMPLETE | DmaEvents::ERROR, true);

            tx.start(data.len());
            cell.set(tx);

            self.usart.set_tx_dma(true);
            self.usart.set_transmitter(true);
            self.dma_tx.enable();
            Ok(())
        })?;

        trace!("tx armed: {=usize} bytes", data.len());
        Ok(())
    }

    /// Directs the next received bytes, up to `buf.len()`, into `buf`.
    ///
    /// The transfer ends when `buf` is full or, earlier, at the next idle line; in the latter
    /// case [`rx_size`](Self::rx_size) reports how many bytes arrived. The buffer stays parked in
    /// the bus until [`take_rx_buffer`](Self::take_rx_buffer) is called, replacing any buffer
    /// parked by an earlier `recv`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSize`]: `buf` is empty or longer than `RX::MAX_TRANSFER`.
    /// - [`Error::Busy`]: a reception is in flight. Nothing is changed.
    ///
    /// The buffer is handed back in [`Rejected`] in both cases.
    pub fn recv(&self, buf: &'d mut [u8]) -> Result<(), Rejected<'d>> {
        if let Err(error) = check_size::<RX>(buf.len()) {
            return Err(Rejected { error, buf });
        }

        let len = buf.len();
        critical_section::with(|cs| {
            let cell = self.rx.borrow(cs);
            let mut rx = cell.get();
            if rx.locked {
                return Err(Rejected {
                    error: Error::Busy,
                    buf,
                });
            }

            let buffer = RxBuffer::new(buf);
            self.rx_buffer.borrow(cs).set(Some(buffer));
            self.arm_rx(buffer);

            rx.start(len);
            cell.set(rx);
            Ok(())
        })?;

        trace!("rx armed: {=usize} bytes", len);
        Ok(())
    }

    /// Discards the rest of the current line.
    ///
    /// Stops any reception and mutes the receiver. The hardware unmutes at the next idle line,
    /// so the bytes up to it are dropped. The rx direction is left idle and unlocked; the buffer
    /// of the last [`recv`](Self::recv) stays parked for [`wake`](Self::wake) or
    /// [`take_rx_buffer`](Self::take_rx_buffer).
    ///
    /// A task awaiting [`rx_done`](Self::rx_done) on the stopped reception is woken and sees
    /// [`Status::Idle`].
    pub fn sleep(&self) {
        let was_receiving = critical_section::with(|cs| {
            self.stop_rx();
            self.usart.set_mute(true);

            let cell = self.rx.borrow(cs);
            let mut rx = cell.get();
            let was_receiving = rx.status.is_busy();
            rx.release();
            cell.set(rx);
            was_receiving
        });
        debug!("rx muted until idle line");

        #[cfg(feature = "async-await")]
        if was_receiving {
            self.rx_waker.wake();
        }
        #[cfg(not(feature = "async-await"))]
        let _ = was_receiving;
    }

    /// Starts capturing with the very next received byte, without waiting for an idle line.
    ///
    /// Unmutes the receiver. If a buffer is parked from an earlier [`recv`](Self::recv), capture
    /// restarts at its first byte and the rx direction becomes transferring and locked.
    /// Without a parked buffer the receiver is only unmuted.
    ///
    /// The parked buffer is reused as is: data of a finished reception that was not taken with
    /// [`take_rx_buffer`](Self::take_rx_buffer) is overwritten by the new capture. Take it first
    /// if it is still needed.
    ///
    /// # Errors
    ///
    /// - [`Error::Busy`]: a reception is in flight. Nothing is changed.
    pub fn wake(&self) -> Result<(), Error> {
        critical_section::with(|cs| {
            let cell = self.rx.borrow(cs);
            let mut rx = cell.get();
            if rx.locked {
                return Err(Error::Busy);
            }

            self.usart.set_mute(false);
            if let Some(buffer) = self.rx_buffer.borrow(cs).get() {
                self.arm_rx(buffer);
                rx.start(buffer.len);
                cell.set(rx);
            }
            Ok(())
        })?;

        debug!("rx awake");
        Ok(())
    }

    /// Hands back the buffer of the last [`recv`](Self::recv).
    ///
    /// Returns `None` while reception is in flight or if no buffer is parked.
    pub fn take_rx_buffer(&self) -> Option<&'d mut [u8]> {
        critical_section::with(|cs| {
            if self.rx.borrow(cs).get().locked {
                return None;
            }
            let buffer = self.rx_buffer.borrow(cs).take()?;
            // SAFETY: the buffer came from a `&'d mut [u8]` given to `recv` or `wake`, the rx
            // channel is unlocked so the DMA channel no longer writes to it, and taking it out of
            // the slot ensures only one slice is rebuilt.
            Some(unsafe { slice::from_raw_parts_mut(buffer.ptr.as_ptr(), buffer.len) })
        })
    }

    /// Status of the receive direction.
    #[inline]
    pub fn rx_status(&self) -> Status {
        self.rx_state().status
    }

    /// Status of the transmit direction.
    #[inline]
    pub fn tx_status(&self) -> Status {
        self.tx_state().status
    }

    /// Fault of the last reception, if it ended in [`Status::Error`].
    #[inline]
    pub fn rx_error(&self) -> Option<Fault> {
        self.rx_status().fault()
    }

    /// Fault of the last transmission, if it ended in [`Status::Error`].
    #[inline]
    pub fn tx_error(&self) -> Option<Fault> {
        self.tx_status().fault()
    }

    /// Returns `true` while a reception is in flight.
    #[inline]
    pub fn rx_busy(&self) -> bool {
        self.rx_status().is_busy()
    }

    /// Returns `true` while a transmission is in flight.
    #[inline]
    pub fn tx_busy(&self) -> bool {
        self.tx_status().is_busy()
    }

    /// Size of the current reception, or the number of bytes received once it completed.
    #[inline]
    pub fn rx_size(&self) -> usize {
        self.rx_state().size
    }

    /// Size of the current or last transmission.
    #[inline]
    pub fn tx_size(&self) -> usize {
        self.tx_state().size
    }

    /// Spins until the reception is no longer in flight.
    ///
    /// There is no timeout. Never call this from an interrupt handler: the interrupt ending the
    /// transfer could be held off by it.
    pub fn rx_wait(&self) {
        while self.rx_busy() {
            core::hint::spin_loop();
        }
    }

    /// Spins until the transmission is no longer in flight.
    ///
    /// There is no timeout. Never call this from an interrupt handler.
    pub fn tx_wait(&self) {
        while self.tx_busy() {
            core::hint::spin_loop();
        }
    }

    /// Waits until the reception is no longer in flight and returns its status.
    #[cfg(feature = "async-await")]
    pub async fn rx_done(&self) -> Status {
        core::future::poll_fn(|cx| {
            self.rx_waker.register(cx.waker());

            match self.rx_status() {
                Status::Transferring => core::task::Poll::Pending,
                status => core::task::Poll::Ready(status),
            }
        })
        .await
    }

    /// Waits until the transmission is no longer in flight and returns its status.
    #[cfg(feature = "async-await")]
    pub async fn tx_done(&self) -> Status {
        core::future::poll_fn(|cx| {
            self.tx_waker.register(cx.waker());

            match self.tx_status() {
                Status::Transferring => core::task::Poll::Pending,
                status => core::task::Poll::Ready(status),
            }
        })
        .await
    }

    /// Identifier of the current or next reception.
    #[inline]
    pub fn rx_transfer_id(&self) -> TransferId {
        self.rx_state().id
    }

    /// Claims the next reception for `id`.
    ///
    /// Returns `false`, keeping the previous identifier, while a reception is in flight.
    pub fn set_rx_transfer_id(&self, id: TransferId) -> bool {
        critical_section::with(|cs| {
            let cell = self.rx.borrow(cs);
            let mut rx = cell.get();
            let claimed = rx.set_id(id);
            cell.set(rx);
            claimed
        })
    }

    /// Identifier of the current or next transmission.
    #[inline]
    pub fn tx_transfer_id(&self) -> TransferId {
        self.tx_state().id
    }

    /// Claims the next transmission for `id`.
    ///
    /// Returns `false`, keeping the previous identifier, while a transmission is in flight.
    pub fn set_tx_transfer_id(&self, id: TransferId) -> bool {
        critical_section::with(|cs| {
            let cell = self.tx.borrow(cs);
            let mut tx = cell.get();
            let claimed = tx.set_id(id);
            cell.set(tx);
            claimed
        })
    }

    /// The completion and error callback.
    pub fn callback(&self) -> Option<Callback> {
        critical_section::with(|cs| self.callback.borrow(cs).get())
    }

    /// Replaces the completion and error callback.
    pub fn set_callback(&self, callback: Option<Callback>) {
        critical_section::with(|cs| self.callback.borrow(cs).set(callback));
    }

    /// The per-byte receive callback.
    pub fn rx_callback(&self) -> Option<RxCallback> {
        critical_section::with(|cs| self.rx_callback.borrow(cs).get())
    }

    /// Replaces the per-byte receive callback.
    ///
    /// The peripheral's receive interrupt is enabled while a callback is registered.
    pub fn set_rx_callback(&self, callback: Option<RxCallback>) {
        critical_section::with(|cs| {
            self.rx_callback.borrow(cs).set(callback);
            self.usart
                .set_interrupts(UsartInterrupts::RX_NOT_EMPTY, callback.is_some());
        });
    }

    /// Returns `true` if the peripheral's transmitter is enabled.
    pub fn transmitter_state(&self) -> bool {
        self.usart.transmitter_enabled()
    }

    /// Returns `true` if the peripheral's receiver is enabled.
    pub fn receiver_state(&self) -> bool {
        self.usart.receiver_enabled()
    }

    /// Returns `true` if the peripheral is configured for half-duplex operation.
    ///
    /// The bus does not arbitrate between a transmission and a reception on a half-duplex
    /// line; turnaround timing is up to the protocol above.
    pub fn halfduplex_state(&self) -> bool {
        self.usart.half_duplex()
    }

    #[inline]
    pub(crate) fn rx_state(&self) -> Channel {
        critical_section::with(|cs| self.rx.borrow(cs).get())
    }

    #[inline]
    pub(crate) fn tx_state(&self) -> Channel {
        critical_section::with(|cs| self.tx.borrow(cs).get())
    }

    /// Points the rx DMA channel at the start of `buffer` and enables reception.
    fn arm_rx(&self, buffer: RxBuffer) {
        self.dma_rx.disable();
        self.dma_rx.clear_events(DmaEvents::all());
        // SAFETY: the buffer was moved into the bus as `&'d mut [u8]`, which outlives the bus.
        // It is only handed back by `take_rx_buffer` once the channel is unlocked, which implies
        // the channel has been disabled, and `Drop` disables the channel too.
        unsafe {
            self.dma_rx.configure(DmaRequest {
                peripheral: self.usart.data_address(),
                memory: buffer.ptr.as_ptr().expose_provenance(),
                len: buffer.len,
                direction: Direction::PeripheralToMemory,
            })
        };
        self.dma_rx
            .set_interrupts(DmaEvents::COMPLETE | DmaEvents::ERROR, true);

        self.usart.set_rx_dma(true);
        self.usart.set_receiver(true);
        self.dma_rx.enable();
    }

    /// Disables the rx DMA channel and drops its pending events.
    pub(crate) fn stop_rx(&self) {
        self.dma_rx.disable();
        self.dma_rx
            .set_interrupts(DmaEvents::COMPLETE | DmaEvents::ERROR, false);
        self.dma_rx.clear_events(DmaEvents::all());
        self.usart.set_rx_dma(false);
    }

    /// Disables the tx DMA channel and drops its pending events.
    pub(crate) fn stop_tx(&self) {
        self.dma_tx.disable();
        self.dma_tx
            .set_interrupts(DmaEvents::COMPLETE | DmaEvents::ERROR, false);
        self.dma_tx.clear_events(DmaEvents::all());
        self.usart.set_tx_dma(false);
    }
}

impl<U: Usart, RX: DmaChannel, TX: DmaChannel> Drop for UsartBus<'_, U, RX, TX> {
    fn drop(&mut self) {
        // The DMA channels hold addresses of buffers borrowed for `'d`.
        self.stop_rx();
        self.stop_tx();
        self.usart.set_interrupts(UsartInterrupts::all(), false);
    }
}

fn check_size<D: DmaChannel>(len: usize) -> Result<(), Error> {
    if len == 0 || len > D::MAX_TRANSFER {
        return Err(Error::InvalidSize);
    }
    Ok(())
}
