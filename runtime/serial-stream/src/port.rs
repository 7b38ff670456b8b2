//! StreamPort - foreground side of a serial transport
//!
//! A [`StreamPort`] is the capability table handed to the line parser and
//! response writer. It reads from the RX ring, writes into the TX ring, and
//! controls the mode flags and hardware configuration. The interrupt side of
//! the same transport is an [`InterruptRouter`](crate::InterruptRouter) over the
//! same [`SerialState`].
//!
//! A few operations move an index owned by the interrupt side (TX flushes move
//! the TX tail, a read cancel moves the RX head). Those run inside a critical
//! section, which keeps the vector out for their duration.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::Mutex;
use log::{debug, info, warn};
use stream_ring::{Consumer, Producer, RingBuffer, DEFAULT_RX_CAPACITY, DEFAULT_TX_CAPACITY};

use crate::hardware::{LineStatus, Platform, SerialHardware};
use crate::interceptor::{Layered, RealtimeInterceptor, PASS_THROUGH};
use crate::{Result, StreamError};

/// ASCII CAN, injected by `cancel_read_buffer` as the cancel marker
pub const ASCII_CAN: u8 = 0x18;

/// Baud rate used when the configuration does not say otherwise
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Kind of transport behind a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StreamType {
    #[default]
    Serial,
    Usb,
    Bluetooth,
    Telnet,
    WebSocket,
}

/// Identity of a stream as reported to transport-agnostic callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub stream_type: StreamType,
    pub connected: bool,
}

/// Per-port configuration injected at initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PortConfig {
    /// Line rate programmed by `init`
    pub baud_rate: u32,

    /// Byte placed in the RX ring by `cancel_read_buffer`
    pub cancel_sentinel: u8,

    /// Priority registered with the interrupt controller (0 = highest)
    pub irq_priority: u8,

    /// Transport kind reported by `descriptor`
    pub stream_type: StreamType,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            cancel_sentinel: ASCII_CAN,
            irq_priority: 0,
            stream_type: StreamType::Serial,
        }
    }
}

/// "May I keep waiting?" policy consulted while the TX ring is full
///
/// Timeouts, watchdog feeding and cooperative scheduling all live in the
/// implementation; the port only asks.
pub trait BlockingWait {
    fn keep_waiting(&self) -> bool;
}

impl<F> BlockingWait for F
where
    F: Fn() -> bool,
{
    fn keep_waiting(&self) -> bool {
        self()
    }
}

/// Wait policy that never blocks: a full TX ring abandons the write
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverWait;

impl BlockingWait for NeverWait {
    fn keep_waiting(&self) -> bool {
        false
    }
}

/// Observable port mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// `init` has not completed
    Uninitialized,
    /// Receiving and queuing normally
    Normal,
    /// Ordinary bytes are discarded, realtime codes still work
    Suspended,
    /// Receive interrupt masked at the peripheral
    Disabled { suspended: bool },
}

/// Shared state of one transport
///
/// Lives for the whole process (typically in a `static`). The RX ring is
/// produced by the interrupt router and consumed by the port; the TX ring the
/// other way round.
pub struct SerialState<const RX: usize = DEFAULT_RX_CAPACITY, const TX: usize = DEFAULT_TX_CAPACITY>
{
    rx: RingBuffer<RX>,
    tx: RingBuffer<TX>,
    suspended: AtomicBool,
    interceptor: Mutex<Cell<&'static dyn RealtimeInterceptor>>,
}

impl<const RX: usize, const TX: usize> SerialState<RX, TX> {
    pub const fn new() -> Self {
        Self {
            rx: RingBuffer::new(),
            tx: RingBuffer::new(),
            suspended: AtomicBool::new(false),
            interceptor: Mutex::new(Cell::new(PASS_THROUGH)),
        }
    }

    /// Receive ring
    pub fn rx(&self) -> &RingBuffer<RX> {
        &self.rx
    }

    /// Transmit ring
    pub fn tx(&self) -> &RingBuffer<TX> {
        &self.tx
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    /// Install a new interceptor, returning the one it replaces
    pub fn swap_interceptor(
        &self,
        handler: &'static dyn RealtimeInterceptor,
    ) -> &'static dyn RealtimeInterceptor {
        critical_section::with(|cs| self.interceptor.borrow(cs).replace(handler))
    }

    /// Link `layer` to the current interceptor and install it in one step
    ///
    /// Returns `false` (and installs nothing) if the layer is already linked.
    pub fn layer_interceptor<F>(&self, layer: &'static Layered<F>) -> bool
    where
        F: Fn(u8) -> bool + Sync + 'static,
    {
        critical_section::with(|cs| {
            let slot = self.interceptor.borrow(cs);
            if !layer.link(slot.get()) {
                return false;
            }
            slot.set(layer);
            true
        })
    }

    /// Currently installed interceptor
    pub fn interceptor(&self) -> &'static dyn RealtimeInterceptor {
        critical_section::with(|cs| self.interceptor.borrow(cs).get())
    }

    /// Offer a received byte to the interceptor
    ///
    /// The reference is copied out so the handler runs outside the critical
    /// section.
    pub(crate) fn intercept(&self, byte: u8) -> bool {
        self.interceptor().handle(byte)
    }
}

impl<const RX: usize, const TX: usize> Default for SerialState<RX, TX> {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability table every transport exposes
///
/// Callers (line parser, command dispatcher) only ever see this trait, so they
/// work the same over a UART, USB CDC or a network stream.
pub trait IoStream {
    /// Transport kind and connection status
    fn descriptor(&self) -> StreamDescriptor;

    /// Next received byte, `None` if the RX ring is empty
    fn read(&self) -> Option<u8>;

    /// Queue one byte for transmission, waiting for space if necessary
    ///
    /// Returns `false` if the blocking-wait policy gave up; the byte was not
    /// queued.
    fn write_byte(&self, byte: u8) -> bool;

    /// Queue a byte slice, stopping at the first byte that could not be queued
    ///
    /// A `false` return may leave a prefix of `buf` already transmitted.
    fn write_bytes(&self, buf: &[u8]) -> bool {
        buf.iter().all(|&byte| self.write_byte(byte))
    }

    /// Queue a string, same semantics as [`write_bytes`](Self::write_bytes)
    fn write_string(&self, s: &str) -> bool {
        self.write_bytes(s.as_bytes())
    }

    /// Free space in the RX ring
    fn rx_free(&self) -> usize;

    /// Bytes waiting in the RX ring
    fn rx_count(&self) -> usize;

    /// Bytes not yet on the wire: the TX ring plus one still shifting out
    fn tx_count(&self) -> usize;

    /// Drop unread input
    fn reset_read_buffer(&self);

    /// Drop unsent output
    fn reset_write_buffer(&self);

    /// Drop unread input and leave a single cancel marker to be read next
    fn cancel_read_buffer(&self);

    /// Enter or leave suspended mode; returns whether reads are now suspended
    fn suspend_read(&self, suspend: bool) -> bool;

    /// Mask or unmask the receive interrupt source
    fn disable(&self, disable: bool) -> bool;

    /// Reprogram the line rate; both rings are flushed
    fn set_baud_rate(&self, baud: u32) -> bool;

    /// Install a realtime interceptor, returning the previous one
    ///
    /// Does not link a [`Layered`] interceptor to the one it replaces; use
    /// [`StreamPort::layer_realtime_interceptor`] for that.
    fn set_realtime_interceptor(
        &self,
        handler: &'static dyn RealtimeInterceptor,
    ) -> &'static dyn RealtimeInterceptor;
}

/// Foreground handle of one serial transport
pub struct StreamPort<'a, H, W, const RX: usize = DEFAULT_RX_CAPACITY, const TX: usize = DEFAULT_TX_CAPACITY>
{
    state: &'a SerialState<RX, TX>,
    rx: Consumer<'a, RX>,
    tx: Producer<'a, TX>,
    hw: &'a H,
    wait: W,
    config: Cell<PortConfig>,
    active: Cell<bool>,
}

impl<'a, H, W, const RX: usize, const TX: usize> StreamPort<'a, H, W, RX, TX>
where
    H: SerialHardware,
    W: BlockingWait,
{
    /// Create an uninitialized port
    ///
    /// Nothing touches the hardware until [`init`](Self::init).
    pub fn new(state: &'a SerialState<RX, TX>, hw: &'a H, wait: W, config: PortConfig) -> Self {
        Self {
            state,
            rx: state.rx.consumer(),
            tx: state.tx.producer(),
            hw,
            wait,
            config: Cell::new(config),
            active: Cell::new(false),
        }
    }

    /// Bring the transport up
    ///
    /// 1. Platform enables the peripheral clock and pins
    /// 2. Divisor programmed from the current peripheral clock, receiver and
    ///    transmitter enabled, receive interrupt armed, rings flushed
    /// 3. Interrupt priority registered with the platform
    ///
    /// Safe to call again; each call repeats the whole sequence.
    pub fn init<P>(&self, platform: &P) -> Result<()>
    where
        P: Platform + ?Sized,
    {
        let config = self.config.get();

        platform.enable_peripheral()?;
        self.configure(config.baud_rate)?;
        platform.register_interrupt(config.irq_priority)?;

        self.active.set(true);
        info!(
            "[serial] port up: {} baud, rx {} / tx {} bytes, irq priority {}",
            config.baud_rate,
            self.state.rx.capacity(),
            self.state.tx.capacity(),
            config.irq_priority
        );
        Ok(())
    }

    /// Program a new line rate and flush both rings
    ///
    /// In-flight bytes are not preserved across a rate change.
    pub fn configure(&self, baud: u32) -> Result<()> {
        let clock_hz = self.hw.peripheral_clock_hz();
        let divisor = self.hw.baud_divisor(clock_hz, baud)?;

        self.hw.program(divisor);
        critical_section::with(|_| {
            self.flush_rx();
            self.state.tx.flush();
        });

        let mut config = self.config.get();
        config.baud_rate = baud;
        self.config.set(config);

        debug!(
            "[serial] baud {} from {} Hz clock, divisor {}",
            baud, clock_hz, divisor
        );
        Ok(())
    }

    pub fn config(&self) -> PortConfig {
        self.config.get()
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Current mode
    pub fn state(&self) -> PortState {
        if !self.active.get() {
            return PortState::Uninitialized;
        }

        let suspended = self.state.is_suspended();
        if !self.hw.rx_interrupt_enabled() {
            PortState::Disabled { suspended }
        } else if suspended {
            PortState::Suspended
        } else {
            PortState::Normal
        }
    }

    /// Sticky RX overflow flag
    pub fn rx_overflow(&self) -> bool {
        self.state.rx.overflow()
    }

    /// Clear the RX overflow flag, returning whether it was set
    pub fn clear_rx_overflow(&self) -> bool {
        self.state.rx.clear_overflow()
    }

    /// Install `layer` over the current interceptor
    ///
    /// See [`SerialState::layer_interceptor`].
    pub fn layer_realtime_interceptor<F>(&self, layer: &'static Layered<F>) -> bool
    where
        F: Fn(u8) -> bool + Sync + 'static,
    {
        self.state.layer_interceptor(layer)
    }

    /// Shared state this port operates on
    pub fn shared(&self) -> &'a SerialState<RX, TX> {
        self.state
    }

    fn flush_rx(&self) {
        self.rx.flush();
        self.state.rx.clear_overflow();
    }
}

impl<'a, H, W, const RX: usize, const TX: usize> IoStream for StreamPort<'a, H, W, RX, TX>
where
    H: SerialHardware,
    W: BlockingWait,
{
    fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            stream_type: self.config.get().stream_type,
            connected: self.active.get(),
        }
    }

    fn read(&self) -> Option<u8> {
        self.rx.try_pop()
    }

    fn write_byte(&self, byte: u8) -> bool {
        if !self.active.get() {
            return false;
        }

        if !self.tx.try_push(byte) {
            // Ring is full: make sure the router is draining while we wait
            self.hw.set_tx_interrupt(true);
            loop {
                if !self.wait.keep_waiting() {
                    return false;
                }
                if self.tx.try_push(byte) {
                    break;
                }
            }
        }

        self.hw.set_tx_interrupt(true);
        true
    }

    fn rx_free(&self) -> usize {
        self.state.rx.free_count()
    }

    fn rx_count(&self) -> usize {
        self.rx.count()
    }

    fn tx_count(&self) -> usize {
        let shifting = !self.hw.status().contains(LineStatus::TX_COMPLETE);
        self.state.tx.count() + usize::from(shifting)
    }

    fn reset_read_buffer(&self) {
        self.flush_rx();
    }

    fn reset_write_buffer(&self) {
        critical_section::with(|_| {
            self.hw.set_tx_interrupt(false);
            self.state.tx.flush();
        });
    }

    fn cancel_read_buffer(&self) {
        let sentinel = self.config.get().cancel_sentinel;
        critical_section::with(|_| self.rx.cancel_and_signal(sentinel));
    }

    fn suspend_read(&self, suspend: bool) -> bool {
        self.state.set_suspended(suspend);
        suspend
    }

    fn disable(&self, disable: bool) -> bool {
        self.hw.set_rx_interrupt(!disable);
        true
    }

    fn set_baud_rate(&self, baud: u32) -> bool {
        let result = if self.active.get() {
            self.configure(baud)
        } else {
            Err(StreamError::NotInitialized)
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("[serial] baud rate {} rejected: {}", baud, e);
                false
            }
        }
    }

    fn set_realtime_interceptor(
        &self,
        handler: &'static dyn RealtimeInterceptor,
    ) -> &'static dyn RealtimeInterceptor {
        self.state.swap_interceptor(handler)
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::sim::SimUart;
    use crate::{NoPlatform, PlatformError};
    use std::cell::Cell as StdCell;

    type SmallState = SerialState<16, 8>;

    struct FailingPlatform;

    impl Platform for FailingPlatform {
        fn enable_peripheral(&self) -> core::result::Result<(), PlatformError> {
            Ok(())
        }

        fn register_interrupt(&self, _priority: u8) -> core::result::Result<(), PlatformError> {
            Err(PlatformError("NVIC unavailable"))
        }
    }

    #[test]
    fn test_uninitialized_port() {
        let state = SmallState::new();
        let uart = SimUart::new(16_000_000);
        let port = StreamPort::new(&state, &uart, NeverWait, PortConfig::default());

        assert_eq!(port.state(), PortState::Uninitialized);
        assert!(!port.descriptor().connected);
        assert!(!port.write_byte(b'x'));
        assert_eq!(port.read(), None);

        // Rate changes need a port that has been brought up
        assert!(!port.set_baud_rate(9_600));
        assert_eq!(uart.divisor(), 0);
    }

    #[test]
    fn test_init_programs_hardware() {
        let state = SmallState::new();
        let uart = SimUart::new(16_000_000);
        let config = PortConfig {
            baud_rate: 9_600,
            ..PortConfig::default()
        };
        let port = StreamPort::new(&state, &uart, NeverWait, config);

        port.init(&NoPlatform).unwrap();

        assert_eq!(port.state(), PortState::Normal);
        assert_eq!(uart.divisor(), 1667);
        assert!(uart.rx_interrupt_enabled());
        assert!(!uart.tx_interrupt_armed());
        assert_eq!(
            port.descriptor(),
            StreamDescriptor {
                stream_type: StreamType::Serial,
                connected: true
            }
        );

        // Second init repeats the sequence without complaint
        port.init(&NoPlatform).unwrap();
        assert_eq!(port.state(), PortState::Normal);
    }

    #[test]
    fn test_init_surfaces_platform_error() {
        let state = SmallState::new();
        let uart = SimUart::new(16_000_000);
        let port = StreamPort::new(&state, &uart, NeverWait, PortConfig::default());

        let err = port.init(&FailingPlatform).unwrap_err();
        assert_eq!(err, StreamError::Platform(PlatformError("NVIC unavailable")));
        assert_eq!(port.state(), PortState::Uninitialized);
    }

    #[test]
    fn test_write_byte_arms_transmit() {
        let state = SmallState::new();
        let uart = SimUart::new(16_000_000);
        let port = StreamPort::new(&state, &uart, NeverWait, PortConfig::default());
        port.init(&NoPlatform).unwrap();

        assert!(port.write_byte(b'o'));
        assert!(uart.tx_interrupt_armed());
        assert_eq!(port.tx_count(), 1);
    }

    #[test]
    fn test_write_abandons_when_wait_declines() {
        let state = SmallState::new();
        let uart = SimUart::new(16_000_000);
        let asked = StdCell::new(0u32);
        let wait = || {
            asked.set(asked.get() + 1);
            asked.get() < 3
        };
        let port = StreamPort::new(&state, &uart, wait, PortConfig::default());
        port.init(&NoPlatform).unwrap();

        // TX ring of 8 slots holds 7 bytes
        assert!(!port.write_string("ok\r\nerror\r\n"));
        assert_eq!(port.tx_count(), 7);
        assert_eq!(asked.get(), 3);
        assert_eq!(state.tx().peek(), Some(b'o'));
    }

    #[test]
    fn test_reset_write_buffer_disarms() {
        let state = SmallState::new();
        let uart = SimUart::new(16_000_000);
        let port = StreamPort::new(&state, &uart, NeverWait, PortConfig::default());
        port.init(&NoPlatform).unwrap();

        port.write_string("ok\r\n");
        port.reset_write_buffer();

        assert_eq!(port.tx_count(), 0);
        assert!(!uart.tx_interrupt_armed());
    }

    #[test]
    fn test_rejected_baud_keeps_buffers() {
        let state = SmallState::new();
        let uart = SimUart::new(16_000_000);
        let port = StreamPort::new(&state, &uart, NeverWait, PortConfig::default());
        port.init(&NoPlatform).unwrap();

        state.rx().try_push(b'G');
        assert!(!port.set_baud_rate(0));
        assert_eq!(port.rx_count(), 1);
        assert_eq!(port.config().baud_rate, DEFAULT_BAUD_RATE);
    }

    #[test]
    fn test_reset_read_buffer_clears_overflow() {
        let state = SmallState::new();
        let uart = SimUart::new(16_000_000);
        let port = StreamPort::new(&state, &uart, NeverWait, PortConfig::default());
        port.init(&NoPlatform).unwrap();

        state.rx().try_push(b'G');
        state.rx().set_overflow();
        assert!(port.rx_overflow());

        port.reset_read_buffer();
        assert!(!port.rx_overflow());
        assert_eq!(port.rx_count(), 0);
        assert_eq!(port.rx_free(), 15);
    }

    #[test]
    fn test_swap_returns_previous() {
        static LATCH: crate::RealtimeLatch = crate::RealtimeLatch::new();
        let state = SmallState::new();
        let uart = SimUart::new(16_000_000);
        let port = StreamPort::new(&state, &uart, NeverWait, PortConfig::default());

        let previous = port.set_realtime_interceptor(&LATCH);
        assert!(!previous.handle(b'!'));
        let previous = port.set_realtime_interceptor(previous);
        assert!(previous.handle(b'!'));
        assert_eq!(LATCH.take(), crate::RealtimeCommand::FEED_HOLD);
    }
}
