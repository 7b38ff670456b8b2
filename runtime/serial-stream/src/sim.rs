//! Hosted simulation of a UART and its interrupt vector
//!
//! [`SimUart`] models the registers the router touches: a one-byte receive
//! holding register, latched error bits, interrupt enables and a baud divisor.
//! Transmission is instantaneous; written bytes collect in a capture buffer.
//!
//! [`InterruptPump`] stands in for the interrupt controller. It runs on its own
//! thread, moves bytes from the simulated line into the holding register and
//! calls [`InterruptRouter::service`] whenever a condition is pending. The
//! foreground keeps using its [`StreamPort`](crate::StreamPort) as on target.
//!
//! Each service runs inside a `critical_section::with`, so a foreground
//! critical section excludes the vector exactly as masking interrupts does on
//! a single core.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use log::trace;

use crate::hardware::{LineStatus, SerialHardware};
use crate::port::SerialState;
use crate::router::{InterruptRouter, ServiceReport};

/// Holding register flag: a byte is waiting
const HOLDING_FULL: u16 = 1 << 8;

/// How long an idle pump sleeps before re-checking for shutdown
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Simulated UART registers
pub struct SimUart {
    clock_hz: AtomicU32,
    divisor: AtomicU32,
    holding: AtomicU16,
    errors: AtomicU32,
    tx_armed: AtomicBool,
    rx_enabled: AtomicBool,
    transmitted: Mutex<Vec<u8>>,
    line_tx: Sender<u8>,
    line_rx: Receiver<u8>,
    doorbell_tx: Sender<()>,
    doorbell_rx: Receiver<()>,
}

impl SimUart {
    /// Create a UART fed by a peripheral clock of `clock_hz`
    pub fn new(clock_hz: u32) -> Self {
        let (line_tx, line_rx) = unbounded();
        let (doorbell_tx, doorbell_rx) = bounded(1);

        Self {
            clock_hz: AtomicU32::new(clock_hz),
            divisor: AtomicU32::new(0),
            holding: AtomicU16::new(0),
            errors: AtomicU32::new(0),
            tx_armed: AtomicBool::new(false),
            rx_enabled: AtomicBool::new(false),
            transmitted: Mutex::new(Vec::new()),
            line_tx,
            line_rx,
            doorbell_tx,
            doorbell_rx,
        }
    }

    /// Remote end of the line, for feeding bytes from another thread
    pub fn line(&self) -> SimLine {
        SimLine {
            data: self.line_tx.clone(),
            doorbell: self.doorbell_tx.clone(),
        }
    }

    /// Place a byte in the holding register
    ///
    /// If the previous byte has not been read yet the new one is lost and an
    /// overrun is latched, as on real hardware.
    pub fn receive(&self, byte: u8) -> bool {
        let latched = self
            .holding
            .compare_exchange(0, HOLDING_FULL | byte as u16, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if !latched {
            self.latch_errors(LineStatus::OVERRUN);
        }
        self.ring();
        latched
    }

    /// Move the next byte from the line into an empty holding register
    pub fn latch_line(&self) -> bool {
        if self.holding.load(Ordering::Acquire) & HOLDING_FULL != 0 {
            return false;
        }
        match self.line_rx.try_recv() {
            Ok(byte) => self.receive(byte),
            Err(_) => false,
        }
    }

    /// Latch error conditions as if the line had glitched
    pub fn latch_errors(&self, errors: LineStatus) {
        self.errors
            .fetch_or((errors & LineStatus::ERRORS).bits(), Ordering::AcqRel);
        self.ring();
    }

    /// Change the peripheral clock (takes effect on the next divisor programming)
    pub fn set_clock_hz(&self, clock_hz: u32) {
        self.clock_hz.store(clock_hz, Ordering::Release);
    }

    /// Last programmed divisor (0 if never programmed)
    pub fn divisor(&self) -> u32 {
        self.divisor.load(Ordering::Acquire)
    }

    /// Drain everything written to the transmit data register so far
    pub fn take_transmitted(&self) -> Vec<u8> {
        let mut transmitted = self
            .transmitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *transmitted)
    }

    /// Check whether the vector would fire right now
    pub fn interrupt_pending(&self) -> bool {
        let rx_pending = self.holding.load(Ordering::Acquire) & HOLDING_FULL != 0
            && self.rx_enabled.load(Ordering::Acquire);
        rx_pending
            || self.tx_armed.load(Ordering::Acquire)
            || self.errors.load(Ordering::Acquire) != 0
    }

    /// Block until something rings the doorbell or `timeout` passes
    pub fn wait_for_activity(&self, timeout: Duration) -> bool {
        self.doorbell_rx.recv_timeout(timeout).is_ok()
    }

    /// Run `f` as the interrupt vector
    ///
    /// Foreground critical sections (including arming the transmit interrupt)
    /// wait for the vector to return, so the two never interleave.
    pub fn in_vector<R>(&self, f: impl FnOnce() -> R) -> R {
        critical_section::with(|_| f())
    }

    fn ring(&self) {
        // A full doorbell already means "look again"
        let _ = self.doorbell_tx.try_send(());
    }
}

impl SerialHardware for SimUart {
    fn status(&self) -> LineStatus {
        let mut status = LineStatus::TX_READY | LineStatus::TX_COMPLETE;
        if self.holding.load(Ordering::Acquire) & HOLDING_FULL != 0 {
            status |= LineStatus::RX_READY;
        }
        status | LineStatus::from_bits_truncate(self.errors.load(Ordering::Acquire))
    }

    fn read_data(&self) -> u8 {
        (self.holding.swap(0, Ordering::AcqRel) & 0xFF) as u8
    }

    fn write_data(&self, byte: u8) {
        self.transmitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(byte);
    }

    fn set_tx_interrupt(&self, armed: bool) {
        // A vector in progress may be about to disarm; wait for it
        critical_section::with(|_| self.tx_armed.store(armed, Ordering::Release));
        if armed {
            self.ring();
        }
    }

    fn tx_interrupt_armed(&self) -> bool {
        self.tx_armed.load(Ordering::Acquire)
    }

    fn set_rx_interrupt(&self, enabled: bool) {
        self.rx_enabled.store(enabled, Ordering::Release);
        if enabled {
            self.ring();
        }
    }

    fn rx_interrupt_enabled(&self) -> bool {
        self.rx_enabled.load(Ordering::Acquire)
    }

    fn clear_errors(&self, errors: LineStatus) {
        self.errors.fetch_and(!errors.bits(), Ordering::AcqRel);
    }

    fn peripheral_clock_hz(&self) -> u32 {
        self.clock_hz.load(Ordering::Acquire)
    }

    fn program(&self, divisor: u32) {
        self.divisor.store(divisor, Ordering::Release);
        self.tx_armed.store(false, Ordering::Release);
        self.rx_enabled.store(true, Ordering::Release);
    }
}

/// Remote end of a simulated line
#[derive(Clone)]
pub struct SimLine {
    data: Sender<u8>,
    doorbell: Sender<()>,
}

impl SimLine {
    /// Put a byte on the wire; `false` if the UART is gone
    pub fn send(&self, byte: u8) -> bool {
        let sent = self.data.send(byte).is_ok();
        let _ = self.doorbell.try_send(());
        sent
    }

    /// Put a run of bytes on the wire
    pub fn send_all(&self, bytes: &[u8]) -> bool {
        bytes.iter().all(|&byte| self.send(byte))
    }
}

/// Totals gathered by a pump
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    pub services: u64,
    pub received: u64,
    pub intercepted: u64,
    pub queued: u64,
    pub discarded: u64,
    pub overflowed: u64,
    pub transmitted: u64,
    pub error_clears: u64,
}

impl PumpStats {
    fn record(&mut self, report: ServiceReport) {
        self.services += 1;
        let count = |flag: ServiceReport| u64::from(report.contains(flag));

        self.received += count(ServiceReport::RECEIVED);
        self.intercepted += count(ServiceReport::INTERCEPTED);
        self.queued += count(ServiceReport::QUEUED);
        self.discarded += count(ServiceReport::DISCARDED);
        self.overflowed += count(ServiceReport::OVERFLOWED);
        self.transmitted += count(ServiceReport::TRANSMITTED);
        self.error_clears += count(ServiceReport::ERRORS_CLEARED);
    }
}

/// Dedicated thread body standing in for the UART interrupt vector
pub struct InterruptPump<'a, const RX: usize, const TX: usize> {
    router: InterruptRouter<'a, SimUart, RX, TX>,
    uart: &'a SimUart,
}

impl<'a, const RX: usize, const TX: usize> InterruptPump<'a, RX, TX> {
    pub fn new(state: &'a SerialState<RX, TX>, uart: &'a SimUart) -> Self {
        Self {
            router: InterruptRouter::new(state, uart),
            uart,
        }
    }

    /// Service conditions until `stop` is set and nothing is pending
    pub fn run(&self, stop: &AtomicBool) -> PumpStats {
        let mut stats = PumpStats::default();

        loop {
            self.uart.latch_line();

            if self.uart.interrupt_pending() {
                stats.record(self.uart.in_vector(|| self.router.service()));
                continue;
            }

            if stop.load(Ordering::Acquire) {
                break;
            }

            self.uart.wait_for_activity(IDLE_POLL);
        }

        trace!("[sim] pump stopped after {} services", stats.services);
        stats
    }
}
