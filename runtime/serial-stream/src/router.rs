//! InterruptRouter - interrupt side of a serial transport
//!
//! [`InterruptRouter::service`] is the body of the UART interrupt vector. Each
//! call checks receive-ready, transmit-ready and the error latches
//! independently: a condition left set would re-enter the vector immediately.
//!
//! The router never blocks and never logs. On hosted builds it is driven by
//! [`sim::InterruptPump`](crate::sim::InterruptPump) instead of a real vector.

use bitflags::bitflags;
use stream_ring::{Consumer, Producer};

use crate::hardware::{LineStatus, SerialHardware};
use crate::port::SerialState;

bitflags! {
    /// What one `service` pass did
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ServiceReport: u16 {
        /// A byte was read from the holding register
        const RECEIVED = 1 << 0;
        /// ...and consumed by the realtime interceptor
        const INTERCEPTED = 1 << 1;
        /// ...and queued in the RX ring
        const QUEUED = 1 << 2;
        /// ...and discarded because reads are suspended
        const DISCARDED = 1 << 3;
        /// ...and lost because the RX ring was full
        const OVERFLOWED = 1 << 4;
        /// A byte was written to the transmit data register
        const TRANSMITTED = 1 << 5;
        /// The TX ring ran dry and the transmit interrupt was disarmed
        const TX_DISARMED = 1 << 6;
        /// Error latches were acknowledged
        const ERRORS_CLEARED = 1 << 7;
    }
}

/// Interrupt handler over one transport's shared state
pub struct InterruptRouter<'a, H, const RX: usize, const TX: usize> {
    state: &'a SerialState<RX, TX>,
    rx: Producer<'a, RX>,
    tx: Consumer<'a, TX>,
    hw: &'a H,
}

impl<'a, H, const RX: usize, const TX: usize> InterruptRouter<'a, H, RX, TX>
where
    H: SerialHardware,
{
    pub fn new(state: &'a SerialState<RX, TX>, hw: &'a H) -> Self {
        Self {
            state,
            rx: state.rx().producer(),
            tx: state.tx().consumer(),
            hw,
        }
    }

    /// Service every pending condition once
    pub fn service(&self) -> ServiceReport {
        let status = self.hw.status();
        let mut report = ServiceReport::empty();

        if status.contains(LineStatus::RX_READY) {
            report |= self.receive();
        }

        if status.contains(LineStatus::TX_READY) && self.hw.tx_interrupt_armed() {
            report |= self.transmit();
        }

        let errors = status & LineStatus::ERRORS;
        if !errors.is_empty() {
            self.hw.clear_errors(errors);
            report |= ServiceReport::ERRORS_CLEARED;
        }

        report
    }

    fn receive(&self) -> ServiceReport {
        // Reading the register acknowledges the condition whatever happens next
        let byte = self.hw.read_data();

        let outcome = if self.state.intercept(byte) {
            ServiceReport::INTERCEPTED
        } else if self.state.is_suspended() {
            ServiceReport::DISCARDED
        } else if self.rx.push_or_flag(byte) {
            ServiceReport::QUEUED
        } else {
            ServiceReport::OVERFLOWED
        };

        ServiceReport::RECEIVED | outcome
    }

    fn transmit(&self) -> ServiceReport {
        match self.tx.try_pop() {
            Some(byte) => {
                self.hw.write_data(byte);
                if self.tx.is_empty() {
                    self.hw.set_tx_interrupt(false);
                    ServiceReport::TRANSMITTED | ServiceReport::TX_DISARMED
                } else {
                    ServiceReport::TRANSMITTED
                }
            }
            None => {
                // Armed with nothing to send: disarm or the vector storms
                self.hw.set_tx_interrupt(false);
                ServiceReport::TX_DISARMED
            }
        }
    }
}
