//! Hardware seams - register access and platform setup
//!
//! [`SerialHardware`] is everything the stream engine needs from a UART:
//! status flags, the data registers, interrupt arming and divisor programming.
//! [`Platform`] covers the one-time collaborators (clock gating, pin muxing,
//! interrupt controller registration) that are never touched after init.

use core::ops::RangeInclusive;

use bitflags::bitflags;
use thiserror::Error;

use crate::{Result, StreamError};

bitflags! {
    /// Line status as seen by the interrupt router
    ///
    /// Backends translate their own status register into these bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LineStatus: u32 {
        /// A received byte is waiting in the holding register
        const RX_READY = 1 << 0;
        /// The transmit data register can accept a byte
        const TX_READY = 1 << 1;
        /// Shift register idle, nothing on the wire
        const TX_COMPLETE = 1 << 2;
        /// A byte arrived while the holding register was still full
        const OVERRUN = 1 << 3;
        /// Stop bit not found where expected
        const FRAMING = 1 << 4;
        /// Noise detected on a received bit
        const NOISE = 1 << 5;

        const ERRORS = Self::OVERRUN.bits() | Self::FRAMING.bits() | Self::NOISE.bits();
    }
}

/// Device-specific register access for one UART
///
/// All methods take `&self`: the same backend is used from interrupt context
/// (router) and foreground context (port), so implementations use volatile
/// MMIO or atomics rather than `&mut` state.
pub trait SerialHardware {
    /// Current line status
    fn status(&self) -> LineStatus;

    /// Read the receive holding register
    ///
    /// This read is what acknowledges the receive-ready condition.
    fn read_data(&self) -> u8;

    /// Write the transmit data register
    fn write_data(&self, byte: u8);

    /// Arm or disarm the transmit-ready interrupt source
    fn set_tx_interrupt(&self, armed: bool);

    /// Check whether the transmit-ready interrupt source is armed
    fn tx_interrupt_armed(&self) -> bool;

    /// Unmask or mask the receive-ready interrupt source
    fn set_rx_interrupt(&self, enabled: bool);

    /// Check whether the receive-ready interrupt source is unmasked
    fn rx_interrupt_enabled(&self) -> bool;

    /// Acknowledge latched error conditions
    fn clear_errors(&self, errors: LineStatus);

    /// Current peripheral clock feeding the baud generator (Hz, 0 if unknown)
    fn peripheral_clock_hz(&self) -> u32;

    /// Divisor values the baud generator accepts
    fn divisor_range(&self) -> RangeInclusive<u32> {
        16..=0xFFFF
    }

    /// Convert a baud rate into this backend's divisor representation
    ///
    /// The default is the 16x oversampling rule used by most USARTs.
    fn baud_divisor(&self, clock_hz: u32, baud: u32) -> Result<u32> {
        let divisor = oversample16_divisor(clock_hz, baud)?;
        if self.divisor_range().contains(&divisor) {
            Ok(divisor)
        } else {
            Err(StreamError::DivisorOutOfRange { divisor })
        }
    }

    /// Program the divisor and bring the peripheral up
    ///
    /// Must leave the receiver and transmitter enabled, the receive interrupt
    /// unmasked and the transmit interrupt disarmed. Safe to call repeatedly.
    fn program(&self, divisor: u32);
}

/// Rounded baud divisor for 16x oversampling: `(clock + baud / 2) / baud`
pub fn oversample16_divisor(clock_hz: u32, baud: u32) -> Result<u32> {
    if baud == 0 {
        return Err(StreamError::InvalidBaudRate { baud });
    }
    if clock_hz == 0 {
        return Err(StreamError::ClockUnavailable);
    }

    let divisor = (clock_hz as u64 + (baud as u64 / 2)) / baud as u64;
    match u32::try_from(divisor) {
        Ok(0) | Err(_) => Err(StreamError::InvalidBaudRate { baud }),
        Ok(divisor) => Ok(divisor),
    }
}

/// Platform setup failure
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{0}")]
pub struct PlatformError(pub &'static str);

/// External collaborator for clock, pin and interrupt controller setup
pub trait Platform {
    /// Enable the peripheral clock and route the TX/RX pins
    fn enable_peripheral(&self) -> core::result::Result<(), PlatformError>;

    /// Set the UART interrupt priority and enable it at the controller
    fn register_interrupt(&self, priority: u8) -> core::result::Result<(), PlatformError>;
}

/// Platform with nothing to set up (hosted builds, pre-configured boards)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlatform;

impl Platform for NoPlatform {
    fn enable_peripheral(&self) -> core::result::Result<(), PlatformError> {
        Ok(())
    }

    fn register_interrupt(&self, _priority: u8) -> core::result::Result<(), PlatformError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divisor_rounds_to_nearest() {
        // 108 MHz / 115200 = 937.5 -> 938
        assert_eq!(oversample16_divisor(108_000_000, 115_200), Ok(938));
        // 54 MHz / 115200 = 468.75 -> 469
        assert_eq!(oversample16_divisor(54_000_000, 115_200), Ok(469));
        assert_eq!(oversample16_divisor(16_000_000, 9_600), Ok(1667));
    }

    #[test]
    fn test_divisor_rejects_bad_input() {
        assert_eq!(
            oversample16_divisor(16_000_000, 0),
            Err(StreamError::InvalidBaudRate { baud: 0 })
        );
        assert_eq!(oversample16_divisor(0, 115_200), Err(StreamError::ClockUnavailable));
        // Baud far above the clock rounds to zero
        assert_eq!(
            oversample16_divisor(1_000, 1_000_000),
            Err(StreamError::InvalidBaudRate { baud: 1_000_000 })
        );
    }

    #[test]
    fn test_error_mask() {
        assert!(LineStatus::ERRORS.contains(LineStatus::OVERRUN));
        assert!(LineStatus::ERRORS.contains(LineStatus::FRAMING));
        assert!(!LineStatus::ERRORS.contains(LineStatus::RX_READY));
    }
}
