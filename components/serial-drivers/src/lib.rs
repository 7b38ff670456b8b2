//! Serial Drivers - MMIO backends for the serial stream engine
//!
//! # Purpose
//! Register-level implementations of [`SerialHardware`] for the UARTs the
//! controller runs on, plus the STM32 [`Platform`] that gates clocks, muxes
//! pins and registers the vector with the NVIC.
//!
//! # Integration Points
//! - Depends on: `serial-stream` (hardware seams, error types)
//! - Provides to: board bring-up code, which pairs one backend value with one
//!   `SerialState` per transport
//!
//! # Architecture
//! - [`MmioRegion`]: bounds-checked (debug) volatile access to a register block
//! - [`Stm32Usart`]: USART with ISR/ICR status registers (F7/L4/H7 family)
//! - [`Pl011`]: ARM PrimeCell UART, FIFOs off so it behaves as a holding register
//! - [`Stm32Platform`]: RCC clock enables, GPIO alternate functions, NVIC
//!
//! Control registers touched from both the interrupt vector and the foreground
//! are read-modify-written inside a critical section.
//!
//! [`SerialHardware`]: serial_stream::SerialHardware
//! [`Platform`]: serial_stream::Platform

#![no_std]

#[cfg(test)]
extern crate std;

mod mmio;
mod pl011;
mod stm32;

pub use mmio::MmioRegion;
pub use pl011::{pl011_divisor, Pl011};
pub use stm32::{AltFunctionPin, ClockEnable, Stm32Platform, Stm32Usart, NVIC_BASE};

use serial_stream::PlatformError;
use thiserror::Error;

/// Driver setup errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    #[error("Interrupt priority {priority} exceeds the implemented priority bits")]
    PriorityOutOfRange { priority: u8 },

    #[error("Interrupt number {irq} outside the NVIC")]
    InvalidIrq { irq: u16 },

    #[error("Pin {pin} does not exist on a GPIO port")]
    InvalidPin { pin: u8 },

    #[error("Alternate function {af} out of range")]
    InvalidAltFunction { af: u8 },
}

impl From<DriverError> for PlatformError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::PriorityOutOfRange { .. } => PlatformError("interrupt priority out of range"),
            DriverError::InvalidIrq { .. } => PlatformError("interrupt number outside the NVIC"),
            DriverError::InvalidPin { .. } => PlatformError("no such GPIO pin"),
            DriverError::InvalidAltFunction { .. } => PlatformError("alternate function out of range"),
        }
    }
}

pub type Result<T> = core::result::Result<T, DriverError>;
