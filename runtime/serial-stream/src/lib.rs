//! Serial Stream - Interrupt-driven byte stream for the controller's serial ports
//!
//! # Purpose
//! Bridges an asynchronous UART (receive/transmit-ready interrupts) to the
//! synchronous foreground control loop. Received bytes pass a pluggable
//! realtime interceptor before they are queued, so single-byte commands such as
//! reset or feed hold take effect immediately without entering the data path.
//!
//! # Integration Points
//! - Depends on: `stream-ring` (SPSC byte rings), a [`SerialHardware`] backend,
//!   a [`Platform`] for clock/pin/interrupt-controller setup
//! - Provides to: the line parser and command dispatcher via [`IoStream`]
//!
//! # Architecture
//! ```text
//! hardware -> InterruptRouter -> RealtimeInterceptor -> RX ring -> StreamPort::read
//! StreamPort::write_byte -> TX ring -> InterruptRouter -> hardware
//! ```
//! Each transport owns one [`SerialState`] (both rings, mode flags, interceptor
//! slot). The foreground holds a [`StreamPort`] over it and the interrupt vector
//! calls [`InterruptRouter::service`] over the same state. Two transports are two
//! states; nothing is shared between them.
//!
//! # Testing Strategy
//! - Unit tests: ring/port/router behaviour against the simulated UART
//! - Integration tests: threaded pump driving the router while foreground writes
//! - Hardware sim tests: `sim` module (feature `std`)

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(all(test, not(feature = "std")))]
extern crate std;

mod hardware;
mod interceptor;
mod port;
mod router;

#[cfg(feature = "std")]
pub mod sim;

pub use hardware::{
    oversample16_divisor, LineStatus, NoPlatform, Platform, PlatformError, SerialHardware,
};
pub use interceptor::{
    Layered, PassThrough, RealtimeCommand, RealtimeInterceptor, RealtimeLatch, PASS_THROUGH,
};
pub use port::{
    BlockingWait, IoStream, NeverWait, PortConfig, PortState, SerialState, StreamDescriptor,
    StreamPort, StreamType, ASCII_CAN, DEFAULT_BAUD_RATE,
};
pub use router::{InterruptRouter, ServiceReport};
pub use stream_ring::{RingBuffer, DEFAULT_RX_CAPACITY, DEFAULT_TX_CAPACITY};

use thiserror::Error;

/// Error types for port lifecycle and configuration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Port has not been initialized")]
    NotInitialized,

    #[error("Invalid baud rate: {baud}")]
    InvalidBaudRate { baud: u32 },

    #[error("Baud divisor {divisor} outside hardware range")]
    DivisorOutOfRange { divisor: u32 },

    #[error("Peripheral clock frequency unavailable")]
    ClockUnavailable,

    #[error("Platform setup failed: {0}")]
    Platform(#[from] PlatformError),
}

pub type Result<T> = core::result::Result<T, StreamError>;
