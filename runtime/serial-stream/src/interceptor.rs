//! Realtime command interception
//!
//! Every received byte is offered to the installed [`RealtimeInterceptor`]
//! before it can reach the RX ring. An interceptor that recognizes the byte
//! applies its effect on the spot (in interrupt context) and reports it as
//! consumed; anything else is ordinary data.
//!
//! Interceptors are `&'static` strategy objects so that swapping one in never
//! allocates. Installing returns the previous interceptor; a new one extends
//! the recognized set by delegating to it ([`Layered`]).

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Once;

/// Byte-level realtime command hook
///
/// # Contract
/// - `true`: the byte was a control code, its effect is already applied, and it
///   must not be queued
/// - `false`: ordinary data, queue it
///
/// Runs in interrupt context: must not block.
pub trait RealtimeInterceptor: Sync {
    fn handle(&self, byte: u8) -> bool;
}

impl<F> RealtimeInterceptor for F
where
    F: Fn(u8) -> bool + Sync,
{
    fn handle(&self, byte: u8) -> bool {
        self(byte)
    }
}

/// Interceptor that recognizes nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl RealtimeInterceptor for PassThrough {
    fn handle(&self, _byte: u8) -> bool {
        false
    }
}

/// Interceptor installed on every new port
pub const PASS_THROUGH: &dyn RealtimeInterceptor = &PassThrough;

/// Interceptor layered over whatever was installed before it
///
/// The wrapped closure sees every byte first; bytes it does not recognize are
/// passed to the previous interceptor. The link to the previous interceptor is
/// made once, by [`StreamPort::layer_realtime_interceptor`], in the same
/// critical section as the swap.
///
/// A layer installed with plain [`IoStream::set_realtime_interceptor`] is never
/// linked and recognizes only its own codes; everything the previous
/// interceptor handled reaches the RX ring as data.
///
/// [`StreamPort::layer_realtime_interceptor`]: crate::StreamPort::layer_realtime_interceptor
/// [`IoStream::set_realtime_interceptor`]: crate::IoStream::set_realtime_interceptor
pub struct Layered<F> {
    handler: F,
    previous: Once<&'static dyn RealtimeInterceptor>,
}

impl<F> Layered<F>
where
    F: Fn(u8) -> bool + Sync,
{
    pub const fn new(handler: F) -> Self {
        Self {
            handler,
            previous: Once::new(),
        }
    }

    /// Attach the interceptor to delegate to
    ///
    /// Returns `false` if this layer is already linked.
    pub fn link(&self, previous: &'static dyn RealtimeInterceptor) -> bool {
        let mut linked = false;
        self.previous.call_once(|| {
            linked = true;
            previous
        });
        linked
    }

    /// Check whether this layer has been linked
    pub fn is_linked(&self) -> bool {
        self.previous.is_completed()
    }
}

impl<F> RealtimeInterceptor for Layered<F>
where
    F: Fn(u8) -> bool + Sync,
{
    fn handle(&self, byte: u8) -> bool {
        (self.handler)(byte) || self.previous.get().is_some_and(|previous| previous.handle(byte))
    }
}

bitflags! {
    /// Single-byte realtime commands understood by the controller
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RealtimeCommand: u32 {
        /// Soft reset (ASCII CAN)
        const RESET = 1 << 0;
        /// Status report request
        const STATUS_REPORT = 1 << 1;
        /// Cycle start / resume
        const CYCLE_START = 1 << 2;
        /// Feed hold
        const FEED_HOLD = 1 << 3;
        /// Safety door
        const SAFETY_DOOR = 1 << 4;
        /// Cancel the active jog
        const JOG_CANCEL = 1 << 5;
    }
}

impl RealtimeCommand {
    /// Decode a received byte
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x18 => Some(Self::RESET),
            b'?' => Some(Self::STATUS_REPORT),
            b'~' => Some(Self::CYCLE_START),
            b'!' => Some(Self::FEED_HOLD),
            0x84 => Some(Self::SAFETY_DOOR),
            0x85 => Some(Self::JOG_CANCEL),
            _ => None,
        }
    }
}

/// Default realtime handler: latches commands for the foreground
///
/// The interrupt side only sets bits; the control loop picks them up with
/// [`take`](Self::take) on its next pass.
#[derive(Debug, Default)]
pub struct RealtimeLatch {
    pending: AtomicU32,
}

impl RealtimeLatch {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
        }
    }

    /// Commands latched since the last `take`, without clearing them
    pub fn pending(&self) -> RealtimeCommand {
        RealtimeCommand::from_bits_truncate(self.pending.load(Ordering::Acquire))
    }

    /// Drain latched commands
    pub fn take(&self) -> RealtimeCommand {
        RealtimeCommand::from_bits_truncate(self.pending.swap(0, Ordering::AcqRel))
    }
}

impl RealtimeInterceptor for RealtimeLatch {
    fn handle(&self, byte: u8) -> bool {
        match RealtimeCommand::from_byte(byte) {
            Some(command) => {
                self.pending.fetch_or(command.bits(), Ordering::AcqRel);
                true
            }
            None => false,
        }
    }
}
