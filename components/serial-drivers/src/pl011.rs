//! ARM PL011 UART Hardware Interface
//!
//! Reference: ARM PrimeCell UART (PL011) Technical Reference Manual
//!
//! FIFOs are left disabled so the data register behaves as a single holding
//! register and the TX interrupt fires whenever it is empty.

use core::ops::RangeInclusive;

use serial_stream::{LineStatus, SerialHardware, StreamError};

use crate::mmio::MmioRegion;

/// PL011 UART Register offsets
const UARTDR: usize = 0x000; // Data Register
const UARTRSR: usize = 0x004; // Receive Status / Error Clear
const UARTFR: usize = 0x018; // Flag Register
const UARTIBRD: usize = 0x024; // Integer Baud Rate Divisor
const UARTFBRD: usize = 0x028; // Fractional Baud Rate Divisor
const UARTLCR_H: usize = 0x02C; // Line Control Register
const UARTCR: usize = 0x030; // Control Register
const UARTIMSC: usize = 0x038; // Interrupt Mask Set/Clear
const UARTICR: usize = 0x044; // Interrupt Clear Register
const PL011_BLOCK_SIZE: usize = 0x1000;

/// Flag Register bits
const FR_BUSY: u32 = 1 << 3;
const FR_RXFE: u32 = 1 << 4;
const FR_TXFF: u32 = 1 << 5;

/// Receive Status Register bits
const RSR_FE: u32 = 1 << 0;
const RSR_PE: u32 = 1 << 1;
const RSR_BE: u32 = 1 << 2;
const RSR_OE: u32 = 1 << 3;

const LCR_H_WLEN_8: u32 = 0x60;

/// Control Register bits
const CR_UARTEN: u32 = 1 << 0;
const CR_TXE: u32 = 1 << 8;
const CR_RXE: u32 = 1 << 9;

/// Interrupt bits
const INT_RX: u32 = 1 << 4;
const INT_TX: u32 = 1 << 5;
const INT_ALL: u32 = 0x7FF;

/// Largest divisor in 64ths: 16-bit IBRD, 6-bit FBRD
const MAX_DIVISOR: u32 = (0xFFFF << 6) | 0x3F;

/// Baud divisor in 64ths of the 16x oversampled bit time
///
/// `IBRD = divisor >> 6`, `FBRD = divisor & 0x3F`. With a 24 MHz UARTCLK
/// 115200 baud gives 833 (13 + 1/64).
pub fn pl011_divisor(clock_hz: u32, baud: u32) -> serial_stream::Result<u32> {
    if baud == 0 {
        return Err(StreamError::InvalidBaudRate { baud });
    }
    if clock_hz == 0 {
        return Err(StreamError::ClockUnavailable);
    }

    // 64 * clock / (16 * baud), rounded
    let divisor = (4 * clock_hz as u64 + baud as u64 / 2) / baud as u64;
    u32::try_from(divisor).map_err(|_| StreamError::DivisorOutOfRange { divisor: u32::MAX })
}

/// PL011 UART driver
pub struct Pl011 {
    regs: MmioRegion,
    uartclk_hz: u32,
}

impl Pl011 {
    /// Create a new PL011 UART driver
    ///
    /// # Safety
    /// The caller must ensure that `base` points to valid PL011 UART MMIO registers
    pub const unsafe fn new(base: usize, uartclk_hz: u32) -> Self {
        Self {
            regs: MmioRegion::new(base, PL011_BLOCK_SIZE),
            uartclk_hz,
        }
    }

    fn set_mask(&self, mask: u32, set: bool) {
        if set {
            self.regs.modify_u32(UARTIMSC, 0, mask);
        } else {
            self.regs.modify_u32(UARTIMSC, mask, 0);
        }
    }
}

impl SerialHardware for Pl011 {
    fn status(&self) -> LineStatus {
        let fr = self.regs.read_u32(UARTFR);
        let rsr = self.regs.read_u32(UARTRSR);
        let mut status = LineStatus::empty();

        status.set(LineStatus::RX_READY, fr & FR_RXFE == 0);
        status.set(LineStatus::TX_READY, fr & FR_TXFF == 0);
        status.set(LineStatus::TX_COMPLETE, fr & (FR_BUSY | FR_TXFF) == 0);
        status.set(LineStatus::OVERRUN, rsr & RSR_OE != 0);
        status.set(LineStatus::FRAMING, rsr & (RSR_FE | RSR_PE | RSR_BE) != 0);
        status
    }

    fn read_data(&self) -> u8 {
        (self.regs.read_u32(UARTDR) & 0xFF) as u8
    }

    fn write_data(&self, byte: u8) {
        self.regs.write_u32(UARTDR, byte as u32);
    }

    fn set_tx_interrupt(&self, armed: bool) {
        self.set_mask(INT_TX, armed);
    }

    fn tx_interrupt_armed(&self) -> bool {
        self.regs.read_u32(UARTIMSC) & INT_TX != 0
    }

    fn set_rx_interrupt(&self, enabled: bool) {
        self.set_mask(INT_RX, enabled);
    }

    fn rx_interrupt_enabled(&self) -> bool {
        self.regs.read_u32(UARTIMSC) & INT_RX != 0
    }

    fn clear_errors(&self, errors: LineStatus) {
        if errors.intersects(LineStatus::ERRORS) {
            // Any write to the error clear register clears all of RSR
            self.regs.write_u32(UARTRSR, 0);
        }
    }

    fn peripheral_clock_hz(&self) -> u32 {
        self.uartclk_hz
    }

    fn divisor_range(&self) -> RangeInclusive<u32> {
        (1 << 6)..=MAX_DIVISOR
    }

    fn baud_divisor(&self, clock_hz: u32, baud: u32) -> serial_stream::Result<u32> {
        let divisor = pl011_divisor(clock_hz, baud)?;
        if self.divisor_range().contains(&divisor) {
            Ok(divisor)
        } else {
            Err(StreamError::DivisorOutOfRange { divisor })
        }
    }

    fn program(&self, divisor: u32) {
        critical_section::with(|_| {
            self.regs.write_u32(UARTCR, 0);

            // Wait for end of transmission
            while self.regs.read_u32(UARTFR) & FR_BUSY != 0 {}

            self.regs.write_u32(UARTIBRD, divisor >> 6);
            self.regs.write_u32(UARTFBRD, divisor & 0x3F);
            // LCR_H write latches the divisor; FIFOs stay off
            self.regs.write_u32(UARTLCR_H, LCR_H_WLEN_8);

            self.regs.write_u32(UARTICR, INT_ALL);
            self.regs.write_u32(UARTIMSC, INT_RX);
            self.regs.write_u32(UARTCR, CR_UARTEN | CR_TXE | CR_RXE);
        });
    }
}
