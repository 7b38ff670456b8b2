//! STM32 USART (ISR/ICR register layout) and board platform
//!
//! Reference: STM32F7 reference manual RM0385, sections USART, GPIO, RCC and
//! the Cortex-M7 NVIC.

use bitflags::bitflags;
use log::debug;
use serial_stream::{LineStatus, Platform, PlatformError, SerialHardware};

use crate::mmio::MmioRegion;
use crate::{DriverError, Result};

/// USART register offsets
const CR1: usize = 0x00; // Control register 1
const CR3: usize = 0x08; // Control register 3
const BRR: usize = 0x0C; // Baud rate register
const ISR: usize = 0x1C; // Interrupt and status register
const ICR: usize = 0x20; // Interrupt flag clear register
const RDR: usize = 0x24; // Receive data register
const TDR: usize = 0x28; // Transmit data register
const USART_BLOCK_SIZE: usize = 0x400;

/// CR3 bits
const CR3_OVRDIS: u32 = 1 << 12; // Overrun detection disabled

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Cr1: u32 {
        const UE = 1 << 0;
        const RE = 1 << 2;
        const TE = 1 << 3;
        const RXNEIE = 1 << 5;
        const TXEIE = 1 << 7;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Isr: u32 {
        const PE = 1 << 0;
        const FE = 1 << 1;
        const NF = 1 << 2;
        const ORE = 1 << 3;
        const RXNE = 1 << 5;
        const TC = 1 << 6;
        const TXE = 1 << 7;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Icr: u32 {
        const PECF = 1 << 0;
        const FECF = 1 << 1;
        const NCF = 1 << 2;
        const ORECF = 1 << 3;
    }
}

/// STM32 USART driver
pub struct Stm32Usart {
    regs: MmioRegion,
    pclk_hz: fn() -> u32,
}

impl Stm32Usart {
    /// Create a driver for the USART at `base`, clocked from `pclk_hz`
    ///
    /// `pclk_hz` is queried on every divisor computation, so a clock tree
    /// change is picked up by the next baud rate change.
    ///
    /// # Safety
    /// The caller must ensure that `base` points to valid USART MMIO registers
    pub const unsafe fn new(base: usize, pclk_hz: fn() -> u32) -> Self {
        Self {
            regs: MmioRegion::new(base, USART_BLOCK_SIZE),
            pclk_hz,
        }
    }

    fn cr1(&self) -> Cr1 {
        Cr1::from_bits_retain(self.regs.read_u32(CR1))
    }

    fn modify_cr1(&self, flag: Cr1, set: bool) {
        if set {
            self.regs.modify_u32(CR1, 0, flag.bits());
        } else {
            self.regs.modify_u32(CR1, flag.bits(), 0);
        }
    }
}

impl SerialHardware for Stm32Usart {
    fn status(&self) -> LineStatus {
        let isr = Isr::from_bits_truncate(self.regs.read_u32(ISR));
        let mut status = LineStatus::empty();

        status.set(LineStatus::RX_READY, isr.contains(Isr::RXNE));
        status.set(LineStatus::TX_READY, isr.contains(Isr::TXE));
        status.set(LineStatus::TX_COMPLETE, isr.contains(Isr::TC));
        status.set(LineStatus::OVERRUN, isr.contains(Isr::ORE));
        status.set(LineStatus::FRAMING, isr.intersects(Isr::FE | Isr::PE));
        status.set(LineStatus::NOISE, isr.contains(Isr::NF));
        status
    }

    fn read_data(&self) -> u8 {
        (self.regs.read_u32(RDR) & 0xFF) as u8
    }

    fn write_data(&self, byte: u8) {
        self.regs.write_u32(TDR, byte as u32);
    }

    fn set_tx_interrupt(&self, armed: bool) {
        self.modify_cr1(Cr1::TXEIE, armed);
    }

    fn tx_interrupt_armed(&self) -> bool {
        self.cr1().contains(Cr1::TXEIE)
    }

    fn set_rx_interrupt(&self, enabled: bool) {
        self.modify_cr1(Cr1::RXNEIE, enabled);
    }

    fn rx_interrupt_enabled(&self) -> bool {
        self.cr1().contains(Cr1::RXNEIE)
    }

    fn clear_errors(&self, errors: LineStatus) {
        let mut icr = Icr::empty();
        icr.set(Icr::ORECF, errors.contains(LineStatus::OVERRUN));
        icr.set(Icr::FECF | Icr::PECF, errors.contains(LineStatus::FRAMING));
        icr.set(Icr::NCF, errors.contains(LineStatus::NOISE));

        if !icr.is_empty() {
            self.regs.write_u32(ICR, icr.bits());
        }
    }

    fn peripheral_clock_hz(&self) -> u32 {
        (self.pclk_hz)()
    }

    fn program(&self, divisor: u32) {
        critical_section::with(|_| {
            // BRR is only writable with UE cleared
            self.regs.write_u32(CR1, (Cr1::RE | Cr1::TE).bits());
            self.regs.write_u32(CR3, CR3_OVRDIS);
            self.regs.write_u32(BRR, divisor);
            self.regs
                .write_u32(CR1, (Cr1::RE | Cr1::TE | Cr1::UE | Cr1::RXNEIE).bits());
        });
    }
}

/// Cortex-M NVIC register block (ISER0)
pub const NVIC_BASE: usize = 0xE000_E100;
const NVIC_BLOCK_SIZE: usize = 0x400;
const NVIC_ISER: usize = 0x000;
const NVIC_IPR: usize = 0x300;
const NVIC_IRQ_COUNT: u16 = 240;

/// Implemented priority bits on STM32 parts
const NVIC_PRIO_BITS: u8 = 4;

/// GPIO register offsets
const GPIO_MODER: usize = 0x00;
const GPIO_OTYPER: usize = 0x04;
const GPIO_OSPEEDR: usize = 0x08;
const GPIO_PUPDR: usize = 0x0C;
const GPIO_AFRL: usize = 0x20;
const GPIO_BLOCK_SIZE: usize = 0x400;

const MODE_ALTERNATE: u32 = 0b10;
const SPEED_VERY_HIGH: u32 = 0b11;

/// One RCC enable bit (`offset` is the ENR register within RCC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockEnable {
    pub offset: usize,
    pub mask: u32,
}

/// A pin switched to a USART alternate function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AltFunctionPin {
    pub port_base: usize,
    pub pin: u8,
    pub af: u8,
}

/// Clock gating, pin muxing and interrupt registration for one USART
pub struct Stm32Platform {
    rcc: MmioRegion,
    nvic: MmioRegion,
    clocks: &'static [ClockEnable],
    pins: &'static [AltFunctionPin],
    irq: u16,
}

impl Stm32Platform {
    /// # Safety
    /// `rcc_base`, `nvic_base` and every `port_base` in `pins` must point to
    /// the corresponding valid MMIO register blocks
    pub const unsafe fn new(
        rcc_base: usize,
        nvic_base: usize,
        clocks: &'static [ClockEnable],
        pins: &'static [AltFunctionPin],
        irq: u16,
    ) -> Self {
        Self {
            rcc: MmioRegion::new(rcc_base, 0x100),
            nvic: MmioRegion::new(nvic_base, NVIC_BLOCK_SIZE),
            clocks,
            pins,
            irq,
        }
    }

    fn configure_pin(&self, pin: &AltFunctionPin) -> Result<()> {
        if pin.pin >= 16 {
            return Err(DriverError::InvalidPin { pin: pin.pin });
        }
        if pin.af >= 16 {
            return Err(DriverError::InvalidAltFunction { af: pin.af });
        }

        // SAFETY: port bases are covered by the constructor's contract
        let gpio = unsafe { MmioRegion::new(pin.port_base, GPIO_BLOCK_SIZE) };
        let n = pin.pin as usize;
        let two_bits = 0b11 << (n * 2);

        gpio.modify_u32(GPIO_MODER, two_bits, MODE_ALTERNATE << (n * 2));
        gpio.modify_u32(GPIO_OTYPER, 1 << n, 0);
        gpio.modify_u32(GPIO_OSPEEDR, two_bits, SPEED_VERY_HIGH << (n * 2));
        gpio.modify_u32(GPIO_PUPDR, two_bits, 0);

        let afr = GPIO_AFRL + (n / 8) * 4;
        let shift = (n % 8) * 4;
        gpio.modify_u32(afr, 0xF << shift, (pin.af as u32) << shift);
        Ok(())
    }

    fn enable_irq(&self, priority: u8) -> Result<()> {
        if priority >= 1 << NVIC_PRIO_BITS {
            return Err(DriverError::PriorityOutOfRange { priority });
        }
        if self.irq >= NVIC_IRQ_COUNT {
            return Err(DriverError::InvalidIrq { irq: self.irq });
        }

        let irq = self.irq as usize;
        self.nvic
            .write_u8(NVIC_IPR + irq, priority << (8 - NVIC_PRIO_BITS));
        self.nvic
            .write_u32(NVIC_ISER + (irq / 32) * 4, 1 << (irq % 32));
        Ok(())
    }
}

impl Platform for Stm32Platform {
    fn enable_peripheral(&self) -> core::result::Result<(), PlatformError> {
        for clock in self.clocks {
            self.rcc.modify_u32(clock.offset, 0, clock.mask);
        }
        for pin in self.pins {
            self.configure_pin(pin)?;
        }

        debug!(
            "[stm32] {} clock enables, {} pins muxed",
            self.clocks.len(),
            self.pins.len()
        );
        Ok(())
    }

    fn register_interrupt(&self, priority: u8) -> core::result::Result<(), PlatformError> {
        self.enable_irq(priority)?;
        debug!("[stm32] IRQ {} enabled at priority {}", self.irq, priority);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_stream::{IoStream, NeverWait, NoPlatform, PortConfig, SerialState, StreamPort};
    use std::boxed::Box;

    /// Plain memory standing in for a register block
    fn fake_block(words: usize) -> &'static mut [u32] {
        Box::leak(std::vec![0u32; words].into_boxed_slice())
    }

    fn usart(block: &mut [u32]) -> Stm32Usart {
        fn pclk() -> u32 {
            108_000_000
        }
        unsafe { Stm32Usart::new(block.as_mut_ptr() as usize, pclk) }
    }

    #[test]
    fn test_program_sets_divisor_and_enables() {
        let block = fake_block(USART_BLOCK_SIZE / 4);
        let uart = usart(block);

        let divisor = uart
            .baud_divisor(uart.peripheral_clock_hz(), 115_200)
            .unwrap();
        assert_eq!(divisor, 938);
        uart.set_tx_interrupt(true);
        uart.program(divisor);

        assert_eq!(uart.regs.read_u32(BRR), 938);
        assert_eq!(uart.regs.read_u32(CR3), CR3_OVRDIS);
        assert!(uart.rx_interrupt_enabled());
        assert!(!uart.tx_interrupt_armed());
        assert!(uart.cr1().contains(Cr1::UE | Cr1::RE | Cr1::TE));
    }

    #[test]
    fn test_status_translation() {
        let block = fake_block(USART_BLOCK_SIZE / 4);
        let uart = usart(block);

        uart.regs
            .write_u32(ISR, (Isr::RXNE | Isr::TXE | Isr::ORE | Isr::PE).bits());
        let status = uart.status();

        assert!(status.contains(LineStatus::RX_READY | LineStatus::TX_READY));
        assert!(status.contains(LineStatus::OVERRUN | LineStatus::FRAMING));
        assert!(!status.contains(LineStatus::TX_COMPLETE));
        assert!(!status.contains(LineStatus::NOISE));
    }

    #[test]
    fn test_interrupt_arming_is_read_modify_write() {
        let block = fake_block(USART_BLOCK_SIZE / 4);
        let uart = usart(block);
        uart.program(938);

        uart.set_tx_interrupt(true);
        assert!(uart.tx_interrupt_armed());
        assert!(uart.rx_interrupt_enabled());

        uart.set_rx_interrupt(false);
        assert!(uart.tx_interrupt_armed());
        assert!(!uart.rx_interrupt_enabled());
        assert!(uart.cr1().contains(Cr1::UE));
    }

    #[test]
    fn test_tx_count_includes_byte_in_shift_register() {
        let block = fake_block(USART_BLOCK_SIZE / 4);
        let uart = usart(block);
        let state: SerialState<16, 8> = SerialState::new();
        let port = StreamPort::new(&state, &uart, NeverWait, PortConfig::default());
        port.init(&NoPlatform).unwrap();

        // TDR empty but the last byte is still being shifted out
        uart.regs.write_u32(ISR, Isr::TXE.bits());
        assert_eq!(port.tx_count(), 1);

        assert!(port.write_string("ok"));
        assert_eq!(port.tx_count(), 3);

        uart.regs.write_u32(ISR, (Isr::TXE | Isr::TC).bits());
        assert_eq!(port.tx_count(), 2);
    }

    #[test]
    fn test_clear_errors_writes_icr() {
        let block = fake_block(USART_BLOCK_SIZE / 4);
        let uart = usart(block);

        uart.clear_errors(LineStatus::OVERRUN | LineStatus::NOISE);
        assert_eq!(uart.regs.read_u32(ICR), (Icr::ORECF | Icr::NCF).bits());
    }

    #[test]
    fn test_data_registers() {
        let block = fake_block(USART_BLOCK_SIZE / 4);
        let uart = usart(block);

        uart.regs.write_u32(RDR, 0x1_47);
        assert_eq!(uart.read_data(), 0x47);
        uart.write_data(b'o');
        assert_eq!(uart.regs.read_u32(TDR), b'o' as u32);
    }

    #[test]
    fn test_platform_setup() {
        static CLOCKS: [ClockEnable; 2] = [
            ClockEnable { offset: 0x40, mask: 1 << 18 },
            ClockEnable { offset: 0x30, mask: 1 << 3 },
        ];
        let rcc = fake_block(0x100 / 4);
        let nvic = fake_block(NVIC_BLOCK_SIZE / 4);
        let gpio = fake_block(GPIO_BLOCK_SIZE / 4);

        let gpio_base = gpio.as_mut_ptr() as usize;
        let pins: &'static [AltFunctionPin] = Box::leak(Box::new([
            AltFunctionPin { port_base: gpio_base, pin: 8, af: 7 },
            AltFunctionPin { port_base: gpio_base, pin: 9, af: 7 },
        ]));

        // USART3 on a NUCLEO-F756 board
        let platform = unsafe {
            Stm32Platform::new(
                rcc.as_mut_ptr() as usize,
                nvic.as_mut_ptr() as usize,
                &CLOCKS,
                pins,
                39,
            )
        };

        platform.enable_peripheral().unwrap();
        platform.register_interrupt(2).unwrap();

        assert_eq!(platform.rcc.read_u32(0x40), 1 << 18);
        assert_eq!(platform.rcc.read_u32(0x30), 1 << 3);

        let port = unsafe { MmioRegion::new(gpio_base, GPIO_BLOCK_SIZE) };
        assert_eq!(port.read_u32(GPIO_MODER), 0b1010 << 16);
        assert_eq!(port.read_u32(GPIO_OSPEEDR), 0b1111 << 16);
        assert_eq!(port.read_u32(GPIO_AFRL + 4), 0x77);

        assert_eq!(platform.nvic.read_u8(NVIC_IPR + 39), 2 << 4);
        assert_eq!(platform.nvic.read_u32(NVIC_ISER + 4), 1 << 7);
    }

    #[test]
    fn test_platform_rejects_bad_priority() {
        let rcc = fake_block(0x100 / 4);
        let nvic = fake_block(NVIC_BLOCK_SIZE / 4);
        let platform = unsafe {
            Stm32Platform::new(rcc.as_mut_ptr() as usize, nvic.as_mut_ptr() as usize, &[], &[], 37)
        };

        assert_eq!(
            platform.register_interrupt(16),
            Err(PlatformError("interrupt priority out of range"))
        );
        assert_eq!(
            platform.enable_irq(16),
            Err(DriverError::PriorityOutOfRange { priority: 16 })
        );
        assert_eq!(platform.nvic.read_u32(NVIC_ISER + 4), 0);
    }
}
