//! Power-on reset of the clock controller.

use cortex_m::peripheral::SCB;
use stm32ral::rcc;
use stm32ral::rcc::CR::{CSSON, HSEBYP, HSEON, HSION, PLLON};
use stm32ral::{read_reg, write_reg};

/// CP10 and CP11 full access in CPACR
pub const CPACR_FPU_FULL_ACCESS: u32 = (0b11 << (10 * 2)) | (0b11 << (11 * 2));

/// Documented reset value of RCC_PLLCFGR
pub const PLLCFGR_RESET: u32 = 0x2400_3010;

/// Registers touched by [`system_init`]
pub trait ResetRegisters {
    fn cr(&self) -> u32;
    fn set_cr(&mut self, value: u32);
    fn set_cfgr(&mut self, value: u32);
    fn set_pllcfgr(&mut self, value: u32);
    fn set_cir(&mut self, value: u32);
    fn cpacr(&self) -> u32;
    fn set_cpacr(&mut self, value: u32);
}

/// Reset the clock controller to its power-on state and enable the FPU.
///
/// Leaves the core running from HSI with the PLL, HSE and clock security
/// system off and all clock interrupts masked. Call once, before any clock
/// configuration.
pub fn system_init<R: ResetRegisters>(regs: &mut R) {
    regs.set_cpacr(regs.cpacr() | CPACR_FPU_FULL_ACCESS);

    regs.set_cr(regs.cr() | HSION::mask);
    regs.set_cfgr(0);
    regs.set_cr(regs.cr() & !(HSEON::mask | CSSON::mask | PLLON::mask));
    regs.set_pllcfgr(PLLCFGR_RESET);
    // HSEBYP can only be written once HSE is off
    regs.set_cr(regs.cr() & !HSEBYP::mask);
    regs.set_cir(0);
}

/// Hardware RCC and SCB registers
pub struct SystemRegisters {
    rcc: &'static rcc::RegisterBlock,
}

impl SystemRegisters {
    /// Unsafety: aliases the RCC register block. Only use before any
    /// driver has taken the RCC instance, e.g. from `pre_init`.
    pub unsafe fn steal() -> Self {
        SystemRegisters { rcc: &*rcc::RCC }
    }
}

impl ResetRegisters for SystemRegisters {
    fn cr(&self) -> u32 {
        read_reg!(rcc, self.rcc, CR)
    }

    fn set_cr(&mut self, value: u32) {
        write_reg!(rcc, self.rcc, CR, value);
    }

    fn set_cfgr(&mut self, value: u32) {
        write_reg!(rcc, self.rcc, CFGR, value);
    }

    fn set_pllcfgr(&mut self, value: u32) {
        write_reg!(rcc, self.rcc, PLLCFGR, value);
    }

    fn set_cir(&mut self, value: u32) {
        write_reg!(rcc, self.rcc, CIR, value);
    }

    fn cpacr(&self) -> u32 {
        unsafe { (*SCB::PTR).cpacr.read() }
    }

    fn set_cpacr(&mut self, value: u32) {
        unsafe { (*SCB::PTR).cpacr.write(value) }
    }
}
