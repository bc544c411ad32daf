use core::convert::TryFrom;
use stm32ral::{flash, pwr, rcc};
use stm32ral::{modify_reg, read_reg};

use crate::clock::{
    AhbPrescaler, ApbPrescaler, ClockError, ClockHal, ClockTreeConfig, FlashLatency, HseState,
    HsiConfig, OscillatorConfig, PllConfig, PllP, PllSource, PllState, SysClkSource, VoltageScale,
};
use crate::delay::{Delay, WaitFor};

const HSE_STARTUP_TIMEOUT_MS: u32 = 100;
const HSI_TIMEOUT_MS: u32 = 2;
const PLL_TIMEOUT_MS: u32 = 2;
const CLOCK_SWITCH_TIMEOUT_MS: u32 = 5000;

/// Field-level access to the RCC, PWR and FLASH registers driven by [`RCC`]
pub trait ClockRegisters {
    fn hse_on(&self) -> bool;
    fn hse_ready(&self) -> bool;
    fn set_hse(&mut self, on: bool);

    fn hsi_on(&self) -> bool;
    fn hsi_ready(&self) -> bool;
    fn set_hsi(&mut self, on: bool);
    fn hsi_trim(&self) -> u8;
    fn set_hsi_trim(&mut self, trim: u8);

    fn pll_on(&self) -> bool;
    fn pll_ready(&self) -> bool;
    fn set_pll(&mut self, on: bool);
    /// Current PLLCFGR dividers and source
    fn pll_config(&self) -> PllConfig;
    fn set_pll_config(&mut self, pll: &PllConfig);

    /// SWS field, `None` for the reserved encoding
    fn sysclk_status(&self) -> Option<SysClkSource>;
    fn select_sysclk(&mut self, source: SysClkSource);
    fn set_ahb_prescaler(&mut self, ahb: AhbPrescaler);
    fn set_apb_prescalers(&mut self, apb1: ApbPrescaler, apb2: ApbPrescaler);

    fn flash_latency(&self) -> u8;
    fn set_flash_latency(&mut self, latency: FlashLatency);

    fn enable_power_interface(&mut self);
    fn set_voltage_scale(&mut self, scale: VoltageScale);
}

/// The STM32F411 register blocks
pub struct Registers {
    rcc: rcc::Instance,
    pwr: pwr::Instance,
    flash: flash::Instance,
}

impl Registers {
    pub fn new(rcc: rcc::Instance, pwr: pwr::Instance, flash: flash::Instance) -> Self {
        Registers { rcc, pwr, flash }
    }
}

impl ClockRegisters for Registers {
    fn hse_on(&self) -> bool {
        read_reg!(rcc, self.rcc, CR, HSEON == 1)
    }

    fn hse_ready(&self) -> bool {
        read_reg!(rcc, self.rcc, CR, HSERDY == 1)
    }

    fn set_hse(&mut self, on: bool) {
        modify_reg!(rcc, self.rcc, CR, HSEON: u32::from(on));
    }

    fn hsi_on(&self) -> bool {
        read_reg!(rcc, self.rcc, CR, HSION == 1)
    }

    fn hsi_ready(&self) -> bool {
        read_reg!(rcc, self.rcc, CR, HSIRDY == 1)
    }

    fn set_hsi(&mut self, on: bool) {
        modify_reg!(rcc, self.rcc, CR, HSION: u32::from(on));
    }

    fn hsi_trim(&self) -> u8 {
        read_reg!(rcc, self.rcc, CR, HSITRIM) as u8
    }

    fn set_hsi_trim(&mut self, trim: u8) {
        modify_reg!(rcc, self.rcc, CR, HSITRIM: u32::from(trim));
    }

    fn pll_on(&self) -> bool {
        read_reg!(rcc, self.rcc, CR, PLLON == 1)
    }

    fn pll_ready(&self) -> bool {
        read_reg!(rcc, self.rcc, CR, PLLRDY == 1)
    }

    fn set_pll(&mut self, on: bool) {
        modify_reg!(rcc, self.rcc, CR, PLLON: u32::from(on));
    }

    fn pll_config(&self) -> PllConfig {
        let (src, pllm, plln, pllp, pllq) =
            read_reg!(rcc, self.rcc, PLLCFGR, PLLSRC, PLLM, PLLN, PLLP, PLLQ);
        PllConfig {
            source: PllSource::try_from(src).unwrap_or(PllSource::Hsi),
            m: pllm,
            n: plln,
            p: PllP::from_bits(pllp),
            q: pllq,
        }
    }

    fn set_pll_config(&mut self, pll: &PllConfig) {
        let src: u32 = pll.source.into();
        let pllp: u32 = pll.p.into();
        modify_reg!(
            rcc,
            self.rcc,
            PLLCFGR,
            PLLSRC: src,
            PLLM: pll.m,
            PLLN: pll.n,
            PLLP: pllp,
            PLLQ: pll.q
        );
    }

    fn sysclk_status(&self) -> Option<SysClkSource> {
        SysClkSource::try_from(read_reg!(rcc, self.rcc, CFGR, SWS)).ok()
    }

    fn select_sysclk(&mut self, source: SysClkSource) {
        let sw: u32 = source.into();
        modify_reg!(rcc, self.rcc, CFGR, SW: sw);
    }

    fn set_ahb_prescaler(&mut self, ahb: AhbPrescaler) {
        let hpre: u32 = ahb.into();
        modify_reg!(rcc, self.rcc, CFGR, HPRE: hpre);
    }

    fn set_apb_prescalers(&mut self, apb1: ApbPrescaler, apb2: ApbPrescaler) {
        let ppre1: u32 = apb1.into();
        let ppre2: u32 = apb2.into();
        modify_reg!(rcc, self.rcc, CFGR, PPRE1: ppre1, PPRE2: ppre2);
    }

    fn flash_latency(&self) -> u8 {
        read_reg!(flash, self.flash, ACR, LATENCY) as u8
    }

    fn set_flash_latency(&mut self, latency: FlashLatency) {
        modify_reg!(flash, self.flash, ACR, LATENCY: u32::from(latency.wait_states()));
    }

    fn enable_power_interface(&mut self) {
        modify_reg!(rcc, self.rcc, APB1ENR, PWREN: 1);
        // Delay after enabling the peripheral clock
        let _ = read_reg!(rcc, self.rcc, APB1ENR);
    }

    fn set_voltage_scale(&mut self, scale: VoltageScale) {
        let vos: u32 = scale.into();
        modify_reg!(pwr, self.pwr, CR, VOS: vos);
    }
}

/// Clock controller driver.
///
/// Sequences oscillator, PLL, flash and bus changes over `regs` and uses
/// `delay` to bound every wait on a ready flag.
pub struct RCC<'a, R = Registers, W = Delay> {
    regs: R,
    delay: &'a W,
}

impl<'a, R: ClockRegisters, W: WaitFor> RCC<'a, R, W> {
    pub fn new(regs: R, delay: &'a W) -> Self {
        RCC { regs, delay }
    }

    /// True if `source` feeds SYSCLK, directly or through the PLL
    fn drives_sysclk(&self, source: PllSource) -> bool {
        match (self.regs.sysclk_status(), source) {
            (Some(SysClkSource::Hse), PllSource::Hse) => true,
            (Some(SysClkSource::Hsi), PllSource::Hsi) => true,
            (Some(SysClkSource::Pll), source) => self.regs.pll_config().source == source,
            _ => false,
        }
    }

    fn wait<F>(&self, timeout_ms: u32, err: ClockError, ready: F) -> Result<(), ClockError>
    where
        F: Fn(&R) -> bool,
    {
        let regs = &self.regs;
        if self.delay.wait_for(timeout_ms, || ready(regs)) {
            Ok(())
        } else {
            Err(err)
        }
    }

    fn configure_hse(&mut self, state: HseState) -> Result<(), ClockError> {
        if self.drives_sysclk(PllSource::Hse) {
            return match state {
                HseState::On => Ok(()),
                HseState::Off => Err(ClockError::OscillatorInUse),
            };
        }

        let on = state == HseState::On;
        self.regs.set_hse(on);
        self.wait(HSE_STARTUP_TIMEOUT_MS, ClockError::HseTimeout, |r| {
            r.hse_ready() == on
        })
    }

    fn configure_hsi(&mut self, config: HsiConfig) -> Result<(), ClockError> {
        if self.drives_sysclk(PllSource::Hsi) {
            if !config.on {
                return Err(ClockError::OscillatorInUse);
            }
            // Only the trim can change while HSI is in use
            self.regs.set_hsi_trim(config.calibration);
            return Ok(());
        }

        self.regs.set_hsi(config.on);
        self.wait(HSI_TIMEOUT_MS, ClockError::HsiTimeout, |r| {
            r.hsi_ready() == config.on
        })?;
        if config.on {
            self.regs.set_hsi_trim(config.calibration);
        }
        Ok(())
    }

    fn configure_pll(&mut self, state: PllState) -> Result<(), ClockError> {
        let pll = match state {
            PllState::None => return Ok(()),
            PllState::Off => None,
            PllState::On(pll) => Some(pll),
        };

        // The PLL must be stopped before its dividers change
        self.regs.set_pll(false);
        self.wait(PLL_TIMEOUT_MS, ClockError::PllTimeout, |r| !r.pll_ready())?;

        if let Some(pll) = pll {
            self.regs.set_pll_config(&pll);
            self.regs.set_pll(true);
            self.wait(PLL_TIMEOUT_MS, ClockError::PllTimeout, |r| r.pll_ready())?;
        }

        Ok(())
    }

    fn set_flash_latency(&mut self, latency: FlashLatency) -> Result<(), ClockError> {
        self.regs.set_flash_latency(latency);
        // Takes effect only once it reads back
        if self.regs.flash_latency() == latency.wait_states() {
            Ok(())
        } else {
            Err(ClockError::LatencyRejected)
        }
    }
}

impl<'a, R: ClockRegisters, W: WaitFor> ClockHal for RCC<'a, R, W> {
    fn enable_power_scaling(&mut self, scale: VoltageScale) {
        self.regs.enable_power_interface();
        self.regs.set_voltage_scale(scale);
    }

    fn oscillator_config(&self) -> OscillatorConfig {
        let hse = if self.regs.hse_on() {
            HseState::On
        } else {
            HseState::Off
        };
        let hsi = HsiConfig {
            on: self.regs.hsi_on(),
            calibration: self.regs.hsi_trim(),
        };
        let pll = if self.regs.pll_on() {
            PllState::On(self.regs.pll_config())
        } else {
            PllState::Off
        };

        OscillatorConfig {
            hse: Some(hse),
            hsi: Some(hsi),
            pll,
        }
    }

    fn configure_oscillators(&mut self, config: &OscillatorConfig) -> Result<(), ClockError> {
        // Reject a bad PLL request before touching any oscillator
        match config.pll {
            PllState::None => (),
            PllState::Off | PllState::On(_)
                if self.regs.sysclk_status() == Some(SysClkSource::Pll) =>
            {
                return Err(ClockError::OscillatorInUse);
            }
            PllState::Off => (),
            PllState::On(pll) => pll.validate()?,
        }

        if let Some(hse) = config.hse {
            self.configure_hse(hse)?;
        }
        if let Some(hsi) = config.hsi {
            self.configure_hsi(hsi)?;
        }
        self.configure_pll(config.pll)
    }

    fn configure_clock_tree(
        &mut self,
        config: &ClockTreeConfig,
        latency: FlashLatency,
    ) -> Result<(), ClockError> {
        let current = self.regs.flash_latency();
        let target = latency.wait_states();

        // More wait states before speeding up
        if target > current {
            self.set_flash_latency(latency)?;
        }

        // Keep the APB clocks slowest while HCLK changes
        self.regs.set_apb_prescalers(ApbPrescaler::Div16, ApbPrescaler::Div16);
        self.regs.set_ahb_prescaler(config.ahb);

        let ready = match config.sysclk_source {
            SysClkSource::Hsi => self.regs.hsi_ready(),
            SysClkSource::Hse => self.regs.hse_ready(),
            SysClkSource::Pll => self.regs.pll_ready(),
        };
        if !ready {
            return Err(ClockError::SourceNotReady);
        }

        let source = config.sysclk_source;
        self.regs.select_sysclk(source);
        self.wait(CLOCK_SWITCH_TIMEOUT_MS, ClockError::SwitchTimeout, |r| {
            r.sysclk_status() == Some(source)
        })?;

        // Fewer wait states only after slowing down
        if target < current {
            self.set_flash_latency(latency)?;
        }

        self.regs.set_apb_prescalers(config.apb1, config.apb2);

        Ok(())
    }
}
