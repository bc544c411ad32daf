//! Clock configuration records and the hardware capability set used to apply them.
//!
//! The records mirror what the RCC peripheral can be asked to do: an
//! [`OscillatorConfig`] turns oscillators and the main PLL on or off, and a
//! [`ClockTreeConfig`] selects the system clock and the bus dividers.
//! [`ClockHal`] is implemented by [`crate::rcc::RCC`] on hardware and by
//! mocks in tests.

use core::convert::TryFrom;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Frequency of the external crystal fitted to the board
pub const HSE_HZ: u32 = 25_000_000;

/// Frequency of the internal RC oscillator
pub const HSI_HZ: u32 = 16_000_000;

/// Factory HSI trim, the middle of the 5-bit range
pub const HSI_CALIBRATION_DEFAULT: u8 = 16;

/// Maximum PLLCLK (and SYSCLK) of the STM32F411
pub const SYSCLK_MAX_HZ: u32 = 100_000_000;

const VCO_INPUT_MIN_HZ: u32 = 950_000;
const VCO_INPUT_MAX_HZ: u32 = 2_100_000;
const VCO_OUTPUT_MIN_HZ: u64 = 100_000_000;
const VCO_OUTPUT_MAX_HZ: u64 = 432_000_000;

/// HCLK step covered by each flash wait state at 2.7 to 3.6 V
const FLASH_WAIT_STATE_STEP_HZ: u32 = 30_000_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HseState {
    Off,
    On,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HsiConfig {
    pub on: bool,
    /// HSITRIM value, 0..=31
    pub calibration: u8,
}

impl Default for HsiConfig {
    fn default() -> Self {
        HsiConfig {
            on: true,
            calibration: HSI_CALIBRATION_DEFAULT,
        }
    }
}

/// PLL input clock, encoded as the PLLSRC bit
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum PllSource {
    Hsi = 0,
    Hse = 1,
}

impl PllSource {
    pub fn frequency(self) -> u32 {
        match self {
            PllSource::Hsi => HSI_HZ,
            PllSource::Hse => HSE_HZ,
        }
    }
}

/// Main PLL output divider, encoded as the PLLP field
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum PllP {
    Div2 = 0b00,
    Div4 = 0b01,
    Div6 = 0b10,
    Div8 = 0b11,
}

impl PllP {
    pub fn divisor(self) -> u32 {
        match self {
            PllP::Div2 => 2,
            PllP::Div4 => 4,
            PllP::Div6 => 6,
            PllP::Div8 => 8,
        }
    }

    /// Decode the 2-bit PLLP field. Every encoding is valid.
    pub fn from_bits(bits: u32) -> Self {
        PllP::try_from(bits & 0b11).unwrap_or(PllP::Div2)
    }
}

/// Which PLL limit a configuration violates
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PllError {
    DividerM,
    MultiplierN,
    DividerQ,
    VcoInput,
    VcoOutput,
    Output,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PllConfig {
    pub source: PllSource,
    pub m: u32,
    pub n: u32,
    pub p: PllP,
    pub q: u32,
}

impl PllConfig {
    /// VCO output frequency in Hz.
    ///
    /// Computed as `input * N / M` in 64 bits so a fractional VCO input
    /// (25 MHz / 15) still lands on the exact output frequency.
    pub fn vco_hz(&self) -> u64 {
        if self.m == 0 {
            return 0;
        }
        self.source.frequency() as u64 * self.n as u64 / self.m as u64
    }

    /// Main PLL output (PLLCLK) in Hz
    pub fn pllclk_hz(&self) -> u32 {
        (self.vco_hz() / self.p.divisor() as u64) as u32
    }

    /// PLL48CLK output (USB, SDIO, RNG) in Hz
    pub fn pll48_hz(&self) -> u32 {
        if self.q == 0 {
            return 0;
        }
        (self.vco_hz() / self.q as u64) as u32
    }

    /// Check the divider ranges and the VCO and output frequency limits.
    pub fn validate(&self) -> Result<(), PllError> {
        if !(2..=63).contains(&self.m) {
            return Err(PllError::DividerM);
        }
        if !(50..=432).contains(&self.n) {
            return Err(PllError::MultiplierN);
        }
        if !(2..=15).contains(&self.q) {
            return Err(PllError::DividerQ);
        }
        let vco_in = self.source.frequency() / self.m;
        if !(VCO_INPUT_MIN_HZ..=VCO_INPUT_MAX_HZ).contains(&vco_in) {
            return Err(PllError::VcoInput);
        }
        if !(VCO_OUTPUT_MIN_HZ..=VCO_OUTPUT_MAX_HZ).contains(&self.vco_hz()) {
            return Err(PllError::VcoOutput);
        }
        if self.pllclk_hz() > SYSCLK_MAX_HZ {
            return Err(PllError::Output);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PllState {
    /// Leave the PLL as it is
    None,
    Off,
    On(PllConfig),
}

/// Oscillator request. `None` fields are left untouched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OscillatorConfig {
    pub hse: Option<HseState>,
    pub hsi: Option<HsiConfig>,
    pub pll: PllState,
}

/// System clock source, encoded as the SW/SWS field
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum SysClkSource {
    Hsi = 0b00,
    Hse = 0b01,
    Pll = 0b10,
}

/// HCLK divider, encoded as the HPRE field
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum AhbPrescaler {
    Div1 = 0b0000,
    Div2 = 0b1000,
    Div4 = 0b1001,
    Div8 = 0b1010,
    Div16 = 0b1011,
    Div64 = 0b1100,
    Div128 = 0b1101,
    Div256 = 0b1110,
    Div512 = 0b1111,
}

impl AhbPrescaler {
    pub fn divisor(self) -> u32 {
        match self {
            AhbPrescaler::Div1 => 1,
            AhbPrescaler::Div2 => 2,
            AhbPrescaler::Div4 => 4,
            AhbPrescaler::Div8 => 8,
            AhbPrescaler::Div16 => 16,
            AhbPrescaler::Div64 => 64,
            AhbPrescaler::Div128 => 128,
            AhbPrescaler::Div256 => 256,
            AhbPrescaler::Div512 => 512,
        }
    }
}

/// PCLK1/PCLK2 divider, encoded as the PPRE1/PPRE2 fields
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ApbPrescaler {
    Div1 = 0b000,
    Div2 = 0b100,
    Div4 = 0b101,
    Div8 = 0b110,
    Div16 = 0b111,
}

impl ApbPrescaler {
    pub fn divisor(self) -> u32 {
        match self {
            ApbPrescaler::Div1 => 1,
            ApbPrescaler::Div2 => 2,
            ApbPrescaler::Div4 => 4,
            ApbPrescaler::Div8 => 8,
            ApbPrescaler::Div16 => 16,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClockTreeConfig {
    pub sysclk_source: SysClkSource,
    pub ahb: AhbPrescaler,
    pub apb1: ApbPrescaler,
    pub apb2: ApbPrescaler,
}

/// Number of flash wait states, 0..=7
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct FlashLatency(u8);

impl FlashLatency {
    pub const MAX: FlashLatency = FlashLatency(7);

    pub fn new(wait_states: u8) -> Option<Self> {
        if wait_states <= Self::MAX.0 {
            Some(FlashLatency(wait_states))
        } else {
            None
        }
    }

    /// Wait states required to run the flash at `hclk` Hz from a 2.7 to 3.6 V supply.
    pub fn for_hclk(hclk: u32) -> Self {
        let steps = hclk.saturating_sub(1) / FLASH_WAIT_STATE_STEP_HZ;
        FlashLatency(steps.min(Self::MAX.0 as u32) as u8)
    }

    pub fn wait_states(self) -> u8 {
        self.0
    }
}

/// Main regulator output voltage scale, encoded as the VOS field
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive)]
#[repr(u32)]
pub enum VoltageScale {
    Scale3 = 0b01,
    Scale2 = 0b10,
    Scale1 = 0b11,
}

/// Reasons the clock hardware refuses a request
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClockError {
    HseTimeout,
    HsiTimeout,
    PllTimeout,
    SwitchTimeout,
    InvalidPll(PllError),
    /// The oscillator or PLL drives SYSCLK and can't be changed
    OscillatorInUse,
    /// The requested SYSCLK source isn't running
    SourceNotReady,
    /// Flash latency didn't read back as written
    LatencyRejected,
}

impl From<PllError> for ClockError {
    fn from(e: PllError) -> Self {
        ClockError::InvalidPll(e)
    }
}

/// Resolved bus frequencies in Hz
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Clocks {
    sysclk: u32,
    hclk: u32,
    pclk1: u32,
    pclk2: u32,
    pll48: Option<u32>,
}

impl Clocks {
    /// Frequencies produced by `tree` when SYSCLK runs at `sysclk`.
    pub fn from_tree(sysclk: u32, pll48: Option<u32>, tree: &ClockTreeConfig) -> Self {
        let hclk = sysclk / tree.ahb.divisor();
        Clocks {
            sysclk,
            hclk,
            pclk1: hclk / tree.apb1.divisor(),
            pclk2: hclk / tree.apb2.divisor(),
            pll48,
        }
    }

    pub fn sysclk(&self) -> u32 {
        self.sysclk
    }

    pub fn hclk(&self) -> u32 {
        self.hclk
    }

    pub fn pclk1(&self) -> u32 {
        self.pclk1
    }

    pub fn pclk2(&self) -> u32 {
        self.pclk2
    }

    pub fn pll48(&self) -> Option<u32> {
        self.pll48
    }
}

/// Capability set of the clock hardware.
///
/// Implementations must never partially apply an oscillator request: a
/// rejected PLL configuration leaves the PLL as it was.
pub trait ClockHal {
    /// Enable the power controller clock and select the regulator scale.
    fn enable_power_scaling(&mut self, scale: VoltageScale);

    /// Read the current oscillator and PLL state.
    fn oscillator_config(&self) -> OscillatorConfig;

    fn configure_oscillators(&mut self, config: &OscillatorConfig) -> Result<(), ClockError>;

    /// Switch SYSCLK and program the bus dividers, adjusting flash wait states around the switch.
    fn configure_clock_tree(
        &mut self,
        config: &ClockTreeConfig,
        latency: FlashLatency,
    ) -> Result<(), ClockError>;
}
