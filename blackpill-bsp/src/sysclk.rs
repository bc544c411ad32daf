//! Boot-time system clock selection.
//!
//! The sequencer tries the PLL from the external crystal first and falls
//! back to the PLL from the internal oscillator. Which of the two paths
//! exist is chosen by the caller through [`ClockSources`]; with USB
//! required the PLL dividers are picked so the Q output is exactly 48 MHz.
//!
//! | path | USB | SYSCLK  | HCLK    | PCLK1  | PCLK2   |
//! |------|-----|---------|---------|--------|---------|
//! | HSE  | no  | 100 MHz | 100 MHz | 50 MHz | 100 MHz |
//! | HSE  | yes | 60 MHz  | 60 MHz  | 30 MHz | 60 MHz  |
//! | HSI  | no  | 100 MHz | 100 MHz | 50 MHz | 100 MHz |
//! | HSI  | yes | 96 MHz  | 96 MHz  | 48 MHz | 96 MHz  |

use crate::clock::{
    AhbPrescaler, ApbPrescaler, ClockError, ClockHal, ClockTreeConfig, Clocks, FlashLatency,
    HseState, HsiConfig, OscillatorConfig, PllConfig, PllP, PllSource, PllState, SysClkSource,
    VoltageScale,
};

/// Set of PLL reference oscillators the sequencer may try
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClockSources(u8);

impl ClockSources {
    pub const NONE: ClockSources = ClockSources(0);
    /// Internal 16 MHz oscillator
    pub const HSI: ClockSources = ClockSources(0x2);
    /// External 25 MHz crystal
    pub const HSE: ClockSources = ClockSources(0x4);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: ClockSources) -> Self {
        ClockSources(self.0 | other.0)
    }

    pub const fn contains(self, other: ClockSources) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SysClockConfig {
    pub sources: ClockSources,
    /// Require a 48 MHz PLL48CLK for USB
    pub usb: bool,
}

/// Which configuration path produced the running clocks
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClockPath {
    ExternalCrystal,
    InternalOscillator,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Outcome {
    pub path: ClockPath,
    pub clocks: Clocks,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetSysClockError {
    /// Every enabled path failed, or none was enabled.
    ///
    /// Each field is `None` when the path was not enabled.
    ConfigurationExhausted {
        hse: Option<ClockError>,
        hsi: Option<ClockError>,
    },
}

/// Bus dividers used by both paths
pub const CLOCK_TREE: ClockTreeConfig = ClockTreeConfig {
    sysclk_source: SysClkSource::Pll,
    ahb: AhbPrescaler::Div1,
    apb1: ApbPrescaler::Div2,
    apb2: ApbPrescaler::Div1,
};

/// Regulator scale 2, rated for HCLK up to 84 MHz
pub const VOLTAGE_SCALE: VoltageScale = VoltageScale::Scale2;

/// PLL dividers for the 25 MHz crystal.
pub fn hse_pll(usb: bool) -> PllConfig {
    if usb {
        // 25 MHz / 15 * 144 = 240 MHz VCO, /4 = 60 MHz, /5 = 48 MHz
        PllConfig {
            source: PllSource::Hse,
            m: 15,
            n: 144,
            p: PllP::Div4,
            q: 5,
        }
    } else {
        // 25 MHz / 12 * 96 = 200 MHz VCO, /2 = 100 MHz, /5 = 40 MHz
        PllConfig {
            source: PllSource::Hse,
            m: 12,
            n: 96,
            p: PllP::Div2,
            q: 5,
        }
    }
}

/// PLL dividers for the 16 MHz internal oscillator.
pub fn hsi_pll(usb: bool) -> PllConfig {
    // 16 MHz / 8 = 2 MHz VCO input; 384 MHz VCO gives 96/48 MHz, 400 MHz gives 100/50 MHz
    PllConfig {
        source: PllSource::Hsi,
        m: 8,
        n: if usb { 192 } else { 200 },
        p: PllP::Div4,
        q: 8,
    }
}

pub struct Sequencer {
    config: SysClockConfig,
}

impl Sequencer {
    pub fn new(config: SysClockConfig) -> Self {
        Sequencer { config }
    }

    pub fn config(&self) -> &SysClockConfig {
        &self.config
    }

    /// Configure SYSCLK from the first enabled path that succeeds.
    ///
    /// Expects the clock controller in its reset state
    /// (see [`crate::system::system_init`]). Never retries a path; the
    /// caller must treat an error as fatal.
    pub fn set_sys_clock<H: ClockHal>(&self, hal: &mut H) -> Result<Outcome, SetSysClockError> {
        let mut hse = None;
        let mut hsi = None;

        if self.config.sources.contains(ClockSources::HSE) {
            match self.pll_hse(hal) {
                Ok(clocks) => {
                    return Ok(Outcome {
                        path: ClockPath::ExternalCrystal,
                        clocks,
                    })
                }
                Err(e) => hse = Some(e),
            }
        }

        if self.config.sources.contains(ClockSources::HSI) {
            match self.pll_hsi(hal) {
                Ok(clocks) => {
                    return Ok(Outcome {
                        path: ClockPath::InternalOscillator,
                        clocks,
                    })
                }
                Err(e) => hsi = Some(e),
            }
        }

        Err(SetSysClockError::ConfigurationExhausted { hse, hsi })
    }

    /// Run SYSCLK from the PLL clocked by the external crystal.
    ///
    /// A PLL that is already running (left by a bootloader) is kept as is.
    pub fn pll_hse<H: ClockHal>(&self, hal: &mut H) -> Result<Clocks, ClockError> {
        hal.enable_power_scaling(VOLTAGE_SCALE);

        let pll = match hal.oscillator_config().pll {
            PllState::On(running) => running,
            _ => {
                let pll = hse_pll(self.config.usb);
                hal.configure_oscillators(&OscillatorConfig {
                    hse: Some(HseState::On),
                    hsi: None,
                    pll: PllState::On(pll),
                })?;
                pll
            }
        };

        Self::apply_clock_tree(hal, &pll)
    }

    /// Run SYSCLK from the PLL clocked by the internal oscillator.
    pub fn pll_hsi<H: ClockHal>(&self, hal: &mut H) -> Result<Clocks, ClockError> {
        hal.enable_power_scaling(VOLTAGE_SCALE);

        let pll = hsi_pll(self.config.usb);
        hal.configure_oscillators(&OscillatorConfig {
            hse: Some(HseState::Off),
            hsi: Some(HsiConfig::default()),
            pll: PllState::On(pll),
        })?;

        Self::apply_clock_tree(hal, &pll)
    }

    fn apply_clock_tree<H: ClockHal>(hal: &mut H, pll: &PllConfig) -> Result<Clocks, ClockError> {
        let clocks = Clocks::from_tree(pll.pllclk_hz(), Some(pll.pll48_hz()), &CLOCK_TREE);
        hal.configure_clock_tree(&CLOCK_TREE, FlashLatency::for_hclk(clocks.hclk()))?;
        Ok(clocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Call {
        PowerScaling(VoltageScale),
        Oscillators(OscillatorConfig),
        ClockTree(ClockTreeConfig, FlashLatency),
    }

    /// Records every call and answers from scripted results (`Ok` once the script runs out)
    #[derive(Default)]
    struct MockHal {
        running_pll: Option<PllConfig>,
        oscillator_results: VecDeque<Result<(), ClockError>>,
        clock_tree_results: VecDeque<Result<(), ClockError>>,
        calls: Vec<Call>,
        queries: core::cell::Cell<usize>,
    }

    impl MockHal {
        fn failing_oscillators(errors: &[ClockError]) -> Self {
            MockHal {
                oscillator_results: errors.iter().map(|e| Err(*e)).collect(),
                ..Default::default()
            }
        }

        fn oscillator_requests(&self) -> Vec<OscillatorConfig> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Oscillators(cfg) => Some(*cfg),
                    _ => None,
                })
                .collect()
        }

        fn clock_tree_requests(&self) -> Vec<(ClockTreeConfig, FlashLatency)> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::ClockTree(cfg, latency) => Some((*cfg, *latency)),
                    _ => None,
                })
                .collect()
        }
    }

    impl ClockHal for MockHal {
        fn enable_power_scaling(&mut self, scale: VoltageScale) {
            self.calls.push(Call::PowerScaling(scale));
        }

        fn oscillator_config(&self) -> OscillatorConfig {
            self.queries.set(self.queries.get() + 1);
            OscillatorConfig {
                hse: Some(HseState::Off),
                hsi: Some(HsiConfig::default()),
                pll: match self.running_pll {
                    Some(pll) => PllState::On(pll),
                    None => PllState::Off,
                },
            }
        }

        fn configure_oscillators(&mut self, config: &OscillatorConfig) -> Result<(), ClockError> {
            self.calls.push(Call::Oscillators(*config));
            self.oscillator_results.pop_front().unwrap_or(Ok(()))
        }

        fn configure_clock_tree(
            &mut self,
            config: &ClockTreeConfig,
            latency: FlashLatency,
        ) -> Result<(), ClockError> {
            self.calls.push(Call::ClockTree(*config, latency));
            self.clock_tree_results.pop_front().unwrap_or(Ok(()))
        }
    }

    fn sequencer(sources: ClockSources, usb: bool) -> Sequencer {
        Sequencer::new(SysClockConfig { sources, usb })
    }

    fn both() -> ClockSources {
        ClockSources::HSE.union(ClockSources::HSI)
    }

    #[test]
    fn falls_back_to_hsi_when_hse_fails() {
        let mut hal = MockHal::failing_oscillators(&[ClockError::HseTimeout]);
        let outcome = sequencer(both(), false).set_sys_clock(&mut hal).unwrap();

        assert_eq!(outcome.path, ClockPath::InternalOscillator);
        assert_eq!(outcome.clocks.sysclk(), 100_000_000);

        let requests = hal.oscillator_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].hse, Some(HseState::On));
        assert_eq!(requests[1].hse, Some(HseState::Off));
        assert_eq!(requests[1].hsi, Some(HsiConfig::default()));
        assert_eq!(requests[1].pll, PllState::On(hsi_pll(false)));
        // The failed HSE attempt never reached the clock tree
        assert_eq!(hal.clock_tree_requests().len(), 1);
    }

    #[test]
    fn no_sources_is_exhausted_without_touching_hardware() {
        let mut hal = MockHal::default();
        let result = sequencer(ClockSources::NONE, false).set_sys_clock(&mut hal);

        assert_eq!(
            result,
            Err(SetSysClockError::ConfigurationExhausted { hse: None, hsi: None })
        );
        assert!(hal.calls.is_empty());
        assert_eq!(hal.queries.get(), 0);
    }

    #[test]
    fn hse_success_skips_hsi() {
        let mut hal = MockHal::default();
        let outcome = sequencer(both(), false).set_sys_clock(&mut hal).unwrap();

        assert_eq!(outcome.path, ClockPath::ExternalCrystal);
        let requests = hal.oscillator_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].pll, PllState::On(hse_pll(false)));
        assert_eq!(requests[0].hsi, None);
    }

    #[test]
    fn hse_usb_runs_at_60_mhz() {
        let mut hal = MockHal::default();
        let outcome = sequencer(ClockSources::HSE, true).set_sys_clock(&mut hal).unwrap();

        assert_eq!(outcome.clocks.sysclk(), 60_000_000);
        assert_eq!(outcome.clocks.pll48(), Some(48_000_000));
        assert_eq!(outcome.clocks.pclk1(), 30_000_000);
        assert_eq!(outcome.clocks.pclk2(), 60_000_000);
        assert_eq!(
            hal.clock_tree_requests(),
            vec![(CLOCK_TREE, FlashLatency::new(1).unwrap())]
        );
    }

    #[test]
    fn hse_without_usb_runs_at_100_mhz() {
        let mut hal = MockHal::default();
        let outcome = sequencer(ClockSources::HSE, false).set_sys_clock(&mut hal).unwrap();

        assert_eq!(outcome.clocks.sysclk(), 100_000_000);
        assert_eq!(outcome.clocks.pclk1(), 50_000_000);
        assert_eq!(outcome.clocks.pll48(), Some(40_000_000));
        assert_eq!(
            hal.clock_tree_requests(),
            vec![(CLOCK_TREE, FlashLatency::new(3).unwrap())]
        );
    }

    #[test]
    fn hsi_frequencies() {
        let mut hal = MockHal::default();
        let usb = sequencer(ClockSources::HSI, true).set_sys_clock(&mut hal).unwrap();
        assert_eq!(usb.path, ClockPath::InternalOscillator);
        assert_eq!(usb.clocks.sysclk(), 96_000_000);
        assert_eq!(usb.clocks.pclk1(), 48_000_000);
        assert_eq!(usb.clocks.pll48(), Some(48_000_000));
        assert_eq!(hsi_pll(true).n, 192);

        let mut hal = MockHal::default();
        let plain = sequencer(ClockSources::HSI, false).set_sys_clock(&mut hal).unwrap();
        assert_eq!(plain.clocks.sysclk(), 100_000_000);
        assert_eq!(hsi_pll(false).n, 200);
        // 3 wait states at both speeds
        assert_eq!(
            hal.clock_tree_requests(),
            vec![(CLOCK_TREE, FlashLatency::new(3).unwrap())]
        );
    }

    #[test]
    fn declared_pll_settings_are_valid() {
        let expected = [
            (hse_pll(true), 60_000_000, 48_000_000),
            (hse_pll(false), 100_000_000, 40_000_000),
            (hsi_pll(true), 96_000_000, 48_000_000),
            (hsi_pll(false), 100_000_000, 50_000_000),
        ];
        for (pll, pllclk, pll48) in expected.iter() {
            let input = pll.source.frequency() as u64;
            let computed = input * pll.n as u64 / pll.m as u64 / pll.p.divisor() as u64;
            assert_eq!(computed, *pllclk as u64);
            assert_eq!(pll.pllclk_hz(), *pllclk);
            assert_eq!(pll.pll48_hz(), *pll48);
            assert_eq!(pll.validate(), Ok(()));
        }
    }

    #[test]
    fn both_paths_failing_is_exhausted() {
        let mut hal = MockHal::failing_oscillators(&[
            ClockError::HseTimeout,
            ClockError::PllTimeout,
        ]);
        let result = sequencer(both(), true).set_sys_clock(&mut hal);

        assert_eq!(
            result,
            Err(SetSysClockError::ConfigurationExhausted {
                hse: Some(ClockError::HseTimeout),
                hsi: Some(ClockError::PllTimeout),
            })
        );
        assert!(hal.clock_tree_requests().is_empty());
    }

    #[test]
    fn hse_only_failure_does_not_try_hsi() {
        let mut hal = MockHal::failing_oscillators(&[ClockError::HseTimeout]);
        let result = sequencer(ClockSources::HSE, false).set_sys_clock(&mut hal);

        assert_eq!(
            result,
            Err(SetSysClockError::ConfigurationExhausted {
                hse: Some(ClockError::HseTimeout),
                hsi: None,
            })
        );
        assert_eq!(hal.oscillator_requests().len(), 1);
    }

    #[test]
    fn running_pll_is_kept() {
        let bootloader_pll = PllConfig {
            source: PllSource::Hse,
            m: 25,
            n: 168,
            p: PllP::Div2,
            q: 4,
        };
        let mut hal = MockHal {
            running_pll: Some(bootloader_pll),
            ..Default::default()
        };
        let outcome = sequencer(ClockSources::HSE, false).set_sys_clock(&mut hal).unwrap();

        assert!(hal.oscillator_requests().is_empty());
        assert_eq!(hal.clock_tree_requests().len(), 1);
        // 25 MHz / 25 * 168 / 2
        assert_eq!(outcome.clocks.sysclk(), 84_000_000);
        assert_eq!(outcome.clocks.pll48(), Some(42_000_000));
        assert_eq!(
            hal.clock_tree_requests()[0].1,
            FlashLatency::new(2).unwrap()
        );
    }

    #[test]
    fn clock_tree_failure_falls_back() {
        let mut hal = MockHal {
            clock_tree_results: vec![Err(ClockError::SwitchTimeout)].into_iter().collect(),
            ..Default::default()
        };
        let outcome = sequencer(both(), false).set_sys_clock(&mut hal).unwrap();

        assert_eq!(outcome.path, ClockPath::InternalOscillator);
        assert_eq!(hal.clock_tree_requests().len(), 2);
    }

    #[test]
    fn hsi_clock_tree_failure_is_path_failure() {
        let mut hal = MockHal {
            clock_tree_results: vec![Err(ClockError::SourceNotReady)].into_iter().collect(),
            ..Default::default()
        };
        let result = sequencer(ClockSources::HSI, false).set_sys_clock(&mut hal);

        assert_eq!(
            result,
            Err(SetSysClockError::ConfigurationExhausted {
                hse: None,
                hsi: Some(ClockError::SourceNotReady),
            })
        );
    }

    #[test]
    fn power_scaling_precedes_each_attempt() {
        let mut hal = MockHal::failing_oscillators(&[ClockError::HseTimeout]);
        sequencer(both(), false).set_sys_clock(&mut hal).unwrap();

        let scaling: Vec<usize> = hal
            .calls
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == Call::PowerScaling(VoltageScale::Scale2))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(scaling, vec![0, 2]);
    }

    #[test]
    fn source_mask() {
        assert_eq!(both().bits(), 0x6);
        assert_eq!(ClockSources::NONE.union(ClockSources::HSI).bits(), 0x2);
        assert!(both().contains(ClockSources::HSI));
        assert!(!ClockSources::HSI.contains(ClockSources::HSE));
        assert_eq!(ClockSources::HSE.bits(), 0x4);
    }
}
