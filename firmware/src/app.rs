use crate::bsp;
use bsp::clock::Clocks;
use bsp::delay::Delay;
use bsp::rcc::RCC;
use bsp::sysclk::{ClockPath, Sequencer, SetSysClockError, SysClockConfig};
use rtt_target::rprintln;

pub struct App<'a, 'd> {
    rcc: &'a mut RCC<'d>,
    delay: &'d Delay,
    sequencer: Sequencer,
}

impl<'a, 'd> App<'a, 'd> {
    pub fn new(rcc: &'a mut RCC<'d>, delay: &'d Delay, config: SysClockConfig) -> Self {
        App {
            rcc,
            delay,
            sequencer: Sequencer::new(config),
        }
    }

    /// Bring up the system clock. Does not return if no clock path works.
    pub fn setup(&mut self) -> Clocks {
        let config = self.sequencer.config();
        rprintln!(
            "Clock sources: {:#x}, USB clock: {}",
            config.sources.bits(),
            config.usb
        );

        match self.sequencer.set_sys_clock(&mut *self.rcc) {
            Ok(outcome) => {
                // Timeouts from here on count in the new HCLK
                self.delay.set_sysclk(&outcome.clocks);

                let path = match outcome.path {
                    ClockPath::ExternalCrystal => "HSE",
                    ClockPath::InternalOscillator => "HSI",
                };
                let clocks = outcome.clocks;
                rprintln!(
                    "PLL from {}: sysclk {} Hz, hclk {} Hz, pclk1 {} Hz, pclk2 {} Hz",
                    path,
                    clocks.sysclk(),
                    clocks.hclk(),
                    clocks.pclk1(),
                    clocks.pclk2()
                );
                if let Some(pll48) = clocks.pll48() {
                    rprintln!("PLL48CLK {} Hz", pll48);
                }
                clocks
            }
            Err(SetSysClockError::ConfigurationExhausted { hse, hsi }) => {
                rprintln!("HSE path: {:?}, HSI path: {:?}", hse, hsi);
                fatal("SetSysClock failed")
            }
        }
    }
}

/// Report an unrecoverable start-up error and halt.
fn fatal(message: &str) -> ! {
    panic!("{}", message)
}
