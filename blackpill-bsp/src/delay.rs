use crate::clock::{Clocks, HSI_HZ};
use core::sync::atomic::{AtomicU32, Ordering};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SYST;

const SYST_RELOAD_MAX: u32 = 0x00ff_ffff;

/// Bounded polling of a hardware condition
pub trait WaitFor {
    /// Poll `ready` until it returns true or `timeout_ms` elapses.
    ///
    /// Returns the last result of `ready`.
    fn wait_for<F: FnMut() -> bool>(&self, timeout_ms: u32, ready: F) -> bool;
}

/// Busy-wait timing on SysTick, clocked from HCLK.
pub struct Delay {
    _systick: SYST,
    base_clock: AtomicU32,
}

impl Delay {
    /// Start SysTick free-running. The core is assumed to run from HSI
    /// until [`Delay::set_sysclk`] is called.
    pub fn new(mut systick: SYST) -> Self {
        // Set clock source to processor clock
        systick.set_clock_source(SystClkSource::Core);

        // Set reload and current values
        systick.set_reload(SYST_RELOAD_MAX);
        systick.clear_current();

        // Enable the counter
        systick.enable_counter();

        Delay {
            _systick: systick,
            base_clock: AtomicU32::new(HSI_HZ),
        }
    }

    pub fn set_sysclk(&self, clocks: &Clocks) {
        self.base_clock.store(clocks.hclk(), Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn get_current(&self) -> u32 {
        SYST::get_current()
    }
}

impl WaitFor for Delay {
    fn wait_for<F: FnMut() -> bool>(&self, timeout_ms: u32, mut ready: F) -> bool {
        let base_clock = self.base_clock.load(Ordering::SeqCst) as u64;
        let mut remaining = timeout_ms as u64 * base_clock / 1_000;

        let mut last = self.get_current();
        loop {
            if ready() {
                return true;
            }

            let now = self.get_current();
            let delta = (last.wrapping_sub(now) & SYST_RELOAD_MAX) as u64;
            last = now;

            if delta >= remaining {
                return ready();
            }
            remaining -= delta;
        }
    }
}
