use crate::bsp::sysclk::{ClockSources, SysClockConfig};

/// PLL reference oscillators compiled into the image, crystal first
pub fn clock_sources() -> ClockSources {
    let mut sources = ClockSources::NONE;
    if cfg!(feature = "clock-hse") {
        sources = sources.union(ClockSources::HSE);
    }
    if cfg!(feature = "clock-hsi") {
        sources = sources.union(ClockSources::HSI);
    }
    sources
}

pub fn sys_clock_config() -> SysClockConfig {
    SysClockConfig {
        sources: clock_sources(),
        usb: cfg!(feature = "usb-clock"),
    }
}
