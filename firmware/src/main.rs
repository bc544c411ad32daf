#![no_std]
#![no_main]

mod app;
mod config;

use blackpill_bsp as bsp;
use cortex_m_rt::{entry, pre_init};
use panic_rtt_target as _;
use rtt_target::{rprintln, rtt_init_print};

/// Runs before statics are initialised, so nothing else can hold the RCC yet.
#[pre_init]
unsafe fn reset_clocks() {
    bsp::system::system_init(&mut bsp::system::SystemRegisters::steal());
}

#[entry]
fn main() -> ! {
    rtt_init_print!();

    rprintln!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let cp = cortex_m::Peripherals::take().unwrap();
    let delay = bsp::delay::Delay::new(cp.SYST);
    let registers = bsp::rcc::Registers::new(
        stm32ral::rcc::RCC::take().unwrap(),
        stm32ral::pwr::PWR::take().unwrap(),
        stm32ral::flash::FLASH::take().unwrap(),
    );
    let mut rcc = bsp::rcc::RCC::new(registers, &delay);

    let mut app = app::App::new(&mut rcc, &delay, config::sys_clock_config());
    app.setup();

    loop {
        cortex_m::asm::wfi();
    }
}
