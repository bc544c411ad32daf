#![cfg_attr(not(test), no_std)]

pub use cortex_m;
pub use stm32ral;

pub mod clock;
pub mod delay;
pub mod rcc;
pub mod sysclk;
pub mod system;
