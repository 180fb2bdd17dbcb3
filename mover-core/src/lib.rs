//! Motion control and navigation core for a tank-steered ground vehicle on
//! no-std embedded platforms.
//!
//! For a runnable host simulation, see the `mover-app/mock-mcu` binary.
#![no_std]

pub mod utils;
