//! Control-plane logic for the ESP-CPA-Board firmware.
//!
//! Everything in here is independent of the RP2040 HAL: the host command
//! state machine, the FPGA bitstream-loading protocol, the I2C clients
//! (FPGA I/O control, gain DAC, temperature sensor), the sampling-sequencer
//! program and controller, and the UART-bridge flush policy. Hardware is
//! reached through `embedded-hal` 1.0 traits or small local traits, so the
//! whole command path can be exercised on the host with mock buses.
#![cfg_attr(not(test), no_std)]

pub mod bridge;
pub mod command;
pub mod fpga_config;
pub mod fpga_control;
pub mod gain_control;
pub mod sequencer;
pub mod temp_sensor;
