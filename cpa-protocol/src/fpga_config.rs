//! iCE40 slave-SPI bitstream loader.
//!
//! The configuration port is bit-banged: SPI mode 3 (clock idles high, data
//! launched on the falling edge), MSB first, chip select held low for the
//! whole load. Timing only matters around reset, so plain GPIO writes at CPU
//! speed are plenty for the iCE40's 25 MHz ceiling.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

/// CRESET low pulse before entering slave configuration mode.
const RESET_PULSE_US: u32 = 800;
/// Internal configuration-memory clear after CRESET release.
const MEMORY_CLEAR_US: u32 = 1500;
/// Dummy bytes clocked after the bitstream to flush the device state machine.
const TERMINATE_DUMMY_BYTES: usize = 14;

/// The completion line (CDONE) stayed low after the final flush clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigError;

pub struct BitstreamLoader<O, I, D> {
    creset: O,
    cs: O,
    sck: O,
    sdo: O,
    cdone: I,
    delay: D,
}

impl<O: OutputPin, I: InputPin, D: DelayNs> BitstreamLoader<O, I, D> {
    pub fn new(creset: O, cs: O, sck: O, sdo: O, cdone: I, delay: D) -> Self {
        Self {
            creset,
            cs,
            sck,
            sdo,
            cdone,
            delay,
        }
    }

    /// Hold the FPGA in reset without starting a configuration cycle.
    ///
    /// Used at boot so the fabric stays quiet until the host loads a
    /// bitstream.
    pub fn assert_reset(&mut self) {
        self.creset.set_low().ok();
    }

    /// Put the FPGA into slave configuration mode.
    ///
    /// After the reset pulse the device clears its internal configuration
    /// memory; it accepts clock and data only once that second delay has
    /// passed.
    pub fn begin(&mut self) {
        self.sdo.set_low().ok();
        self.sck.set_high().ok();
        self.cs.set_low().ok();

        self.creset.set_low().ok();
        self.delay.delay_us(RESET_PULSE_US);
        self.creset.set_high().ok();

        self.delay.delay_us(MEMORY_CLEAR_US);
    }

    /// Clock a bitstream chunk out, MSB first.
    pub fn send(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            self.write_byte(byte);
        }
    }

    /// Finish the load: flush with dummy clocks, then sample CDONE once.
    pub fn terminate(&mut self) -> Result<(), ConfigError> {
        for _ in 0..TERMINATE_DUMMY_BYTES {
            self.write_byte(0x00);
        }

        if self.cdone.is_high().unwrap_or(false) {
            Ok(())
        } else {
            Err(ConfigError)
        }
    }

    fn write_byte(&mut self, byte: u8) {
        for bit in (0..8).rev() {
            self.sck.set_low().ok();
            if byte & (1 << bit) != 0 {
                self.sdo.set_high().ok();
            } else {
                self.sdo.set_low().ok();
            }
            self.sck.set_high().ok();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
