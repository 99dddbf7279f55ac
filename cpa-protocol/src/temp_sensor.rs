//! Cartridge temperature sensor client (SHT3x-class).
//!
//! The sensor has no data-ready line: while a conversion is in flight it
//! simply refuses to acknowledge its address. `read()` therefore starts a
//! single-shot conversion and then polls with short bounded retries until the
//! sensor answers or the bound is exhausted.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

/// 7-bit bus address of the sensor.
pub const SENSOR_ADDRESS: u8 = 0x4A;

/// Single shot, clock stretching disabled, high repeatability.
const MEASURE_CMD: [u8; 2] = [0x24, 0x00];

/// Poll attempts allowed after the conversion command, 1 ms apart.
const POLL_LIMIT: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// Bus transaction failed while issuing the conversion command.
    Bus(E),
    /// The sensor never released its address within the retry bound.
    Timeout,
}

pub struct TempSensor<I2C, D> {
    bus: I2C,
    delay: D,
}

impl<I2C: I2c, D: DelayNs> TempSensor<I2C, D> {
    pub fn new(bus: I2C, delay: D) -> Self {
        Self { bus, delay }
    }

    /// Run one conversion and return the raw 16-bit temperature code.
    ///
    /// The first byte the sensor sends lands in the low half of the code, so
    /// the host sees the sensor's bytes in wire order.
    pub fn read(&mut self) -> Result<u16, Error<I2C::Error>> {
        self.bus
            .write(SENSOR_ADDRESS, &MEASURE_CMD)
            .map_err(Error::Bus)?;

        let mut raw = [0u8; 2];
        let mut attempts: u8 = 0;
        loop {
            match self.bus.read(SENSOR_ADDRESS, &mut raw) {
                Ok(()) => return Ok(u16::from_le_bytes(raw)),
                Err(_) => {
                    self.delay.delay_ms(1);
                    attempts += 1;
                    if attempts > POLL_LIMIT {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
