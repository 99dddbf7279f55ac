//! Gain control DAC client (DAC53401-class, 16-bit big-endian registers).
//!
//! The DAC sets the analog front-end gain. Registers are 16 bits wide and
//! travel MSB first on the wire; the 14-bit DAC value sits in the top bits of
//! the data register, so gain codes are shifted left by two before writing.

use embedded_hal::i2c::I2c;

/// 7-bit bus address of the DAC.
pub const DAC_ADDRESS: u8 = 0x48;

/// Register map.
pub mod regs {
    pub const STATUS: u8 = 0xD0;
    pub const GENERAL_CONFIG: u8 = 0xD1;
    pub const CONFIG2: u8 = 0xD2;
    pub const TRIGGER: u8 = 0xD3;
    pub const DAC_DATA: u8 = 0x21;
    pub const DAC_MARGIN_HIGH: u8 = 0x25;
    pub const DAC_MARGIN_LOW: u8 = 0x26;
    pub const PMBUS_OPERATION: u8 = 0x01;
    pub const PMBUS_STATUS_BYTE: u8 = 0x78;
    pub const PMBUS_VERSION: u8 = 0x98;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// Bus transaction failed.
    Bus(E),
    /// The status register did not look like the expected device.
    BadStatus,
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Error::Bus(e)
    }
}

pub struct GainDac<I2C> {
    bus: I2C,
}

impl<I2C: I2c> GainDac<I2C> {
    pub fn new(bus: I2C) -> Self {
        Self { bus }
    }

    /// Probe the device and write the fixed configuration word.
    ///
    /// NB: the device-identification check tests only the low status bit, not
    /// the full 6-bit marker field against its expected value of 0xC. Deployed
    /// host tooling has only ever seen this behaviour, so it is kept verbatim.
    pub fn init(&mut self) -> Result<(), Error<I2C::Error>> {
        let status = self.read_register(regs::STATUS)?;

        if status & 0x0001 != 0 {
            return Err(Error::BadStatus);
        }

        // DAC powered up, internal reference span x1.
        self.write_register(regs::GENERAL_CONFIG, (1 << 2) | 0b00)?;

        Ok(())
    }

    /// Set the gain, expressed in DAC LSBs.
    pub fn set_gain(&mut self, gain: u16) -> Result<(), I2C::Error> {
        self.write_register(regs::DAC_DATA, gain.wrapping_shl(2))
    }

    pub fn read_register(&mut self, reg: u8) -> Result<u16, I2C::Error> {
        let mut raw = [0u8; 2];
        self.bus.write_read(DAC_ADDRESS, &[reg], &mut raw)?;
        Ok(u16::from_be_bytes(raw))
    }

    pub fn write_register(&mut self, reg: u8, value: u16) -> Result<(), I2C::Error> {
        let be = value.to_be_bytes();
        self.bus.write(DAC_ADDRESS, &[reg, be[0], be[1]])
    }
}

// =============================================================================
// Tests
// =============================================================================
