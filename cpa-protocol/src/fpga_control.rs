//! FPGA I/O control client.
//!
//! The gateware exposes a small command interface on the shared I2C bus:
//! an opcode byte followed by an opcode-specific payload. The DUT I/O levels
//! are write-only on the wire, so a shadow copy of the last *confirmed* state
//! is kept here and every mutation is clone → patch → commit: the cache is
//! only updated once the full bus transaction went through. A failed write
//! leaves the cache exactly as it was.

use embedded_hal::i2c::I2c;

/// 7-bit bus address of the FPGA control interface.
pub const FPGA_ADDRESS: u8 = 0x42;

// Wire opcodes understood by the gateware.
const OPCODE_SET_IO_LEVELS: u8 = 0;
const OPCODE_SET_FLASH_PAYLOAD: u8 = 1;
const OPCODE_START_MEASUREMENT: u8 = 2;
const OPCODE_SET_HEAT_CTRL_PWM: u8 = 3;

/// Size of the fake-flash payload block.
pub const FLASH_PAYLOAD_LEN: usize = 16;

/// DUT I/O levels, packed LSB-first into a single status byte on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IoLevels {
    pub dut_boot: bool,
    pub dut_en: bool,
    pub dut_pwr: bool,
    pub dut_clk_en: bool,
}

impl IoLevels {
    fn encode(self) -> u8 {
        (self.dut_boot as u8)
            | (self.dut_en as u8) << 1
            | (self.dut_pwr as u8) << 2
            | (self.dut_clk_en as u8) << 3
    }
}

pub struct FpgaControl<I2C> {
    bus: I2C,
    io_levels: IoLevels,
}

impl<I2C: I2c> FpgaControl<I2C> {
    /// The cache starts all-inactive but unconfirmed; call [`init`] to commit
    /// it once the FPGA is configured.
    ///
    /// [`init`]: FpgaControl::init
    pub fn new(bus: I2C) -> Self {
        Self {
            bus,
            io_levels: IoLevels::default(),
        }
    }

    /// Reset the levels to all-inactive and commit them.
    ///
    /// Used at boot and after every FPGA reconfiguration, since the fabric
    /// comes up with no memory of the previous levels.
    pub fn init(&mut self) -> Result<(), I2C::Error> {
        self.set_status(IoLevels::default())
    }

    /// Last confirmed device state.
    pub fn io_levels(&self) -> IoLevels {
        self.io_levels
    }

    /// Push a complete status byte and commit it to the cache on success.
    fn set_status(&mut self, status: IoLevels) -> Result<(), I2C::Error> {
        self.bus
            .write(FPGA_ADDRESS, &[OPCODE_SET_IO_LEVELS, status.encode()])?;
        self.io_levels = status;
        Ok(())
    }

    pub fn set_dut_power(&mut self, pwr: bool) -> Result<(), I2C::Error> {
        let mut status = self.io_levels;
        status.dut_pwr = pwr;
        self.set_status(status)
    }

    pub fn set_dut_en(&mut self, en: bool) -> Result<(), I2C::Error> {
        let mut status = self.io_levels;
        status.dut_en = en;
        self.set_status(status)
    }

    pub fn set_dut_boot(&mut self, boot: bool) -> Result<(), I2C::Error> {
        let mut status = self.io_levels;
        status.dut_boot = boot;
        self.set_status(status)
    }

    /// Update boot strap and enable together, in one bus transaction.
    pub fn set_dut_boot_en(&mut self, boot: bool, en: bool) -> Result<(), I2C::Error> {
        let mut status = self.io_levels;
        status.dut_boot = boot;
        status.dut_en = en;
        self.set_status(status)
    }

    pub fn set_dut_clk_en(&mut self, en: bool) -> Result<(), I2C::Error> {
        let mut status = self.io_levels;
        status.dut_clk_en = en;
        self.set_status(status)
    }

    /// Push the 16-byte fake-flash payload in one transaction. Not cached.
    pub fn set_flash_payload(&mut self, data: &[u8; FLASH_PAYLOAD_LEN]) -> Result<(), I2C::Error> {
        let mut buf = [0u8; 1 + FLASH_PAYLOAD_LEN];
        buf[0] = OPCODE_SET_FLASH_PAYLOAD;
        buf[1..].copy_from_slice(data);
        self.bus.write(FPGA_ADDRESS, &buf)
    }

    /// Tell the gateware a measurement run starts. No payload.
    pub fn start_measurement(&mut self) -> Result<(), I2C::Error> {
        self.bus.write(FPGA_ADDRESS, &[OPCODE_START_MEASUREMENT])
    }

    /// Set the cartridge heater PWM duty (0-255).
    pub fn set_heater_pwm(&mut self, value: u8) -> Result<(), I2C::Error> {
        self.bus
            .write(FPGA_ADDRESS, &[OPCODE_SET_HEAT_CTRL_PWM, value])
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorType, Operation};

    /// Records every write; optionally fails them all.
    #[derive(Default)]
    struct MockBus {
        writes: Vec<(u8, Vec<u8>)>,
        fail: bool,
    }

    #[derive(Debug)]
    struct Nack;

    impl embedded_hal::i2c::Error for Nack {
        fn kind(&self) -> embedded_hal::i2c::ErrorKind {
            embedded_hal::i2c::ErrorKind::NoAcknowledge(
                embedded_hal::i2c::NoAcknowledgeSource::Address,
            )
        }
    }

    impl ErrorType for MockBus {
        type Error = Nack;
    }

    impl I2c for MockBus {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Nack> {
            if self.fail {
                return Err(Nack);
            }
            for op in operations {
                match op {
                    Operation::Write(data) => self.writes.push((address, data.to_vec())),
                    Operation::Read(_) => unreachable!("control interface is write-only"),
                }
            }
            Ok(())
        }
    }

    #[test]
    fn init_commits_all_inactive() {
        let mut ctl = FpgaControl::new(MockBus::default());
        ctl.init().unwrap();
        assert_eq!(ctl.bus.writes, vec![(FPGA_ADDRESS, vec![0x00, 0x00])]);
        assert_eq!(ctl.io_levels(), IoLevels::default());
    }

    #[test]
    fn mutators_patch_only_their_field() {
        let mut ctl = FpgaControl::new(MockBus::default());
        ctl.set_dut_power(true).unwrap();
        ctl.set_dut_clk_en(true).unwrap();
        ctl.set_dut_boot_en(true, true).unwrap();
        // bit0 boot, bit1 en, bit2 pwr, bit3 clk_en
        assert_eq!(
            ctl.bus.writes,
            vec![
                (FPGA_ADDRESS, vec![0x00, 0b0100]),
                (FPGA_ADDRESS, vec![0x00, 0b1100]),
                (FPGA_ADDRESS, vec![0x00, 0b1111]),
            ]
        );
        assert_eq!(
            ctl.io_levels(),
            IoLevels {
                dut_boot: true,
                dut_en: true,
                dut_pwr: true,
                dut_clk_en: true,
            }
        );
    }

    #[test]
    fn failed_write_leaves_cache_untouched() {
        let mut ctl = FpgaControl::new(MockBus::default());
        ctl.set_dut_power(true).unwrap();
        let before = ctl.io_levels();
        ctl.bus.fail = true;
        assert!(ctl.set_dut_clk_en(true).is_err());
        assert_eq!(ctl.io_levels(), before);
        // A later successful mutation still starts from the confirmed state.
        ctl.bus.fail = false;
        ctl.set_dut_en(true).unwrap();
        assert_eq!(ctl.bus.writes.last(), Some(&(FPGA_ADDRESS, vec![0x00, 0b0110])));
    }

    #[test]
    fn flash_payload_is_one_transaction_uncached() {
        let mut ctl = FpgaControl::new(MockBus::default());
        let payload: [u8; 16] = core::array::from_fn(|i| 0xF0 | i as u8 & 0x0F);
        ctl.set_flash_payload(&payload).unwrap();
        let (addr, bytes) = &ctl.bus.writes[0];
        assert_eq!(*addr, FPGA_ADDRESS);
        assert_eq!(bytes[0], 0x01);
        assert_eq!(&bytes[1..], &payload);
        assert_eq!(ctl.io_levels(), IoLevels::default());
    }

    #[test]
    fn measurement_and_heater_opcodes() {
        let mut ctl = FpgaControl::new(MockBus::default());
        ctl.start_measurement().unwrap();
        ctl.set_heater_pwm(0x80).unwrap();
        assert_eq!(
            ctl.bus.writes,
            vec![
                (FPGA_ADDRESS, vec![0x02]),
                (FPGA_ADDRESS, vec![0x03, 0x80]),
            ]
        );
    }
}
