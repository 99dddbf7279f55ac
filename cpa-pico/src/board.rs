//! Hardware binding of the command dispatcher.
//!
//! Everything the host can ask for ends up here: the bit-banged FPGA
//! configuration port, the three clients on the shared I2C bus, and the
//! start/stop signal consumed by the sampling task. Failures are logged and
//! collapsed to [`Fault`]; the host only ever sees `'F'`.

use core::cell::RefCell;

use cpa_protocol::command::{Board, Fault, FLASH_PAYLOAD_LEN};
use cpa_protocol::fpga_config::BitstreamLoader;
use cpa_protocol::fpga_control::FpgaControl;
use cpa_protocol::gain_control::GainDac;
use cpa_protocol::temp_sensor::TempSensor;
use defmt::*;
use embassy_embedded_hal::shared_bus::blocking::i2c::I2cDevice;
use embassy_rp::gpio::{Input, Output};
use embassy_rp::i2c::{self, I2c};
use embassy_rp::peripherals::I2C0;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::Delay;

use crate::sampling::{SamplingCommand, SAMPLING_CTL};

/// The shared blocking I2C bus. All three bus clients take a device handle on
/// this mutex.
pub type I2cBus = Mutex<NoopRawMutex, RefCell<I2c<'static, I2C0, i2c::Blocking>>>;

type BusHandle = I2cDevice<'static, NoopRawMutex, I2c<'static, I2C0, i2c::Blocking>>;

type Loader = BitstreamLoader<Output<'static>, Input<'static>, Delay>;

pub struct CpaBoard {
    loader: Loader,
    fpga: FpgaControl<BusHandle>,
    dac: GainDac<BusHandle>,
    sensor: TempSensor<BusHandle, Delay>,
}

impl CpaBoard {
    pub fn new(bus: &'static I2cBus, loader: Loader) -> Self {
        Self {
            loader,
            fpga: FpgaControl::new(I2cDevice::new(bus)),
            dac: GainDac::new(I2cDevice::new(bus)),
            sensor: TempSensor::new(I2cDevice::new(bus), Delay),
        }
    }

    /// Probe and configure the gain DAC. Must succeed before any measurement
    /// makes sense.
    pub fn init_gain(&mut self) -> Result<(), Fault> {
        self.dac.init().map_err(|_| {
            error!("gain DAC did not answer its init sequence");
            Fault
        })
    }
}

impl Board for CpaBoard {
    fn config_begin(&mut self) {
        info!("FPGA configuration start");
        self.loader.begin();
    }

    fn config_send(&mut self, chunk: &[u8]) {
        self.loader.send(chunk);
    }

    fn config_terminate(&mut self) -> Result<(), Fault> {
        self.loader.terminate().map_err(|_| {
            warn!("CDONE still low after bitstream load");
            Fault
        })
    }

    fn io_init(&mut self) -> Result<(), Fault> {
        self.fpga.init().map_err(|_| {
            warn!("FPGA I/O init write failed");
            Fault
        })
    }

    fn start_sampling(&mut self) {
        SAMPLING_CTL.signal(SamplingCommand::Start);
    }

    fn stop_sampling(&mut self) {
        SAMPLING_CTL.signal(SamplingCommand::Stop);
    }

    fn start_measurement(&mut self) -> Result<(), Fault> {
        self.fpga.start_measurement().map_err(|_| Fault)
    }

    fn set_gain(&mut self, gain: u16) -> Result<(), Fault> {
        self.dac.set_gain(gain).map_err(|_| Fault)
    }

    fn set_dut_power(&mut self, on: bool) -> Result<(), Fault> {
        self.fpga.set_dut_power(on).map_err(|_| Fault)
    }

    fn set_dut_clk_en(&mut self, on: bool) -> Result<(), Fault> {
        self.fpga.set_dut_clk_en(on).map_err(|_| Fault)
    }

    fn set_flash_payload(&mut self, payload: &[u8; FLASH_PAYLOAD_LEN]) -> Result<(), Fault> {
        self.fpga.set_flash_payload(payload).map_err(|_| Fault)
    }

    fn read_temperature(&mut self) -> Result<u16, Fault> {
        self.sensor.read().map_err(|_| {
            warn!("temperature read timed out");
            Fault
        })
    }

    fn set_heater_pwm(&mut self, value: u8) -> Result<(), Fault> {
        self.fpga.set_heater_pwm(value).map_err(|_| Fault)
    }
}
