#![no_std]
#![no_main]

mod board;
mod config;
mod sampling;
mod serial_bridge;

use core::cell::RefCell;

use cpa_protocol::command::CommandFsm;
use cpa_protocol::fpga_config::BitstreamLoader;
use cpa_protocol::sequencer::SamplingSequencer;
use defmt::*;
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_futures::select::{select, Either};
use embassy_rp::bind_interrupts;
use embassy_rp::gpio::{Input, Level, Output, Pull};
use embassy_rp::i2c::{self, I2c};
use embassy_rp::peripherals::{PIO0, UART0, USB};
use embassy_rp::pio::{InterruptHandler as PioInterruptHandler, Pio};
use embassy_rp::uart::{self, BufferedInterruptHandler, BufferedUart};
use embassy_rp::usb::{Driver, InterruptHandler};
use embassy_rp::Peripheral;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Delay, Timer};
use embassy_usb::driver::{Endpoint as _, EndpointIn as _, EndpointOut as _};
use embassy_usb::Builder;
use panic_probe as _;
use static_cell::StaticCell;

use crate::board::{CpaBoard, I2cBus};
use crate::config::*;
use crate::sampling::{sampling_task, PioCapture};
use crate::serial_bridge::{dut_to_host_task, host_to_dut_task};

// =============================================================================
// Interrupt bindings
// =============================================================================

bind_interrupts!(struct Irqs {
    USBCTRL_IRQ => InterruptHandler<USB>;
    PIO0_IRQ_0 => PioInterruptHandler<PIO0>;
    UART0_IRQ => BufferedInterruptHandler<UART0>;
});

// =============================================================================
// USB device type aliases
// =============================================================================

pub type UsbDriver = Driver<'static, USB>;
pub type BulkIn = <UsbDriver as embassy_usb::driver::Driver<'static>>::EndpointIn;
pub type BulkOut = <UsbDriver as embassy_usb::driver::Driver<'static>>::EndpointOut;

// =============================================================================
// Entry point
// =============================================================================

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_rp::init(Default::default());

    info!("CPA board starting up");

    // ---- Shared I2C bus: FPGA control, gain DAC, temperature sensor ----
    let i2c = I2c::new_blocking(p.I2C0, p.PIN_21, p.PIN_20, i2c::Config::default());
    static I2C_BUS: StaticCell<I2cBus> = StaticCell::new();
    let i2c_bus = I2C_BUS.init(Mutex::new(RefCell::new(i2c)));

    // ---- FPGA configuration port (bit-banged slave SPI) ----
    // SCK idles high (mode 3), CS stays low for the whole load.
    let creset = Output::new(p.PIN_10, Level::High);
    let cdone = Input::new(p.PIN_11, Pull::None);
    let sck = Output::new(p.PIN_12, Level::High);
    let sdo = Output::new(p.PIN_13, Level::Low);
    let cs = Output::new(p.PIN_14, Level::Low);
    let mut loader = BitstreamLoader::new(creset, cs, sck, sdo, cdone, Delay);

    // Hold the fabric quiet until the host loads a bitstream.
    loader.assert_reset();

    let mut cpa_board = CpaBoard::new(i2c_bus, loader);

    // ---- Capture engine: PIO0 SM0 + one DMA channel ----
    let Pio {
        mut common, sm0, ..
    } = Pio::new(p.PIO0, Irqs);
    let data_pins = [
        common.make_pio_pin(p.PIN_0),
        common.make_pio_pin(p.PIN_1),
        common.make_pio_pin(p.PIN_2),
        common.make_pio_pin(p.PIN_3),
        common.make_pio_pin(p.PIN_4),
        common.make_pio_pin(p.PIN_5),
        common.make_pio_pin(p.PIN_6),
        common.make_pio_pin(p.PIN_7),
    ];
    let ready_pin = common.make_pio_pin(p.PIN_8);
    let capture = PioCapture::new(common, sm0, p.DMA_CH0.into_ref(), data_pins, ready_pin);
    let sequencer = SamplingSequencer::new(capture);

    // ---- DUT serial port ----
    static UART_TX_BUF: StaticCell<[u8; 64]> = StaticCell::new();
    static UART_RX_BUF: StaticCell<[u8; BRIDGE_BUF_SIZE]> = StaticCell::new();
    let mut uart_config = uart::Config::default();
    uart_config.baudrate = DUT_BAUD;
    let dut_uart = BufferedUart::new(
        p.UART0,
        Irqs,
        p.PIN_16,
        p.PIN_17,
        UART_TX_BUF.init([0; 64]),
        UART_RX_BUF.init([0; BRIDGE_BUF_SIZE]),
        uart_config,
    );
    let (uart_rx, uart_tx) = dut_uart.split();

    // ---- USB driver ----
    let driver = Driver::new(p.USB, Irqs);

    let mut usb_config = embassy_usb::Config::new(USB_VID, USB_PID);
    usb_config.manufacturer = Some("courk");
    usb_config.product = Some("CPA measurement board");
    usb_config.max_power = 200;
    usb_config.max_packet_size_0 = 64;

    // Descriptor buffers (must be 'static)
    static CONFIG_DESC: StaticCell<[u8; 256]> = StaticCell::new();
    static BOS_DESC: StaticCell<[u8; 256]> = StaticCell::new();
    static MSOS_DESC: StaticCell<[u8; 256]> = StaticCell::new();
    static CONTROL_BUF: StaticCell<[u8; 128]> = StaticCell::new();

    let mut builder = Builder::new(
        driver,
        usb_config,
        CONFIG_DESC.init([0; 256]),
        BOS_DESC.init([0; 256]),
        MSOS_DESC.init([0; 256]),
        CONTROL_BUF.init([0; 128]),
    );

    // ---- Vendor-class interfaces ----
    //
    // Three bulk pipes: the sampling stream (IN only), the command channel
    // (OUT + IN) and the DUT serial bridge (OUT + IN).
    let mut func = builder.function(0xFF, 0x00, 0x00);
    let mut iface = func.interface();
    let mut alt = iface.alt_setting(0xFF, 0x00, 0x00, None);
    let sampling_in = alt.endpoint_bulk_in(USB_MAX_PACKET_SIZE);
    drop(func);

    let mut func = builder.function(0xFF, 0x00, 0x00);
    let mut iface = func.interface();
    let mut alt = iface.alt_setting(0xFF, 0x00, 0x00, None);
    let cmd_out = alt.endpoint_bulk_out(USB_MAX_PACKET_SIZE);
    let cmd_in = alt.endpoint_bulk_in(USB_MAX_PACKET_SIZE);
    drop(func);

    let mut func = builder.function(0xFF, 0x00, 0x00);
    let mut iface = func.interface();
    let mut alt = iface.alt_setting(0xFF, 0x00, 0x00, None);
    let bridge_out = alt.endpoint_bulk_out(USB_MAX_PACKET_SIZE);
    let bridge_in = alt.endpoint_bulk_in(USB_MAX_PACKET_SIZE);
    drop(func);

    // ---- Build and launch ----
    let usb = builder.build();

    spawner.must_spawn(usb_device_task(usb));

    // The gain DAC must answer before any measurement makes sense. A dead
    // DAC halts bring-up right here: the device stays enumerated so the
    // failure is visible over the log channel, but nothing beyond the USB
    // stack ever runs.
    if cpa_board.init_gain().is_err() {
        error!("halting");
        loop {
            Timer::after_secs(3600).await;
        }
    }

    spawner.must_spawn(command_task(cmd_out, cmd_in, cpa_board));
    spawner.must_spawn(sampling_task(sequencer, sampling_in));
    spawner.must_spawn(dut_to_host_task(uart_rx, bridge_in));
    spawner.must_spawn(host_to_dut_task(bridge_out, uart_tx));
    spawner.must_spawn(heartbeat_task(Output::new(p.PIN_25, Level::Low)));

    info!("CPA board ready — VID:PID = {:04x}:{:04x}", USB_VID, USB_PID);

    // Main task has nothing else to do; park forever.
    loop {
        Timer::after_secs(3600).await;
    }
}

// =============================================================================
// USB device task — runs the USB stack
// =============================================================================

#[embassy_executor::task]
async fn usb_device_task(mut usb: embassy_usb::UsbDevice<'static, UsbDriver>) {
    usb.run().await;
}

// =============================================================================
// Command task — host command stream in, single-slot replies out
// =============================================================================

#[embassy_executor::task]
async fn command_task(mut ep_out: BulkOut, mut ep_in: BulkIn, mut cpa_board: CpaBoard) {
    let mut fsm = CommandFsm::new();
    let mut buf = [0u8; USB_MAX_PACKET_SIZE as usize];

    loop {
        ep_out.wait_enabled().await;
        info!("command endpoint up");

        loop {
            match fsm.reply_pending() {
                // Nothing staged: just wait for command bytes.
                None => match ep_out.read(&mut buf).await {
                    Ok(n) => fsm.process(&buf[..n], &mut cpa_board),
                    Err(_) => break,
                },
                // Offer the staged reply on the IN endpoint while still
                // accepting commands. A command that lands before the host
                // drains the reply simply overwrites it.
                Some(code) => {
                    match select(ep_out.read(&mut buf), ep_in.write(&code.to_le_bytes())).await {
                        Either::First(Ok(n)) => fsm.process(&buf[..n], &mut cpa_board),
                        Either::First(Err(_)) => break,
                        Either::Second(Ok(())) => {
                            fsm.take_reply();
                        }
                        Either::Second(Err(_)) => break,
                    }
                }
            }
        }
    }
}

// =============================================================================
// Heartbeat LED
// =============================================================================

#[embassy_executor::task]
async fn heartbeat_task(mut led: Output<'static>) {
    loop {
        led.toggle();
        Timer::after_millis(500).await;
    }
}
