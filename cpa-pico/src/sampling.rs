//! PIO capture engine and the sampling stream task.
//!
//! A PIO state machine runs the capture handshake so the CPU never touches
//! individual samples: it waits for the ready line, latches the 8-bit bus
//! into the RX FIFO via autopush, then waits for ready to drop. DMA drains
//! the FIFO into 512-byte blocks that go out on the sampling bulk IN
//! endpoint. When neither the DMA nor the host keeps up, the joined RX FIFO
//! fills and the state machine stalls on its push; no sample is ever torn.

use cpa_protocol::sequencer::{SamplingSequencer, SeqState, SequencerHw, CAPTURE_PROGRAM};
use defmt::*;
use embassy_futures::select::{select, Either};
use embassy_rp::peripherals::{DMA_CH0, PIO0};
use embassy_rp::pio::{
    Common, Config as PioConfig, Direction, FifoJoin, LoadedProgram, Pin as PioPin, ShiftConfig,
    ShiftDirection, StateMachine,
};
use embassy_rp::PeripheralRef;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_usb::driver::{Endpoint as _, EndpointIn as _};
use fixed::traits::ToFixed;

use crate::config::*;
use crate::BulkIn;

// =============================================================================
// Start/stop signalling from the command dispatcher
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum SamplingCommand {
    Start,
    Stop,
}

/// Written by the command dispatcher, consumed by [`sampling_task`]. A signal
/// rather than a channel: a rapid start/stop burst only needs its last state.
pub static SAMPLING_CTL: Signal<CriticalSectionRawMutex, SamplingCommand> = Signal::new();

// =============================================================================
// Capture engine over PIO0
// =============================================================================

// The compiled program hard-codes the ready line at input index 8.
const _: () = assert!(READY_PIN_INDEX == 8);

pub struct PioCapture {
    common: Common<'static, PIO0>,
    sm: StateMachine<'static, PIO0, 0>,
    dma: PeripheralRef<'static, DMA_CH0>,
    data_pins: [PioPin<'static, PIO0>; 8],
    loaded: Option<LoadedProgram<'static, PIO0>>,
}

impl PioCapture {
    pub fn new(
        common: Common<'static, PIO0>,
        mut sm: StateMachine<'static, PIO0, 0>,
        dma: PeripheralRef<'static, DMA_CH0>,
        data_pins: [PioPin<'static, PIO0>; 8],
        ready_pin: PioPin<'static, PIO0>,
    ) -> Self {
        sm.set_pin_dirs(
            Direction::In,
            &[
                &data_pins[0],
                &data_pins[1],
                &data_pins[2],
                &data_pins[3],
                &data_pins[4],
                &data_pins[5],
                &data_pins[6],
                &data_pins[7],
                &ready_pin,
            ],
        );

        Self {
            common,
            sm,
            dma,
            data_pins,
            loaded: None,
        }
    }

    /// Pull one 512-byte block out of the capture queue.
    ///
    /// Resolves only once the DMA transfer completes, which paces the whole
    /// stream to the DUT handshake.
    pub async fn read_block(&mut self, block: &mut [u8; BULK_BLOCK_SIZE]) {
        self.sm.rx().dma_pull(self.dma.reborrow(), block).await;
    }
}

impl SequencerHw for PioCapture {
    fn abort(&mut self) {
        self.sm.set_enable(false);
    }

    fn wait_idle(&mut self) {
        // Disabling the state machine is synchronous; restarting it here
        // clears a push stalled mid-sample so the next pass starts clean.
        self.sm.restart();
    }

    fn reset_queue(&mut self) {
        self.sm.clear_fifos();
    }

    fn load_program(&mut self, program: &[SeqState; 3]) {
        // The capture table is constant, so its compiled form is assembled at
        // build time and loaded into instruction memory once: the wait states
        // become `wait pin` instructions, the sample state is the autopush
        // `in`, and the queue-full exit falls out of FIFO backpressure.
        debug_assert_eq!(program, &CAPTURE_PROGRAM);

        if self.loaded.is_none() {
            let compiled = pio_proc::pio_asm!(
                ".wrap_target",
                "wait 1 pin 8", // READY_PIN_INDEX
                "in pins, 8",
                "wait 0 pin 8",
                ".wrap",
            );
            self.loaded = Some(self.common.load_program(&compiled.program));
        }
    }

    fn configure(&mut self) {
        // start() always loads before configuring.
        let Some(loaded) = self.loaded.as_ref() else {
            return;
        };

        let mut cfg = PioConfig::default();
        cfg.use_program(loaded, &[]);
        cfg.set_in_pins(&[
            &self.data_pins[0],
            &self.data_pins[1],
            &self.data_pins[2],
            &self.data_pins[3],
            &self.data_pins[4],
            &self.data_pins[5],
            &self.data_pins[6],
            &self.data_pins[7],
        ]);
        cfg.clock_divider = 1u8.to_fixed();
        cfg.shift_in = ShiftConfig {
            auto_fill: true,
            threshold: 8,
            direction: ShiftDirection::Left,
        };
        cfg.fifo_join = FifoJoin::RxOnly;
        self.sm.set_config(&cfg);
    }

    fn run(&mut self) {
        self.sm.set_enable(true);
    }
}

// =============================================================================
// Sampling stream task
// =============================================================================

#[embassy_executor::task]
pub async fn sampling_task(mut seq: SamplingSequencer<PioCapture>, mut ep_in: BulkIn) {
    ep_in.wait_enabled().await;
    info!("sampling endpoint up");

    let mut block = [0u8; BULK_BLOCK_SIZE];
    let mut running = false;

    loop {
        if !running {
            match SAMPLING_CTL.wait().await {
                SamplingCommand::Start => {
                    seq.start();
                    running = true;
                    info!("sampling started");
                }
                // Stop while idle still drops any stale queued data.
                SamplingCommand::Stop => seq.stop(),
            }
        } else {
            match select(
                SAMPLING_CTL.wait(),
                stream_block(&mut seq, &mut ep_in, &mut block),
            )
            .await
            {
                Either::First(SamplingCommand::Start) => {
                    seq.start();
                    info!("sampling restarted");
                }
                Either::First(SamplingCommand::Stop) => {
                    seq.stop();
                    running = false;
                    info!("sampling stopped");
                }
                Either::Second(()) => {}
            }
        }
    }
}

/// Capture one block and push it to the host. Cancel-safe: a stop signal may
/// abandon a partial block, which the stop path's queue reset then discards.
async fn stream_block(
    seq: &mut SamplingSequencer<PioCapture>,
    ep_in: &mut BulkIn,
    block: &mut [u8; BULK_BLOCK_SIZE],
) {
    seq.hw_mut().read_block(block).await;

    for chunk in block.chunks(USB_MAX_PACKET_SIZE as usize) {
        if ep_in.write(chunk).await.is_err() {
            // Host went away mid-block; the data is lost, capture goes on.
            warn!("sampling IN endpoint dropped a block");
            return;
        }
    }
}
