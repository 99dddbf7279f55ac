//! Sampling sequencer program and controller.
//!
//! Capture pacing is fully offloaded to a hardware sequencing engine: the CPU
//! programs a small state table once, and the engine then moves one sample
//! per DUT handshake into the capture queue with no per-sample software work.
//! The table encodes a ready/sample/unready handshake:
//!
//! * S0 idles until the external ready line asserts, then branches to S1;
//! * S1 captures one unit into the queue, branching to the idle state if the
//!   queue is full, to S2 otherwise;
//! * S2 idles until the ready line deasserts, then branches back to S0.
//!
//! So exactly one unit is captured per full assert/deassert cycle of the
//! ready line.

/// Branch target meaning "stop executing the table".
pub const IDLE_STATE: u8 = 7;

/// Condition tested by a sequencer state on every engine cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SeqCondition {
    /// External ready line reads asserted.
    ReadyHigh,
    /// External ready line reads deasserted.
    ReadyLow,
    /// The capture queue has no room left.
    QueueFull,
}

/// Action performed by a sequencer state while it is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SeqAction {
    /// Drive nothing; just evaluate the condition.
    Wait,
    /// Capture one unit from the data bus into the queue.
    Sample,
}

/// One entry of the sequencer state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SeqState {
    pub action: SeqAction,
    pub test: SeqCondition,
    /// Next state once the test passes.
    pub on_pass: u8,
    /// State executed while the test fails.
    pub on_fail: u8,
}

/// The capture handshake program. Pushed verbatim to the engine; the state
/// numbering and branch targets are part of the DUT handshake contract.
pub const CAPTURE_PROGRAM: [SeqState; 3] = [
    SeqState {
        action: SeqAction::Wait,
        test: SeqCondition::ReadyHigh,
        on_pass: 1,
        on_fail: 0,
    },
    SeqState {
        action: SeqAction::Sample,
        test: SeqCondition::QueueFull,
        on_pass: IDLE_STATE,
        on_fail: 2,
    },
    SeqState {
        action: SeqAction::Wait,
        test: SeqCondition::ReadyLow,
        on_pass: 0,
        on_fail: 2,
    },
];

/// The sequencing engine underneath the controller.
///
/// The firmware implements this over a PIO state machine; tests implement it
/// with a recording mock.
pub trait SequencerHw {
    /// Abort any pass in progress. Must be safe when nothing is running.
    fn abort(&mut self);
    /// Block until the engine reports idle.
    fn wait_idle(&mut self);
    /// Drop everything queued in the capture queue.
    fn reset_queue(&mut self);
    /// Push the compiled state table into the engine.
    fn load_program(&mut self, program: &[SeqState; 3]);
    /// Bus width, clock source and interrupt routing for a capture pass.
    fn configure(&mut self);
    /// Launch a single continuous pass bound to the streaming endpoint.
    fn run(&mut self);
}

/// Start/stop controller for the capture engine.
pub struct SamplingSequencer<H> {
    hw: H,
}

impl<H: SequencerHw> SamplingSequencer<H> {
    pub fn new(hw: H) -> Self {
        Self { hw }
    }

    /// Arm and launch a capture pass.
    ///
    /// Idempotent: any running pass is torn down first, so calling this twice
    /// is the same as calling it once. The table goes in before the pass
    /// configuration, which binds to the loaded program.
    pub fn start(&mut self) {
        self.stop();

        self.hw.load_program(&CAPTURE_PROGRAM);
        self.hw.configure();
        self.hw.reset_queue();
        self.hw.wait_idle();
        self.hw.run();
    }

    /// Abort the capture pass and drop any queued data.
    ///
    /// Safe to call when nothing is running.
    pub fn stop(&mut self) {
        self.hw.abort();
        self.hw.wait_idle();
        self.hw.reset_queue();
    }

    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }
}

// =============================================================================
// Tests
// =============================================================================
