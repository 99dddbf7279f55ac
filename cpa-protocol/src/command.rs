//! Host command dispatcher.
//!
//! The host sends commands on a bulk OUT endpoint as a 1-byte opcode followed
//! by a 4-byte little-endian argument. `FPGA_CONFIG` and `SET_FLASH_PAYLOAD`
//! are followed by a raw body (`arg` bytes of bitstream, or a fixed 16-byte
//! payload). Nothing guarantees a command arrives in one USB transfer, so the
//! dispatcher keeps its state across `process()` calls and consumes every
//! delivered byte.

// =============================================================================
// Command opcodes (first byte of a command header)
// =============================================================================

pub const OPCODE_FPGA_CONFIG: u8 = 0;
pub const OPCODE_START_MEASUREMENT: u8 = 1;
pub const OPCODE_STOP_MEASUREMENT: u8 = 2;
pub const OPCODE_SET_DAC: u8 = 3;
pub const OPCODE_SET_DUT_POWER: u8 = 4;
pub const OPCODE_SET_DUT_CLK_EN: u8 = 5;
pub const OPCODE_SET_FLASH_PAYLOAD: u8 = 6;
pub const OPCODE_GET_TEMPERATURE: u8 = 7;
pub const OPCODE_SET_HEATER_PWM: u8 = 8;

// =============================================================================
// Replies
// =============================================================================

/// Command completed successfully.
pub const REPLY_OK: u16 = b'O' as u16;
/// Command failed. Every hardware failure collapses to this single code.
pub const REPLY_FAIL: u16 = b'F' as u16;

/// Fixed size of a `SET_FLASH_PAYLOAD` body.
pub const FLASH_PAYLOAD_LEN: usize = 16;

/// A hardware protocol step failed. Carries no detail on purpose: the host
/// only ever sees the `'F'` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Fault;

/// Hardware operations driven by the dispatcher.
///
/// The firmware implements this over the real peripherals; tests implement it
/// with a recording mock.
pub trait Board {
    /// Put the FPGA into slave configuration mode.
    fn config_begin(&mut self);
    /// Clock a bitstream chunk out to the FPGA.
    fn config_send(&mut self, chunk: &[u8]);
    /// Finish configuration. `Ok` iff the completion line reads asserted.
    fn config_terminate(&mut self) -> Result<(), Fault>;
    /// Reset the FPGA I/O levels to all-inactive and commit them.
    fn io_init(&mut self) -> Result<(), Fault>;
    /// Launch the sampling sequencer.
    fn start_sampling(&mut self);
    /// Abort the sampling sequencer.
    fn stop_sampling(&mut self);
    /// Notify the FPGA that a measurement run starts.
    fn start_measurement(&mut self) -> Result<(), Fault>;
    fn set_gain(&mut self, gain: u16) -> Result<(), Fault>;
    fn set_dut_power(&mut self, on: bool) -> Result<(), Fault>;
    fn set_dut_clk_en(&mut self, on: bool) -> Result<(), Fault>;
    fn set_flash_payload(&mut self, payload: &[u8; FLASH_PAYLOAD_LEN]) -> Result<(), Fault>;
    fn read_temperature(&mut self) -> Result<u16, Fault>;
    fn set_heater_pwm(&mut self, value: u8) -> Result<(), Fault>;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    ReadOpcode,
    ReadArg,
    ReadBitstream,
    ReadFlashPayload,
}

/// The host command state machine.
///
/// At most one reply is pending at any time: the slot is last-write-wins, so
/// a reply the host never drained is silently replaced by the next one.
pub struct CommandFsm {
    state: State,
    opcode: u8,
    arg: u32,
    arg_bytes: u8,
    /// Bitstream bytes forwarded so far; never exceeds `arg`.
    sent: u32,
    payload: [u8; FLASH_PAYLOAD_LEN],
    payload_len: u8,
    reply: Option<u16>,
}

impl CommandFsm {
    pub const fn new() -> Self {
        Self {
            state: State::ReadOpcode,
            opcode: 0,
            arg: 0,
            arg_bytes: 0,
            sent: 0,
            payload: [0; FLASH_PAYLOAD_LEN],
            payload_len: 0,
            reply: None,
        }
    }

    /// Reply code waiting to be sent, if any. Does not consume it.
    pub fn reply_pending(&self) -> Option<u16> {
        self.reply
    }

    /// Consume the pending reply.
    pub fn take_reply(&mut self) -> Option<u16> {
        self.reply.take()
    }

    fn post_reply(&mut self, code: u16) {
        // Single slot: an unread reply is overwritten.
        self.reply = Some(code);
    }

    fn reply_result(&mut self, result: Result<(), Fault>) {
        self.post_reply(match result {
            Ok(()) => REPLY_OK,
            Err(Fault) => REPLY_FAIL,
        });
    }

    /// Feed one delivered chunk of the host command stream.
    ///
    /// Consumes the whole chunk. A command or body split across deliveries
    /// resumes exactly where the previous call stopped.
    pub fn process<B: Board>(&mut self, buf: &[u8], board: &mut B) {
        let mut offset = 0usize;

        while offset < buf.len() {
            match self.state {
                State::ReadOpcode => {
                    self.opcode = buf[offset];
                    offset += 1;
                    self.arg = 0;
                    self.arg_bytes = 0;
                    self.state = State::ReadArg;
                }

                State::ReadArg => {
                    if self.arg_bytes < 4 {
                        self.arg |= (buf[offset] as u32) << (8 * self.arg_bytes as u32);
                        offset += 1;
                        self.arg_bytes += 1;
                    }
                    if self.arg_bytes == 4 {
                        self.dispatch(board);
                    }
                }

                State::ReadBitstream => {
                    let remaining = (self.arg - self.sent) as usize;
                    let chunk = remaining.min(buf.len() - offset);
                    board.config_send(&buf[offset..offset + chunk]);
                    offset += chunk;
                    self.sent += chunk as u32;

                    if self.sent == self.arg {
                        // The FPGA lost its I/O levels across reconfiguration;
                        // a successful load must recommit the shadow state.
                        let ok = board.config_terminate().is_ok() && board.io_init().is_ok();
                        self.post_reply(if ok { REPLY_OK } else { REPLY_FAIL });
                        self.state = State::ReadOpcode;
                    }
                }

                State::ReadFlashPayload => {
                    self.payload[self.payload_len as usize] = buf[offset];
                    offset += 1;
                    self.payload_len += 1;

                    if self.payload_len as usize == FLASH_PAYLOAD_LEN {
                        let payload = self.payload;
                        self.reply_result(board.set_flash_payload(&payload));
                        self.state = State::ReadOpcode;
                    }
                }
            }
        }
    }

    /// Run once the 4 argument bytes are in.
    fn dispatch<B: Board>(&mut self, board: &mut B) {
        self.state = State::ReadOpcode;

        match self.opcode {
            OPCODE_FPGA_CONFIG => {
                self.sent = 0;
                board.config_begin();
                self.state = State::ReadBitstream;
            }
            OPCODE_START_MEASUREMENT => {
                #[cfg(feature = "defmt")]
                defmt::info!("MEAS start");
                board.start_sampling();
                // The FPGA-side notification is best-effort; the sequencer is
                // already armed either way.
                let _ = board.start_measurement();
            }
            OPCODE_STOP_MEASUREMENT => {
                #[cfg(feature = "defmt")]
                defmt::info!("MEAS stop");
                board.stop_sampling();
            }
            OPCODE_SET_DAC => {
                let result = board.set_gain(self.arg as u16);
                self.reply_result(result);
            }
            OPCODE_SET_DUT_POWER => {
                let result = board.set_dut_power(self.arg != 0);
                self.reply_result(result);
            }
            OPCODE_SET_DUT_CLK_EN => {
                let result = board.set_dut_clk_en(self.arg != 0);
                self.reply_result(result);
            }
            OPCODE_SET_FLASH_PAYLOAD => {
                self.payload_len = 0;
                self.state = State::ReadFlashPayload;
            }
            OPCODE_GET_TEMPERATURE => match board.read_temperature() {
                Ok(code) => self.post_reply(code),
                Err(Fault) => self.post_reply(REPLY_FAIL),
            },
            OPCODE_SET_HEATER_PWM => {
                let result = board.set_heater_pwm(self.arg as u8);
                self.reply_result(result);
            }
            _unknown => {
                // Diagnostic only; the host gets no reply for bad opcodes.
                #[cfg(feature = "defmt")]
                defmt::warn!("unknown command 0x{=u8:x}", _unknown);
            }
        }
    }
}

impl Default for CommandFsm {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        ConfigBegin,
        ConfigSend(Vec<u8>),
        ConfigTerminate,
        IoInit,
        StartSampling,
        StopSampling,
        StartMeasurement,
        SetGain(u16),
        SetDutPower(bool),
        SetDutClkEn(bool),
        SetFlashPayload([u8; 16]),
        ReadTemperature,
        SetHeaterPwm(u8),
    }

    #[derive(Default)]
    struct MockBoard {
        ops: Vec<Op>,
        fail_terminate: bool,
        fail_io_init: bool,
        fail_gain: bool,
        temperature: Option<u16>,
    }

    impl MockBoard {
        fn result(&self, fail: bool) -> Result<(), Fault> {
            if fail {
                Err(Fault)
            } else {
                Ok(())
            }
        }
    }

    impl Board for MockBoard {
        fn config_begin(&mut self) {
            self.ops.push(Op::ConfigBegin);
        }
        fn config_send(&mut self, chunk: &[u8]) {
            self.ops.push(Op::ConfigSend(chunk.to_vec()));
        }
        fn config_terminate(&mut self) -> Result<(), Fault> {
            self.ops.push(Op::ConfigTerminate);
            self.result(self.fail_terminate)
        }
        fn io_init(&mut self) -> Result<(), Fault> {
            self.ops.push(Op::IoInit);
            self.result(self.fail_io_init)
        }
        fn start_sampling(&mut self) {
            self.ops.push(Op::StartSampling);
        }
        fn stop_sampling(&mut self) {
            self.ops.push(Op::StopSampling);
        }
        fn start_measurement(&mut self) -> Result<(), Fault> {
            self.ops.push(Op::StartMeasurement);
            Ok(())
        }
        fn set_gain(&mut self, gain: u16) -> Result<(), Fault> {
            self.ops.push(Op::SetGain(gain));
            self.result(self.fail_gain)
        }
        fn set_dut_power(&mut self, on: bool) -> Result<(), Fault> {
            self.ops.push(Op::SetDutPower(on));
            Ok(())
        }
        fn set_dut_clk_en(&mut self, on: bool) -> Result<(), Fault> {
            self.ops.push(Op::SetDutClkEn(on));
            Ok(())
        }
        fn set_flash_payload(&mut self, payload: &[u8; 16]) -> Result<(), Fault> {
            self.ops.push(Op::SetFlashPayload(*payload));
            Ok(())
        }
        fn read_temperature(&mut self) -> Result<u16, Fault> {
            self.ops.push(Op::ReadTemperature);
            self.temperature.ok_or(Fault)
        }
        fn set_heater_pwm(&mut self, value: u8) -> Result<(), Fault> {
            self.ops.push(Op::SetHeaterPwm(value));
            Ok(())
        }
    }

    fn cmd(opcode: u8, arg: u32) -> Vec<u8> {
        let mut v = vec![opcode];
        v.extend_from_slice(&arg.to_le_bytes());
        v
    }

    /// Flatten a bitstream's ConfigSend chunks so chunking differences don't
    /// matter when comparing split deliveries.
    fn sent_bitstream(ops: &[Op]) -> Vec<u8> {
        ops.iter()
            .filter_map(|op| match op {
                Op::ConfigSend(chunk) => Some(chunk.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn set_dac_shifts_through_to_board() {
        let mut fsm = CommandFsm::new();
        let mut board = MockBoard::default();
        fsm.process(&cmd(OPCODE_SET_DAC, 0x100), &mut board);
        assert_eq!(board.ops, vec![Op::SetGain(0x100)]);
        assert_eq!(fsm.take_reply(), Some(REPLY_OK));
        assert_eq!(fsm.take_reply(), None);
    }

    #[test]
    fn set_dac_failure_replies_f() {
        let mut fsm = CommandFsm::new();
        let mut board = MockBoard {
            fail_gain: true,
            ..Default::default()
        };
        fsm.process(&cmd(OPCODE_SET_DAC, 1), &mut board);
        assert_eq!(fsm.take_reply(), Some(REPLY_FAIL));
    }

    #[test]
    fn reply_bytes_are_ascii_o_f() {
        assert_eq!(REPLY_OK.to_le_bytes(), [0x4F, 0x00]);
        assert_eq!(REPLY_FAIL.to_le_bytes(), [0x46, 0x00]);
    }

    #[test]
    fn bitstream_load_success_resets_io_levels() {
        let mut fsm = CommandFsm::new();
        let mut board = MockBoard::default();
        let mut buf = cmd(OPCODE_FPGA_CONFIG, 4);
        buf.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        fsm.process(&buf, &mut board);
        assert_eq!(
            board.ops,
            vec![
                Op::ConfigBegin,
                Op::ConfigSend(vec![0xAA, 0xBB, 0xCC, 0xDD]),
                Op::ConfigTerminate,
                Op::IoInit,
            ]
        );
        assert_eq!(fsm.take_reply(), Some(REPLY_OK));
    }

    #[test]
    fn bitstream_terminate_failure_skips_io_init() {
        let mut fsm = CommandFsm::new();
        let mut board = MockBoard {
            fail_terminate: true,
            ..Default::default()
        };
        let mut buf = cmd(OPCODE_FPGA_CONFIG, 2);
        buf.extend_from_slice(&[0x01, 0x02]);
        fsm.process(&buf, &mut board);
        assert!(!board.ops.contains(&Op::IoInit));
        assert_eq!(fsm.take_reply(), Some(REPLY_FAIL));
    }

    #[test]
    fn bitstream_framing_excess_bytes_reparse_as_next_command() {
        let mut fsm = CommandFsm::new();
        let mut board = MockBoard::default();
        // 3-byte bitstream immediately followed by SET_DUT_POWER(1) in the
        // same delivery.
        let mut buf = cmd(OPCODE_FPGA_CONFIG, 3);
        buf.extend_from_slice(&[0x11, 0x22, 0x33]);
        buf.extend_from_slice(&cmd(OPCODE_SET_DUT_POWER, 1));
        fsm.process(&buf, &mut board);
        assert_eq!(sent_bitstream(&board.ops), vec![0x11, 0x22, 0x33]);
        assert_eq!(board.ops.last(), Some(&Op::SetDutPower(true)));
        // Last reply wins: the power command overwrote the config reply.
        assert_eq!(fsm.take_reply(), Some(REPLY_OK));
    }

    #[test]
    fn delivery_splits_do_not_change_observed_behavior() {
        // One bitstream command plus a trailing command, delivered at every
        // possible split point, must always produce the same side effects.
        let mut reference_board = MockBoard::default();
        let mut whole = cmd(OPCODE_FPGA_CONFIG, 5);
        whole.extend_from_slice(&[1, 2, 3, 4, 5]);
        whole.extend_from_slice(&cmd(OPCODE_SET_HEATER_PWM, 0x42));
        let mut fsm = CommandFsm::new();
        fsm.process(&whole, &mut reference_board);
        let reference_reply = fsm.take_reply();

        for split in 1..whole.len() {
            let mut fsm = CommandFsm::new();
            let mut board = MockBoard::default();
            fsm.process(&whole[..split], &mut board);
            fsm.process(&whole[split..], &mut board);
            assert_eq!(
                sent_bitstream(&board.ops),
                sent_bitstream(&reference_board.ops),
                "split at {split}"
            );
            assert_eq!(board.ops.last(), reference_board.ops.last());
            assert_eq!(fsm.take_reply(), reference_reply, "split at {split}");
        }
    }

    #[test]
    fn flash_payload_split_is_pushed_atomically() {
        let mut fsm = CommandFsm::new();
        let mut board = MockBoard::default();
        let payload: [u8; 16] = core::array::from_fn(|i| i as u8);
        fsm.process(&cmd(OPCODE_SET_FLASH_PAYLOAD, 0), &mut board);
        fsm.process(&payload[..7], &mut board);
        assert!(board.ops.is_empty());
        fsm.process(&payload[7..], &mut board);
        assert_eq!(board.ops, vec![Op::SetFlashPayload(payload)]);
        assert_eq!(fsm.take_reply(), Some(REPLY_OK));
    }

    #[test]
    fn measurement_commands_post_no_reply() {
        let mut fsm = CommandFsm::new();
        let mut board = MockBoard::default();
        fsm.process(&cmd(OPCODE_START_MEASUREMENT, 0), &mut board);
        assert_eq!(board.ops, vec![Op::StartSampling, Op::StartMeasurement]);
        assert_eq!(fsm.reply_pending(), None);
        fsm.process(&cmd(OPCODE_STOP_MEASUREMENT, 0), &mut board);
        assert_eq!(board.ops.last(), Some(&Op::StopSampling));
        assert_eq!(fsm.reply_pending(), None);
    }

    #[test]
    fn temperature_success_replies_raw_code() {
        let mut fsm = CommandFsm::new();
        let mut board = MockBoard {
            temperature: Some(0x6489),
            ..Default::default()
        };
        fsm.process(&cmd(OPCODE_GET_TEMPERATURE, 0), &mut board);
        assert_eq!(fsm.take_reply(), Some(0x6489));
    }

    #[test]
    fn temperature_timeout_replies_f() {
        let mut fsm = CommandFsm::new();
        let mut board = MockBoard::default();
        fsm.process(&cmd(OPCODE_GET_TEMPERATURE, 0), &mut board);
        assert_eq!(fsm.take_reply(), Some(REPLY_FAIL));
    }

    #[test]
    fn unknown_opcode_is_discarded_silently() {
        let mut fsm = CommandFsm::new();
        let mut board = MockBoard::default();
        let mut buf = cmd(0x7F, 0xDEADBEEF);
        buf.extend_from_slice(&cmd(OPCODE_SET_DUT_CLK_EN, 0));
        fsm.process(&buf, &mut board);
        assert_eq!(board.ops, vec![Op::SetDutClkEn(false)]);
        assert_eq!(fsm.take_reply(), Some(REPLY_OK));
    }

    #[test]
    fn reply_slot_is_last_write_wins() {
        let mut fsm = CommandFsm::new();
        let mut board = MockBoard {
            fail_gain: true,
            ..Default::default()
        };
        let mut buf = cmd(OPCODE_SET_DAC, 1); // fails -> 'F'
        buf.extend_from_slice(&cmd(OPCODE_SET_DUT_POWER, 0)); // ok -> 'O'
        fsm.process(&buf, &mut board);
        // Only the second reply survives.
        assert_eq!(fsm.take_reply(), Some(REPLY_OK));
        assert_eq!(fsm.take_reply(), None);
    }

    #[test]
    fn zero_length_bitstream_terminates_on_next_byte() {
        let mut fsm = CommandFsm::new();
        let mut board = MockBoard::default();
        let mut buf = cmd(OPCODE_FPGA_CONFIG, 0);
        buf.extend_from_slice(&cmd(OPCODE_SET_DUT_POWER, 1));
        fsm.process(&buf, &mut board);
        assert_eq!(sent_bitstream(&board.ops), Vec::<u8>::new());
        assert!(board.ops.contains(&Op::ConfigTerminate));
        assert_eq!(board.ops.last(), Some(&Op::SetDutPower(true)));
    }
}
