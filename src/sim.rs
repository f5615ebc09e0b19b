//! Simulated card.
//!
//! [`SimulatedCard`] models the DSP firmware at the register level, behind
//! the same [`HostInterface`] as the memory-mapped hardware. It is used by the
//! tests and by the daemon when no card is present.
//!
//! The model answers every standard command with a `REP` message and never
//! answers quick vectors. Outgoing messages are raised one at a time: the next
//! one is put into the receive FIFO (with HF3 set) only after the host has
//! acknowledged the previous one, either with `INT_DON` (legacy variant) or by
//! raising and then lowering HF0 (handshake variant). In the handshake
//! variant HF3 drops a configurable number of HSTR reads after HF0 rises.

use crate::datamode::QtSetting;
use crate::frames::FrameBuffer;
use crate::message::{Command, Message, RawMessage, Reply, ReplyStatus, WORDS};
use crate::regs::{hcvr, hctr, hstr, HostInterface, DATA_MASK};
use crate::vector::{self, CommandCode};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Firmware version reported by default.
pub const DEFAULT_VERSION: u32 = 0x55_01_05;

/// Configuration of a simulated card.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SimConfig {
    /// Version word returned by `VER`, or `None` for firmware that does not
    /// implement it (it answers `NAK`).
    pub version: Option<u32>,
    /// Depth of the transmit FIFO in words.
    pub tx_depth: usize,
    /// Whether standard commands are answered.
    pub replies: bool,
    /// HSTR reads after HF0 rises before HF3 drops.
    pub ack_delay: usize,
}

impl Default for SimConfig {
    fn default() -> SimConfig {
        SimConfig {
            version: Some(DEFAULT_VERSION),
            tx_depth: WORDS,
            replies: true,
            ack_delay: 0,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    hctr: u32,
    tx: Vec<u32>,
    rx: VecDeque<u32>,
    outbox: VecDeque<Vec<u32>>,
    hf3: bool,
    ack_countdown: Option<usize>,
    commands: Vec<Command>,
    vectors: Vec<u32>,
    quiet_head: usize,
    granted_tail: Option<usize>,
}

impl State {
    fn raise_next(&mut self) {
        if self.hf3 || self.hctr & hctr::HF0 != 0 {
            return;
        }
        if let Some(words) = self.outbox.pop_front() {
            self.rx.extend(words);
            self.hf3 = true;
        }
    }
}

/// Register-level model of a card.
#[derive(Debug)]
pub struct SimulatedCard {
    config: Mutex<SimConfig>,
    state: Mutex<State>,
}

impl SimulatedCard {
    /// Creates a simulated card.
    pub fn new(config: SimConfig) -> SimulatedCard {
        SimulatedCard {
            config: Mutex::new(config),
            state: Mutex::new(State::default()),
        }
    }

    /// Enables or disables replies to standard commands.
    pub fn set_replies(&self, replies: bool) {
        self.config.lock().unwrap().replies = replies;
    }

    /// Sets the number of HSTR reads after HF0 rises before HF3 drops.
    pub fn set_ack_delay(&self, ack_delay: usize) {
        self.config.lock().unwrap().ack_delay = ack_delay;
    }

    /// Gives the commands received so far.
    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Gives the vector addresses triggered so far, in order.
    pub fn vectors(&self) -> Vec<u32> {
        self.state.lock().unwrap().vectors.clone()
    }

    /// Returns `true` while a message is raised and not yet acknowledged.
    pub fn interrupt_pending(&self) -> bool {
        self.state.lock().unwrap().hf3
    }

    /// Gives the number of messages waiting to be raised.
    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().outbox.len()
    }

    /// Gives the last tail index granted by the host in quiet mode.
    pub fn granted_tail(&self) -> Option<usize> {
        self.state.lock().unwrap().granted_tail
    }

    /// Queues a message to the host.
    pub fn push_message(&self, message: Message) {
        self.push_words(RawMessage::from(message).0.to_vec());
    }

    /// Queues arbitrary words to the host as one message.
    ///
    /// This can be used to produce malformed messages.
    pub fn push_words(&self, words: Vec<u32>) {
        let mut state = self.state.lock().unwrap();
        state.outbox.push_back(words);
        state.raise_next();
    }

    /// Uploads one frame in classic mode.
    ///
    /// The frame is written at the head of the ring and an `NFY` message is
    /// queued.
    pub fn upload_frame(&self, frames: &FrameBuffer, data: &[u8]) {
        frames.write_frame(frames.head(), data);
        self.push_message(Message::Notify { data: 0 });
    }

    /// Uploads frames in quiet mode.
    ///
    /// The frames are written after the last one uploaded, whatever the state
    /// of the host tail, and a single `QTI` message carries the new head.
    pub fn upload_batch(&self, frames: &FrameBuffer, batch: &[&[u8]]) {
        let count = frames.count();
        let head = {
            let mut state = self.state.lock().unwrap();
            for data in batch {
                frames.write_frame(state.quiet_head, data);
                state.quiet_head = (state.quiet_head + 1) % count;
            }
            state.quiet_head
        };
        self.push_message(Message::QuietInform { head: head as u32 });
    }

    fn reply_to(&self, command: &Command) -> Reply {
        let config = self.config.lock().unwrap();
        match (command.code, config.version) {
            (CommandCode::VER, Some(version)) => Reply {
                command: command.code,
                status: ReplyStatus::Ack,
                data: version & DATA_MASK,
            },
            (CommandCode::VER, None) => Reply {
                command: command.code,
                status: ReplyStatus::Nak,
                data: 0,
            },
            _ => Reply {
                command: command.code,
                status: ReplyStatus::Ack,
                data: command.args[0],
            },
        }
    }

    fn run_command(&self, state: &mut State, command: Command) {
        if command.code == CommandCode::QTS {
            let value = command.args[1] as usize;
            match command.args[0] {
                x if x == QtSetting::Head as u32 => state.quiet_head = value,
                x if x == QtSetting::Tail as u32 => state.granted_tail = Some(value),
                _ => (),
            }
        }
        state.commands.push(command);
        if self.config.lock().unwrap().replies {
            let reply = self.reply_to(&command);
            state
                .outbox
                .push_back(RawMessage::from(Message::Reply(reply)).0.to_vec());
        }
    }
}

impl HostInterface for SimulatedCard {
    fn read_hstr(&self) -> u32 {
        let tx_depth = self.config.lock().unwrap().tx_depth;
        let mut state = self.state.lock().unwrap();
        match state.ack_countdown {
            Some(0) => {
                state.ack_countdown = None;
                state.hf3 = false;
            }
            Some(n) => state.ack_countdown = Some(n - 1),
            None => (),
        }
        let mut value = 0;
        if state.tx.is_empty() {
            value |= hstr::TRDY;
        }
        if state.tx.len() < tx_depth {
            value |= hstr::HTRQ;
        }
        if !state.rx.is_empty() {
            value |= hstr::HRRQ;
        }
        if state.hf3 {
            value |= hstr::HF3;
        }
        value
    }

    fn read_hctr(&self) -> u32 {
        self.state.lock().unwrap().hctr
    }

    fn write_hctr(&self, value: u32) {
        let ack_delay = self.config.lock().unwrap().ack_delay;
        let mut state = self.state.lock().unwrap();
        let previous = state.hctr;
        state.hctr = value;
        let rising = value & !previous & hctr::HF0 != 0;
        let falling = previous & !value & hctr::HF0 != 0;
        if rising && state.hf3 {
            state.ack_countdown = Some(ack_delay);
        }
        if falling {
            state.raise_next();
        }
    }

    fn read_hcvr(&self) -> u32 {
        // vectors are taken immediately
        0
    }

    fn write_hcvr(&self, value: u32) {
        // the trigger bit is part of every vector address
        if value & hcvr::HC == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.vectors.push(value);
        match vector::command_for_address(value) {
            Some(CommandCode::INT_DON) => {
                state.hf3 = false;
                state.raise_next();
            }
            Some(
                CommandCode::INT_RST
                | CommandCode::INT_RPC
                | CommandCode::SYS_ERR
                | CommandCode::SYS_RST,
            ) => (),
            _ => {
                let words = std::mem::take(&mut state.tx);
                if let Ok(words) = <[u32; WORDS]>::try_from(words) {
                    self.run_command(&mut state, Command::from_words(words));
                }
                state.raise_next();
            }
        }
    }

    fn write_htxr(&self, value: u32) {
        let tx_depth = self.config.lock().unwrap().tx_depth;
        let mut state = self.state.lock().unwrap();
        if state.tx.len() < tx_depth {
            state.tx.push(value & DATA_MASK);
        }
    }

    fn read_hrxs(&self) -> u32 {
        self.state.lock().unwrap().rx.pop_front().unwrap_or(0)
    }
}
