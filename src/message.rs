//! Commands and messages exchanged with the DSP.
//!
//! Both are four 24-bit words. A command is `{code, arg0, arg1, arg2}`. A
//! message is `{type, command, reply, data}`; it is decoded once, when the
//! dispatcher has drained it from the receive FIFO, into [`Message`].

use crate::regs::DATA_MASK;
use crate::vector::{mnemonic, CommandCode};
use serde::Serialize;

/// Number of words in a command or a message.
pub const WORDS: usize = 4;

/// Command sent to the DSP.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Command {
    /// Command code.
    pub code: CommandCode,
    /// Command arguments.
    pub args: [u32; 3],
}

impl Command {
    /// Creates a command.
    pub fn new(code: CommandCode, args: [u32; 3]) -> Command {
        Command { code, args }
    }

    /// Creates a command without arguments.
    pub fn bare(code: CommandCode) -> Command {
        Command::new(code, [0; 3])
    }

    /// Gives the words written to the transmit FIFO.
    pub fn words(&self) -> [u32; WORDS] {
        [
            self.code.0,
            self.args[0] & DATA_MASK,
            self.args[1] & DATA_MASK,
            self.args[2] & DATA_MASK,
        ]
    }

    /// Rebuilds a command from the words read out of the transmit FIFO.
    pub fn from_words(words: [u32; WORDS]) -> Command {
        Command::new(CommandCode(words[0]), [words[1], words[2], words[3]])
    }
}

/// Message type code, the first word of a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize)]
pub struct TypeCode(pub u32);

impl TypeCode {
    /// Reply to a DSP command.
    pub const REP: TypeCode = TypeCode(mnemonic(b"REP"));
    /// Diagnostic message from the firmware.
    pub const HEY: TypeCode = TypeCode(mnemonic(b"HEY"));
    /// A frame has been uploaded (classic mode).
    pub const NFY: TypeCode = TypeCode(mnemonic(b"NFY"));
    /// Frames have been uploaded and the head index advanced (quiet mode).
    pub const QTI: TypeCode = TypeCode(mnemonic(b"QTI"));
}

/// Status word of a reply.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize)]
pub enum ReplyStatus {
    /// The command was accepted.
    Ack,
    /// The command was rejected.
    Nak,
    /// Any other status word.
    Other(u32),
}

impl ReplyStatus {
    /// `ACK` word.
    pub const ACK: u32 = mnemonic(b"ACK");
    /// `NAK` word.
    pub const NAK: u32 = mnemonic(b"NAK");

    /// Decodes a reply status word.
    pub fn from_word(word: u32) -> ReplyStatus {
        match word {
            Self::ACK => ReplyStatus::Ack,
            Self::NAK => ReplyStatus::Nak,
            x => ReplyStatus::Other(x),
        }
    }

    /// Encodes the status as a word.
    pub fn word(&self) -> u32 {
        match self {
            ReplyStatus::Ack => Self::ACK,
            ReplyStatus::Nak => Self::NAK,
            ReplyStatus::Other(x) => *x,
        }
    }
}

/// Reply to a DSP command.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize)]
pub struct Reply {
    /// Code of the command being answered.
    pub command: CommandCode,
    /// Reply status.
    pub status: ReplyStatus,
    /// Reply data.
    pub data: u32,
}

impl Reply {
    /// Returns `true` if the DSP acknowledged the command.
    pub fn is_ack(&self) -> bool {
        self.status == ReplyStatus::Ack
    }
}

/// Message exactly as drained from the receive FIFO.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct RawMessage(pub [u32; WORDS]);

impl RawMessage {
    /// Gives the type code.
    pub fn type_code(&self) -> TypeCode {
        TypeCode(self.0[0])
    }
}

/// Message received from the DSP.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Message {
    /// `REP`: reply to the command in flight.
    Reply(Reply),
    /// `HEY`: diagnostic words from the firmware.
    Hey {
        /// First payload word
        command: u32,
        /// Second payload word
        reply: u32,
        /// Third payload word
        data: u32,
    },
    /// `NFY`: one frame has been written at the head of the ring.
    Notify {
        /// Notification payload
        data: u32,
    },
    /// `QTI`: frames have been written up to (excluding) `head`.
    QuietInform {
        /// New head index of the frame ring
        head: u32,
    },
    /// A message type this driver does not decode.
    Other(RawMessage),
}

impl From<RawMessage> for Message {
    fn from(raw: RawMessage) -> Message {
        let [type_code, command, reply, data] = raw.0;
        match TypeCode(type_code) {
            TypeCode::REP => Message::Reply(Reply {
                command: CommandCode(command),
                status: ReplyStatus::from_word(reply),
                data,
            }),
            TypeCode::HEY => Message::Hey {
                command,
                reply,
                data,
            },
            TypeCode::NFY => Message::Notify { data },
            TypeCode::QTI => Message::QuietInform { head: data },
            _ => Message::Other(raw),
        }
    }
}

impl From<Message> for RawMessage {
    fn from(message: Message) -> RawMessage {
        match message {
            Message::Reply(reply) => RawMessage([
                TypeCode::REP.0,
                reply.command.0,
                reply.status.word(),
                reply.data,
            ]),
            Message::Hey {
                command,
                reply,
                data,
            } => RawMessage([TypeCode::HEY.0, command, reply, data]),
            Message::Notify { data } => RawMessage([TypeCode::NFY.0, 0, 0, data]),
            Message::QuietInform { head } => RawMessage([TypeCode::QTI.0, 0, 0, head]),
            Message::Other(raw) => raw,
        }
    }
}

impl Message {
    /// Gives the type code under which handlers for this message are found.
    pub fn type_code(&self) -> TypeCode {
        match self {
            Message::Reply(_) => TypeCode::REP,
            Message::Hey { .. } => TypeCode::HEY,
            Message::Notify { .. } => TypeCode::NFY,
            Message::QuietInform { .. } => TypeCode::QTI,
            Message::Other(raw) => raw.type_code(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_reply() {
        let raw = RawMessage([
            TypeCode::REP.0,
            CommandCode::VER.0,
            ReplyStatus::ACK,
            0x550105,
        ]);
        assert_eq!(
            Message::from(raw),
            Message::Reply(Reply {
                command: CommandCode::VER,
                status: ReplyStatus::Ack,
                data: 0x550105,
            })
        );
    }

    #[test]
    fn decode_quiet_inform() {
        let raw = RawMessage([TypeCode::QTI.0, 0, 0, 7]);
        let message = Message::from(raw);
        assert_eq!(message, Message::QuietInform { head: 7 });
        assert_eq!(message.type_code(), TypeCode::QTI);
    }

    #[test]
    fn unknown_type_keeps_words() {
        let raw = RawMessage([0x123456, 1, 2, 3]);
        let message = Message::from(raw);
        assert_eq!(message, Message::Other(raw));
        assert_eq!(message.type_code(), TypeCode(0x123456));
        assert_eq!(RawMessage::from(message), raw);
    }

    #[test]
    fn command_words_are_masked() {
        let cmd = Command::new(CommandCode::WRM, [0xff00_0001, 2, 3]);
        assert_eq!(cmd.words(), [CommandCode::WRM.0, 1, 2, 3]);
    }
}
