//! Command codes and the host command vector table.
//!
//! Each command the host can issue is triggered through a host command vector
//! of the DSP. Standard vectors read the four command words from the transmit
//! FIFO and answer with a `REP` message; quick vectors take no payload and
//! never answer.

use crate::regs::hcvr;
use serde::Serialize;

/// Packs a three-letter mnemonic into a 24-bit DSP word.
pub const fn mnemonic(s: &[u8; 3]) -> u32 {
    ((s[0] as u32) << 16) | ((s[1] as u32) << 8) | s[2] as u32
}

/// Command code, the first word of a command.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize)]
pub struct CommandCode(pub u32);

impl CommandCode {
    /// Write DSP memory.
    pub const WRM: CommandCode = CommandCode(mnemonic(b"WRM"));
    /// Read DSP memory.
    pub const RDM: CommandCode = CommandCode(mnemonic(b"RDM"));
    /// Query firmware version.
    pub const VER: CommandCode = CommandCode(mnemonic(b"VER"));
    /// Start application.
    pub const GOA: CommandCode = CommandCode(mnemonic(b"GOA"));
    /// Stop application.
    pub const STP: CommandCode = CommandCode(mnemonic(b"STP"));
    /// Soft reset.
    pub const RST: CommandCode = CommandCode(mnemonic(b"RST"));
    /// Send a command packet to the instrument.
    pub const CON: CommandCode = CommandCode(mnemonic(b"CON"));
    /// Set host buffer address.
    pub const HST: CommandCode = CommandCode(mnemonic(b"HST"));
    /// Reset the instrument controller.
    pub const RCO: CommandCode = CommandCode(mnemonic(b"RCO"));
    /// Quiet transfer setup.
    pub const QTS: CommandCode = CommandCode(mnemonic(b"QTS"));
    /// Clear the PCI interrupt line.
    pub const INT_RST: CommandCode = CommandCode(mnemonic(b"IRS"));
    /// Clear HF3.
    pub const INT_DON: CommandCode = CommandCode(mnemonic(b"IDN"));
    /// Clear the reply-pending condition.
    pub const INT_RPC: CommandCode = CommandCode(mnemonic(b"IRP"));
    /// Raise a system error.
    pub const SYS_ERR: CommandCode = CommandCode(mnemonic(b"SER"));
    /// Reset the DSP.
    pub const SYS_RST: CommandCode = CommandCode(mnemonic(b"SRS"));
}

impl std::fmt::Display for CommandCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let bytes = self.0.to_be_bytes();
        if bytes[0] == 0 && bytes[1..].iter().all(u8::is_ascii_uppercase) {
            write!(
                f,
                "{}{}{}",
                bytes[1] as char, bytes[2] as char, bytes[3] as char
            )
        } else {
            write!(f, "{:#08x}", self.0)
        }
    }
}

/// How a vector is dispatched.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize)]
pub enum DispatchStyle {
    /// The four command words are written to HTXR before the trigger, and the
    /// DSP replies.
    Standard,
    /// Trigger only. No reply is ever produced.
    Quick,
}

/// Host command vector.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Vector {
    /// Vector address written to HCVR together with the trigger bit.
    pub address: u32,
    /// Dispatch style.
    pub style: DispatchStyle,
}

const fn standard(address: u32) -> Vector {
    Vector {
        address,
        style: DispatchStyle::Standard,
    }
}

const fn quick(address: u32) -> Vector {
    Vector {
        address,
        style: DispatchStyle::Quick,
    }
}

static VECTORS: [(CommandCode, Vector); 15] = [
    (CommandCode::WRM, standard(0x0079)),
    (CommandCode::RDM, standard(0x007b)),
    (CommandCode::VER, standard(0x007b)),
    (CommandCode::GOA, standard(0x007d)),
    (CommandCode::STP, standard(0x007f)),
    (CommandCode::RST, standard(0x0081)),
    (CommandCode::CON, standard(0x0083)),
    (CommandCode::HST, standard(0x0085)),
    (CommandCode::RCO, standard(0x0087)),
    (CommandCode::QTS, standard(0x0089)),
    (CommandCode::INT_RST, quick(hcvr::INT_RST)),
    (CommandCode::INT_DON, quick(hcvr::INT_DON)),
    (CommandCode::INT_RPC, quick(hcvr::INT_RPC)),
    (CommandCode::SYS_ERR, quick(hcvr::SYS_ERR)),
    (CommandCode::SYS_RST, quick(hcvr::SYS_RST)),
];

/// Looks up the vector of a command.
pub fn lookup(code: CommandCode) -> Option<Vector> {
    VECTORS
        .iter()
        .find(|(key, _)| *key == code)
        .map(|(_, vector)| *vector)
}

/// Looks up the command that is triggered through a vector address.
///
/// When several commands share a vector (`RDM` and `VER`), the first one in the
/// table is returned.
pub fn command_for_address(address: u32) -> Option<CommandCode> {
    VECTORS
        .iter()
        .find(|(_, vector)| vector.address == address)
        .map(|(key, _)| *key)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mnemonics() {
        assert_eq!(CommandCode::VER.0, 0x564552);
        assert_eq!(CommandCode::VER.to_string(), "VER");
        assert_eq!(CommandCode(0x123).to_string(), "0x000123");
    }

    #[test]
    fn lookup_standard() {
        let vector = lookup(CommandCode::QTS).unwrap();
        assert_eq!(vector.address, 0x89);
        assert_eq!(vector.style, DispatchStyle::Standard);
    }

    #[test]
    fn lookup_quick() {
        let vector = lookup(CommandCode::INT_RPC).unwrap();
        assert_eq!(vector.address, hcvr::INT_RPC);
        assert_eq!(vector.style, DispatchStyle::Quick);
    }

    #[test]
    fn lookup_unknown() {
        assert!(lookup(CommandCode(mnemonic(b"XYZ"))).is_none());
    }

    #[test]
    fn addresses_carry_trigger_bit() {
        for (code, vector) in VECTORS.iter() {
            assert_ne!(vector.address & hcvr::HC, 0, "{code}");
            assert_eq!(vector.address | hcvr::HC, vector.address);
        }
    }

    #[test]
    fn command_from_address() {
        assert_eq!(command_for_address(hcvr::INT_DON), Some(CommandCode::INT_DON));
        assert_eq!(command_for_address(0x89), Some(CommandCode::QTS));
        // RDM and VER share a vector
        assert_eq!(command_for_address(0x7b), Some(CommandCode::RDM));
        assert_eq!(command_for_address(hcvr::INT_DON & !hcvr::HC), None);
    }

    #[test]
    fn codes_are_unique() {
        for (i, (a, _)) in VECTORS.iter().enumerate() {
            assert!(VECTORS[i + 1..].iter().all(|(b, _)| a != b));
        }
    }
}
