//! DSP host interface registers.
//!
//! The card exposes the host interface of its DSP in BAR0. Only four registers
//! take part in the command protocol (HSTR, HCVR, HTXR and HRXS, the last two
//! sharing an address), plus HCTR, which holds the handshake and mode flags.
//!
//! The [`HostInterface`] trait abstracts register access so that the protocol
//! code can run against the memory-mapped hardware ([`MmioRegisters`]) or
//! against a firmware model ([`crate::sim::SimulatedCard`]).

use crate::uio::Mapping;
use vcell::VolatileCell;

/// Mask of the 24-bit DSP data word.
pub const DATA_MASK: u32 = 0x00ff_ffff;

/// Host status register (HSTR) bits.
pub mod hstr {
    /// Transmitter ready: the transmit FIFO is empty.
    pub const TRDY: u32 = 0x01;
    /// Host transmit data request: the transmit FIFO can take a word.
    pub const HTRQ: u32 = 0x02;
    /// Host receive data request: the receive FIFO holds a word.
    pub const HRRQ: u32 = 0x04;
    /// Host flag 3, raised by the DSP while an interrupt is pending.
    pub const HF3: u32 = 0x08;
}

/// Host command vector register (HCVR) bits.
pub mod hcvr {
    /// Host command trigger. Cleared by the DSP once the vector is taken.
    pub const HC: u32 = 0x01;
    /// Non-maskable host command.
    pub const HNMI: u32 = 0x8000;
    /// Clears the PCI interrupt line.
    pub const INT_RST: u32 = HNMI | 0x0073;
    /// Clears HF3 after the host has read the message.
    pub const INT_DON: u32 = HNMI | 0x0075;
    /// Raises a DSP system error.
    pub const SYS_ERR: u32 = HNMI | 0x0077;
    /// Resets the DSP.
    pub const SYS_RST: u32 = HNMI | 0x008b;
    /// Clears the reply-pending condition.
    pub const INT_RPC: u32 = HNMI | 0x008d;
}

/// Host control register (HCTR) bits.
pub mod hctr {
    /// Host flag 0: the host acknowledges the interrupt.
    pub const HF0: u32 = 0x08;
    /// Host flag 1: enables the acknowledge-then-wait-for-drop handshake.
    pub const HF1: u32 = 0x10;
    /// Host flag 2: the host polls instead of taking interrupts.
    pub const HF2: u32 = 0x20;
    /// Base mode of the data path (24-bit words right-aligned in 32 bits).
    pub const BASE_MODE: u32 = 0x900;
    /// Handshake mode flag.
    pub const MODE_HANDSHAKE: u32 = HF1;
    /// No-interrupt mode flag.
    pub const MODE_NOIRQ: u32 = HF2;
}

/// Access to the DSP host interface registers.
///
/// Implementations must be callable from the dispatcher task and from command
/// issuers concurrently. They do no locking of their own beyond what is
/// needed to keep a single register access atomic.
pub trait HostInterface: Send + Sync + std::fmt::Debug {
    /// Reads the host status register.
    fn read_hstr(&self) -> u32;
    /// Reads the host control register.
    fn read_hctr(&self) -> u32;
    /// Writes the host control register.
    fn write_hctr(&self, value: u32);
    /// Reads the host command vector register.
    fn read_hcvr(&self) -> u32;
    /// Writes the host command vector register.
    fn write_hcvr(&self, value: u32);
    /// Writes one word into the transmit FIFO.
    fn write_htxr(&self, value: u32);
    /// Reads one word from the receive FIFO.
    fn read_hrxs(&self) -> u32;
}

/// Layout of the host interface in BAR0.
#[repr(C)]
pub struct RegisterBlock {
    _reserved: [VolatileCell<u32>; 4],
    hctr: VolatileCell<u32>,
    hstr: VolatileCell<u32>,
    hcvr: VolatileCell<u32>,
    htxr_hrxs: VolatileCell<u32>,
}

/// Memory-mapped host interface registers.
///
/// This wraps the UIO mapping of BAR0 of the card.
#[derive(Debug)]
pub struct MmioRegisters(Mapping);

// The mapping is only accessed through volatile reads and writes of aligned
// 32-bit registers.
unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Wraps a mapping of BAR0.
    ///
    /// Fails if the mapping is too small to contain the host interface.
    pub fn new(mapping: Mapping) -> anyhow::Result<MmioRegisters> {
        if mapping.size() < std::mem::size_of::<RegisterBlock>() {
            anyhow::bail!(
                "register mapping is too small ({:#x} bytes)",
                mapping.size()
            );
        }
        Ok(MmioRegisters(mapping))
    }

    fn block(&self) -> &RegisterBlock {
        unsafe { &*(self.0.addr() as *const RegisterBlock) }
    }
}

macro_rules! impl_host_interface {
    (read: [$($read:ident => $rfield:ident),*], write: [$($write:ident => $wfield:ident),*]) => {
        paste::paste! {
            impl HostInterface for MmioRegisters {
                $(
                    fn [<read_ $read>](&self) -> u32 {
                        self.block().$rfield.get()
                    }
                )*
                $(
                    fn [<write_ $write>](&self, value: u32) {
                        self.block().$wfield.set(value)
                    }
                )*
            }
        }
    };
}

impl_host_interface!(
    read: [hstr => hstr, hctr => hctr, hcvr => hcvr, hrxs => htxr_hrxs],
    write: [hctr => hctr, hcvr => hcvr, htxr => htxr_hrxs]
);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_offsets() {
        let block = std::mem::MaybeUninit::<RegisterBlock>::uninit();
        let base = block.as_ptr() as usize;
        let offset = |field: *const VolatileCell<u32>| field as usize - base;
        unsafe {
            let p = block.as_ptr();
            assert_eq!(offset(std::ptr::addr_of!((*p).hctr)), 0x10);
            assert_eq!(offset(std::ptr::addr_of!((*p).hstr)), 0x14);
            assert_eq!(offset(std::ptr::addr_of!((*p).hcvr)), 0x18);
            assert_eq!(offset(std::ptr::addr_of!((*p).htxr_hrxs)), 0x1c);
        }
        assert_eq!(std::mem::size_of::<RegisterBlock>(), 0x20);
    }
}
