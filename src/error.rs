//! Driver error type.
//!
//! Errors produced by the command engine, the interrupt dispatcher and the
//! frame ring buffer. Code that talks to the operating system (UIO devices,
//! DMA buffers, the daemon) uses [`anyhow`] instead; these errors convert into
//! `anyhow::Error` through `?`.

use crate::card::CardId;
use thiserror::Error;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a card.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The command engine already has a command in flight, or the DSP has not
    /// yet taken the previous vector. The caller should retry later.
    #[error("command engine busy")]
    Busy,

    /// Another caller holds the blocking command gate of this card.
    #[error("blocking command gate is held by another caller")]
    Retry,

    /// No reply was received before the command deadline.
    #[error("DSP reply timed out")]
    Timeout,

    /// The host interface did not report transmit-ready.
    #[error("HSTR not ready to transmit")]
    DeviceNotReady,

    /// Register-level inconsistency in the host interface protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The command code has no entry in the vector table.
    #[error("unknown command {0:#08x}")]
    UnknownCommand(u32),

    /// The requested frame payload size cannot be used.
    #[error("invalid frame data size {0:#x}")]
    InvalidSize(usize),

    /// The frame ring buffer holds no data.
    #[error("frame buffer is empty")]
    Empty,

    /// The handler registry has no free slots.
    #[error("no available handler slots (capacity {capacity})")]
    HandlerTableFull {
        /// Capacity of the registry
        capacity: usize,
    },

    /// No handler is registered for the type code.
    #[error("no handler registered for type {0:#08x}")]
    NoHandler(u32),

    /// No card is online at the given slot.
    #[error("no card online at slot {0}")]
    NoSuchCard(CardId),

    /// All card slots are in use.
    #[error("too many cards, registry is full")]
    RegistryFull,

    /// The card was taken offline while the operation was pending.
    #[error("card went offline")]
    Offline,
}
