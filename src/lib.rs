//! mce-dsp is a userspace driver for the PCI DSP card of the MCE readout
//! system. It issues commands to the DSP through its host interface, services
//! the messages the DSP sends back, and receives the frames the card writes
//! by DMA into a ring buffer in host memory.
//!
//! The card registers are reached through a UIO device and the frame memory
//! is provided by a `u-dma-buf` device. A register-level model of the card
//! ([`sim::SimulatedCard`]) can stand in for the hardware.

#![warn(missing_docs)]

pub mod app;
pub mod args;
pub mod card;
pub mod datamode;
pub mod dispatch;
pub mod dmabuf;
pub mod engine;
pub mod error;
pub mod frames;
pub mod handlers;
pub mod message;
pub mod regs;
pub mod sim;
pub mod uio;
pub mod vector;

pub use error::{Error, Result};
