//! mce-dsp CLI arguments.
//!
//! This module contains the definition of the CLI arguments for the mce-dsp
//! daemon.

use clap::Parser;
use std::path::PathBuf;

/// mce-dsp CLI arguments.
#[derive(Parser, Debug, Clone, Eq, PartialEq, Hash)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// UIO device of a card (repeat for several cards)
    #[clap(long = "uio", default_value = "mce-dsp")]
    pub uio: Vec<String>,
    /// u-dma-buf device holding the frames of each card, in --uio order
    #[clap(long = "dma-buffer", default_value = "udmabuf0")]
    pub dma_buffers: Vec<String>,
    /// Drive simulated cards instead of hardware
    #[clap(long)]
    pub simulate: bool,
    /// Number of simulated cards
    #[clap(long, default_value_t = 1)]
    pub sim_cards: usize,
    /// Size of the frame buffer of simulated cards in bytes
    #[clap(long, default_value_t = 0x10_0000)]
    pub sim_buffer_size: usize,
    /// Card configuration file (JSON)
    #[clap(long)]
    pub config: Option<PathBuf>,
    /// Poll the cards instead of waiting for interrupts
    #[clap(long)]
    pub polling: bool,
    /// Use quiet frame transfers
    #[clap(long)]
    pub quiet: bool,
    /// Frame payload size in bytes
    #[clap(long)]
    pub data_size: Option<usize>,
    /// File where the frames of the first card are written
    #[clap(long)]
    pub output: Option<PathBuf>,
    /// Interval between status reports in seconds
    #[clap(long, default_value_t = 10)]
    pub status_interval: u64,
}
