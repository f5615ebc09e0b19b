//! mce-dsp application.
//!
//! This module contains a top-level structure [`App`] that represents the
//! whole mce-dsp daemon.

use crate::{
    args::Args,
    card::{CardConfig, CardId, CardRegistry, IrqMode},
    datamode::DataMode,
    dispatch::IrqSource,
    dmabuf::{HostBuffer, UdmaBuffer},
    regs::MmioRegisters,
    sim::{SimConfig, SimulatedCard},
    uio::{Uio, BAR0},
};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Interval between frames uploaded by simulated cards.
const SIM_FRAME_PERIOD: Duration = Duration::from_millis(100);
/// Size of the read buffer used to stream frames to the output file.
const STREAM_CHUNK: usize = 64 * 1024;

/// mce-dsp application.
///
/// This struct represents the mce-dsp daemon. It owns the card registry and
/// runs the frame stream, the status reports and, when cards are simulated,
/// the frame generator concurrently.
#[derive(Debug)]
pub struct App {
    registry: Arc<CardRegistry>,
    simulators: Vec<(CardId, Arc<SimulatedCard>)>,
    output: Option<PathBuf>,
    status_interval: Duration,
}

impl App {
    /// Creates a new application, bringing all the cards online.
    #[tracing::instrument(name = "App::new", level = "debug")]
    pub async fn new(args: &Args) -> Result<App> {
        tracing::info!(
            "mce-dsp {}",
            git_version::git_version!(fallback = "unknown")
        );
        let mut config = match &args.config {
            Some(path) => CardConfig::from_file(path).await?,
            None => CardConfig::default(),
        };
        if args.polling {
            config.irq_mode = IrqMode::Polling;
        }
        if args.quiet {
            config.data_mode = DataMode::Quiet;
        }
        if let Some(data_size) = args.data_size {
            config.data_size = data_size;
        }

        let registry = Arc::new(CardRegistry::new());
        let mut simulators = Vec::new();
        if args.simulate {
            for _ in 0..args.sim_cards {
                let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
                let region = HostBuffer::new(args.sim_buffer_size)?;
                // simulated cards have no interrupt line
                let irq = IrqSource::Polling(config.poll_period());
                let id = registry
                    .bring_up(config.clone(), sim.clone(), Box::new(region), irq)
                    .await?;
                simulators.push((id, sim));
            }
        } else {
            if args.uio.len() != args.dma_buffers.len() {
                anyhow::bail!(
                    "{} UIO devices given but {} DMA buffers",
                    args.uio.len(),
                    args.dma_buffers.len()
                );
            }
            for (uio_name, dma_name) in args.uio.iter().zip(&args.dma_buffers) {
                let uio = Uio::open(uio_name).await?;
                let bar0 = uio.map(BAR0).await?;
                tracing::info!(
                    "{uio_name} is uio{} with registers at {:#x}",
                    uio.index(),
                    bar0.info().addr
                );
                let regs = Arc::new(MmioRegisters::new(bar0)?);
                let region = UdmaBuffer::new(dma_name).await?;
                let irq = match config.irq_mode {
                    IrqMode::Interrupt => IrqSource::Uio(uio),
                    IrqMode::Polling => IrqSource::Polling(config.poll_period()),
                };
                registry
                    .bring_up(config.clone(), regs, Box::new(region), irq)
                    .await
                    .with_context(|| format!("failed to bring up {uio_name}"))?;
            }
        }

        Ok(App {
            registry,
            simulators,
            output: args.output.clone(),
            status_interval: Duration::from_secs(args.status_interval.max(1)),
        })
    }

    /// Gives the card registry.
    pub fn registry(&self) -> &Arc<CardRegistry> {
        &self.registry
    }

    /// Runs the application.
    ///
    /// This returns on Ctrl-C or if one of the objects that form the
    /// application fails. The cards are taken offline before returning.
    #[tracing::instrument(name = "App::run", level = "debug", skip_all)]
    pub async fn run(self) -> Result<()> {
        let ret = tokio::select! {
            ret = self.stream() => ret,
            ret = self.report_status() => ret,
            ret = self.feed_simulators() => ret,
            ret = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                ret.map_err(anyhow::Error::from)
            }
        };
        self.registry.shutdown();
        ret
    }

    async fn stream(&self) -> Result<()> {
        let Some(path) = &self.output else {
            return std::future::pending().await;
        };
        let card = self.registry.get(CardId(0))?;
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut buffer = vec![0; STREAM_CHUNK];
        loop {
            let n = card.read(&mut buffer, false).await;
            file.write_all(&buffer[..n]).await?;
        }
    }

    async fn report_status(&self) -> Result<()> {
        let mut interval = tokio::time::interval(self.status_interval);
        loop {
            interval.tick().await;
            for status in self.registry.status() {
                tracing::info!("{}", serde_json::to_string(&status)?);
            }
        }
    }

    async fn feed_simulators(&self) -> Result<()> {
        if self.simulators.is_empty() {
            return std::future::pending().await;
        }
        let mut interval = tokio::time::interval(SIM_FRAME_PERIOD);
        let mut sequence = 0u32;
        loop {
            interval.tick().await;
            for (id, sim) in &self.simulators {
                let card = self.registry.get(*id)?;
                let data = sequence
                    .to_le_bytes()
                    .into_iter()
                    .cycle()
                    .take(card.frames().data_size())
                    .collect::<Vec<u8>>();
                match card.data_mode() {
                    DataMode::Classic => sim.upload_frame(card.frames(), &data),
                    DataMode::Quiet => sim.upload_batch(card.frames(), &[&data]),
                }
            }
            sequence = sequence.wrapping_add(1);
        }
    }
}
