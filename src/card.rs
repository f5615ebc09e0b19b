//! Cards and the card registry.
//!
//! A [`Card`] owns everything needed to drive one DSP card: its host
//! interface registers, the command engine, the interrupt dispatcher, the
//! frame ring and the tasks that run them. Cards are brought online into a
//! [`CardRegistry`] slot and addressed by [`CardId`].

use crate::datamode::{self, ClassicProducer, DataMode, QuietConfig, QuietProducer};
use crate::dispatch::{DiagnosticHandler, DispatchCounters, Dispatcher, IrqReturn, IrqSource};
use crate::dmabuf::DmaRegion;
use crate::engine::{CommandEngine, EngineCounters, EngineState, ReplyHandler};
use crate::error::{Error, Result};
use crate::frames::{FrameBuffer, FrameStatus, DMA_ALIGN};
use crate::handlers::DEFAULT_CAPACITY;
use crate::message::{Command, Reply, TypeCode};
use crate::regs::{hctr, hcvr, HostInterface};
use crate::vector::CommandCode;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Maximum number of cards online at once.
pub const MAX_CARDS: usize = 4;

/// Identifier of a card, its slot in the [`CardRegistry`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct CardId(pub usize);

impl std::fmt::Display for CardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Interrupt delivery mode.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IrqMode {
    /// PCI interrupts through the UIO device.
    #[default]
    Interrupt,
    /// The card is polled periodically.
    Polling,
}

/// Configuration of a card.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardConfig {
    /// Payload bytes per frame.
    pub data_size: usize,
    /// DMA alignment of frames.
    pub frame_align: usize,
    /// Command deadline in milliseconds.
    pub command_timeout_ms: u64,
    /// Interrupt delivery mode.
    pub irq_mode: IrqMode,
    /// Polling period in milliseconds, in polling mode.
    pub poll_period_ms: u64,
    /// Frame transfer mode.
    pub data_mode: DataMode,
    /// Number of message handler slots.
    pub handler_capacity: usize,
    /// Quiet transfer settings.
    pub quiet: QuietConfig,
}

impl Default for CardConfig {
    fn default() -> CardConfig {
        CardConfig {
            data_size: 0x1000,
            frame_align: DMA_ALIGN,
            command_timeout_ms: 500,
            irq_mode: IrqMode::default(),
            poll_period_ms: 10,
            data_mode: DataMode::default(),
            handler_capacity: DEFAULT_CAPACITY,
            quiet: QuietConfig::default(),
        }
    }
}

impl CardConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// Fields missing in the file take their default values.
    pub async fn from_file(path: &Path) -> anyhow::Result<CardConfig> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Gives the command deadline.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Gives the polling period.
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }
}

/// Version of the DSP firmware.
///
/// The version word holds a letter in bits 16 to 23 and the major and minor
/// numbers in the low bytes, so `0x550105` is `U0105`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct FirmwareVersion(pub u32);

impl FirmwareVersion {
    /// Oldest known version. Firmware that does not answer `VER` is at most
    /// this version.
    pub const U0103: FirmwareVersion = FirmwareVersion(0x55_01_03);
    /// First version supporting quiet transfers.
    pub const U0104: FirmwareVersion = FirmwareVersion(0x55_01_04);
    /// First version supporting the handshake acknowledge.
    pub const U0105: FirmwareVersion = FirmwareVersion(0x55_01_05);

    /// Returns `true` if the firmware supports quiet transfers.
    pub fn supports_quiet(self) -> bool {
        self >= FirmwareVersion::U0104
    }

    /// Returns `true` if the firmware supports the handshake acknowledge.
    pub fn supports_handshake(self) -> bool {
        self >= FirmwareVersion::U0105
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [_, letter, major, minor] = self.0.to_be_bytes();
        write!(f, "{}{major:02}{minor:02}", letter as char)
    }
}

/// Snapshot of the state of a card.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CardStatus {
    /// Card identifier.
    pub card: CardId,
    /// Firmware version.
    pub firmware: String,
    /// Command engine state.
    pub engine: EngineState,
    /// Command engine counters.
    pub commands: EngineCounters,
    /// Dispatcher counters.
    pub messages: DispatchCounters,
    /// Whether the card is polled instead of interrupting.
    pub polling: bool,
    /// Whether the handshake acknowledge is in use.
    pub handshake: bool,
    /// Frame transfer mode.
    pub data_mode: DataMode,
    /// Registered message handlers.
    pub handlers: usize,
    /// Frame ring state.
    pub frames: FrameStatus,
}

/// A card online.
#[derive(Debug)]
pub struct Card {
    id: CardId,
    config: CardConfig,
    regs: Arc<dyn HostInterface>,
    engine: Arc<CommandEngine>,
    dispatcher: Arc<Dispatcher>,
    frames: Arc<FrameBuffer>,
    runtime: Handle,
    firmware: Mutex<FirmwareVersion>,
    data_mode: Mutex<DataMode>,
    irq_task: Mutex<Option<AbortHandle>>,
    grant_task: Mutex<Option<AbortHandle>>,
}

impl Card {
    /// Brings a card online.
    ///
    /// The frame ring is laid out in `region`, interrupts are taken from
    /// `irq`, the firmware version is queried and the configured data mode is
    /// set up. If any step fails the card is shut down again.
    #[tracing::instrument(name = "Card::bring_up", level = "debug", skip(regs, region, irq))]
    pub async fn bring_up(
        id: CardId,
        config: CardConfig,
        regs: Arc<dyn HostInterface>,
        region: Box<dyn DmaRegion>,
        irq: IrqSource,
    ) -> Result<Arc<Card>> {
        let runtime = Handle::current();
        let frames = Arc::new(FrameBuffer::new(
            region,
            config.data_size,
            config.frame_align,
        )?);

        // Clear any interrupt left pending by a previous user
        regs.write_hcvr(hcvr::INT_RST | hcvr::HC);
        regs.write_hcvr(hcvr::INT_DON | hcvr::HC);

        let engine = CommandEngine::new(
            id,
            Arc::clone(&regs),
            config.command_timeout(),
            runtime.clone(),
        );
        let dispatcher = Dispatcher::new(
            id,
            Arc::clone(&regs),
            config.handler_capacity,
            runtime.clone(),
        );
        let mut mode = hctr::BASE_MODE;
        if irq.is_polling() {
            mode |= hctr::MODE_NOIRQ;
        }
        dispatcher.set_comm_mode(mode);
        dispatcher.flush();
        dispatcher
            .handlers()
            .register(TypeCode::REP, Arc::new(ReplyHandler(Arc::clone(&engine))))?;
        dispatcher
            .handlers()
            .register(TypeCode::HEY, Arc::new(DiagnosticHandler))?;

        let irq_task = {
            let dispatcher = Arc::clone(&dispatcher);
            runtime
                .spawn(async move {
                    if let Err(err) = irq.run(dispatcher).await {
                        tracing::error!(card = %id, "interrupt source failed: {err:#}");
                    }
                })
                .abort_handle()
        };

        let card = Arc::new(Card {
            id,
            config,
            regs,
            engine,
            dispatcher,
            frames,
            runtime,
            firmware: Mutex::new(FirmwareVersion::U0103),
            data_mode: Mutex::new(DataMode::Classic),
            irq_task: Mutex::new(Some(irq_task)),
            grant_task: Mutex::new(None),
        });
        if let Err(err) = card.start().await {
            tracing::error!(card = %id, "bring-up failed: {err}");
            card.shutdown();
            return Err(err);
        }
        tracing::info!(
            card = %id,
            "card online: firmware {}, {} mode, {}",
            card.firmware(),
            card.data_mode(),
            if card.dispatcher.polling() {
                "polling"
            } else {
                "interrupts"
            }
        );
        Ok(card)
    }

    async fn start(&self) -> Result<()> {
        let firmware = self.query_firmware().await?;
        if firmware.supports_handshake() {
            tracing::info!(card = %self.id, "enabling interrupt handshake");
            self.dispatcher
                .set_comm_mode(self.dispatcher.comm_mode() | hctr::MODE_HANDSHAKE);
        }
        self.set_data_mode(self.config.data_mode).await
    }

    async fn query_firmware(&self) -> Result<FirmwareVersion> {
        let reply = self.send_command(Command::bare(CommandCode::VER)).await?;
        let version = if reply.is_ack() {
            FirmwareVersion(reply.data)
        } else {
            FirmwareVersion::U0103
        };
        tracing::info!(card = %self.id, "discovered firmware version {version}");
        *self.firmware.lock().unwrap() = version;
        Ok(version)
    }

    /// Gives the card identifier.
    pub fn id(&self) -> CardId {
        self.id
    }

    /// Gives the card configuration.
    pub fn config(&self) -> &CardConfig {
        &self.config
    }

    /// Gives the firmware version found at bring-up.
    pub fn firmware(&self) -> FirmwareVersion {
        *self.firmware.lock().unwrap()
    }

    /// Gives the frame transfer mode in use.
    pub fn data_mode(&self) -> DataMode {
        *self.data_mode.lock().unwrap()
    }

    /// Gives the command engine.
    pub fn engine(&self) -> &Arc<CommandEngine> {
        &self.engine
    }

    /// Gives the interrupt dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Gives the frame ring.
    pub fn frames(&self) -> &Arc<FrameBuffer> {
        &self.frames
    }

    /// Issues a command and waits for its reply.
    pub async fn send_command(&self, command: Command) -> Result<Reply> {
        self.engine.send_sync(command).await
    }

    /// Switches the frame transfer mode.
    ///
    /// Quiet mode needs firmware U0104 or later. With older firmware classic
    /// mode is used instead.
    pub async fn set_data_mode(&self, mode: DataMode) -> Result<()> {
        let handlers = self.dispatcher.handlers();
        let previous = self.data_mode();
        let mode = if mode == DataMode::Quiet && !self.firmware().supports_quiet() {
            tracing::warn!(
                card = %self.id,
                "firmware {} does not support quiet transfers, using classic mode",
                self.firmware()
            );
            DataMode::Classic
        } else {
            mode
        };
        match mode {
            DataMode::Classic => {
                self.stop_grant();
                handlers.remove(TypeCode::QTI).ok();
                handlers.register(
                    TypeCode::NFY,
                    Arc::new(ClassicProducer(Arc::clone(&self.frames))),
                )?;
                *self.data_mode.lock().unwrap() = mode;
                if previous == DataMode::Quiet {
                    datamode::disable_quiet(&self.engine).await?;
                }
            }
            DataMode::Quiet => {
                handlers.remove(TypeCode::NFY).ok();
                handlers.register(
                    TypeCode::QTI,
                    Arc::new(QuietProducer(Arc::clone(&self.frames))),
                )?;
                *self.data_mode.lock().unwrap() = mode;
                datamode::configure_quiet(&self.engine, &self.frames, &self.config.quiet).await?;
                self.start_grant();
            }
        }
        Ok(())
    }

    fn start_grant(&self) {
        let mut task = self.grant_task.lock().unwrap();
        if task.is_none() {
            *task = Some(
                self.runtime
                    .spawn(datamode::run_grant(
                        Arc::clone(&self.engine),
                        Arc::clone(&self.frames),
                    ))
                    .abort_handle(),
            );
        }
    }

    fn stop_grant(&self) {
        if let Some(task) = self.grant_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Changes the payload size of the frames.
    ///
    /// The ring must be empty. In quiet mode the card is reprogrammed with the
    /// new geometry.
    pub async fn set_data_size(&self, data_size: usize) -> Result<()> {
        self.frames.resize(data_size)?;
        if self.data_mode() == DataMode::Quiet {
            datamode::configure_quiet(&self.engine, &self.frames, &self.config.quiet).await?;
        }
        Ok(())
    }

    /// Empties the frame ring.
    ///
    /// In quiet mode the new indices are sent to the card. If that fails,
    /// quiet mode is abandoned.
    pub async fn reset(&self) -> Result<()> {
        self.frames.reset();
        if self.data_mode() == DataMode::Quiet {
            if let Err(err) = datamode::reset_quiet(&self.engine, &self.frames).await {
                tracing::error!(
                    card = %self.id,
                    "could not reset quiet transfer indices, disabling quiet mode: {err}"
                );
                if let Err(fallback) = self.set_data_mode(DataMode::Classic).await {
                    tracing::error!(card = %self.id, "could not disable quiet mode: {fallback}");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Reads frame payload into `dest`.
    ///
    /// Unless `nonblock` is set, this waits until a frame is available.
    pub async fn read(&self, dest: &mut [u8], nonblock: bool) -> usize {
        self.frames.read(dest, nonblock).await
    }

    /// Appends a synthetic stop frame to release a waiting reader.
    pub fn inject_stop_frame(&self) -> bool {
        self.frames.inject_stop_frame()
    }

    /// Gives a snapshot of the card state.
    pub fn status(&self) -> CardStatus {
        CardStatus {
            card: self.id,
            firmware: self.firmware().to_string(),
            engine: self.engine.state(),
            commands: self.engine.counters(),
            messages: self.dispatcher.counters(),
            polling: self.dispatcher.polling(),
            handshake: self.dispatcher.handshake(),
            data_mode: self.data_mode(),
            handlers: self.dispatcher.handlers().len(),
            frames: self.frames.status(),
        }
    }

    fn stop_tasks(&self) {
        self.stop_grant();
        self.dispatcher.stop();
        if let Some(task) = self.irq_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Takes the card offline.
    ///
    /// Its tasks are stopped, a command in flight fails with
    /// [`Error::Offline`] and HCTR is set back to the base mode.
    pub fn shutdown(&self) {
        self.stop_tasks();
        self.engine.shutdown();
        self.regs.write_hctr(hctr::BASE_MODE);
        tracing::info!(card = %self.id, "card offline");
    }
}

impl Drop for Card {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

#[derive(Debug)]
enum Slot {
    Free,
    Reserved,
    Online(Arc<Card>),
}

/// Registry of the cards online.
#[derive(Debug)]
pub struct CardRegistry {
    slots: Mutex<Vec<Slot>>,
}

impl CardRegistry {
    /// Creates an empty registry.
    pub fn new() -> CardRegistry {
        CardRegistry {
            slots: Mutex::new((0..MAX_CARDS).map(|_| Slot::Free).collect()),
        }
    }

    fn reserve(&self) -> Result<CardId> {
        let mut slots = self.slots.lock().unwrap();
        let index = slots
            .iter()
            .position(|slot| matches!(slot, Slot::Free))
            .ok_or_else(|| {
                tracing::error!("too many cards, only {MAX_CARDS} supported");
                Error::RegistryFull
            })?;
        slots[index] = Slot::Reserved;
        Ok(CardId(index))
    }

    /// Brings a card online in the first free slot.
    ///
    /// See [`Card::bring_up`]. The slot is released again if bring-up fails.
    pub async fn bring_up(
        &self,
        config: CardConfig,
        regs: Arc<dyn HostInterface>,
        region: Box<dyn DmaRegion>,
        irq: IrqSource,
    ) -> Result<CardId> {
        let id = self.reserve()?;
        let result = Card::bring_up(id, config, regs, region, irq).await;
        let mut slots = self.slots.lock().unwrap();
        match result {
            Ok(card) => {
                slots[id.0] = Slot::Online(card);
                Ok(id)
            }
            Err(err) => {
                slots[id.0] = Slot::Free;
                Err(err)
            }
        }
    }

    /// Gives the card online at a slot.
    pub fn get(&self, id: CardId) -> Result<Arc<Card>> {
        match self.slots.lock().unwrap().get(id.0) {
            Some(Slot::Online(card)) => Ok(Arc::clone(card)),
            _ => Err(Error::NoSuchCard(id)),
        }
    }

    /// Gives the identifiers of the cards online.
    pub fn online(&self) -> Vec<CardId> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Online(_)))
            .map(|(index, _)| CardId(index))
            .collect()
    }

    /// Services an interrupt for a card.
    ///
    /// Returns [`IrqReturn::None`] if no card is online at the slot.
    pub fn service_interrupt(&self, id: CardId) -> IrqReturn {
        match self.get(id) {
            Ok(card) => card.dispatcher().service(),
            Err(_) => IrqReturn::None,
        }
    }

    /// Takes a card offline and frees its slot.
    pub fn take_offline(&self, id: CardId) -> Result<()> {
        let card = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get_mut(id.0) {
                Some(slot @ Slot::Online(_)) => std::mem::replace(slot, Slot::Free),
                _ => return Err(Error::NoSuchCard(id)),
            }
        };
        if let Slot::Online(card) = card {
            card.shutdown();
        }
        Ok(())
    }

    /// Takes all the cards offline.
    pub fn shutdown(&self) {
        for id in self.online() {
            // the card may have been taken offline concurrently
            self.take_offline(id).ok();
        }
    }

    /// Gives a snapshot of the state of every card online.
    pub fn status(&self) -> Vec<CardStatus> {
        self.online()
            .into_iter()
            .filter_map(|id| self.get(id).ok())
            .map(|card| card.status())
            .collect()
    }
}

impl Default for CardRegistry {
    fn default() -> CardRegistry {
        CardRegistry::new()
    }
}
