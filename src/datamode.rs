//! Frame transfer modes.
//!
//! In classic mode the card sends an `NFY` message for every frame it writes.
//! In quiet mode (firmware U0104 and later) the card is told the geometry of
//! the ring once, through `QTS` subcommands, and then writes frames on its
//! own, sending a `QTI` message with its new head index every few frames. The
//! host grants free space back to the card by sending it the tail index.

use crate::card::CardId;
use crate::engine::CommandEngine;
use crate::error::{Error, Result};
use crate::frames::FrameBuffer;
use crate::handlers::MessageHandler;
use crate::message::{Command, Message, Reply};
use crate::vector::CommandCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Delay before retrying a command refused because the engine is busy.
const RETRY_DELAY: Duration = Duration::from_millis(1);
/// Attempts made by [`send_retrying`] before giving up.
const RETRY_ATTEMPTS: usize = 1000;

/// Frame transfer mode.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataMode {
    /// One `NFY` message per frame.
    #[default]
    Classic,
    /// Batched transfers announced by `QTI` messages.
    Quiet,
}

impl std::fmt::Display for DataMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataMode::Classic => write!(f, "classic"),
            DataMode::Quiet => write!(f, "quiet"),
        }
    }
}

/// `QTS` subcommands.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum QtSetting {
    /// Enables (1) or disables (0) quiet transfers.
    Enable = 1,
    /// Bus address of the ring, as low and high 16-bit halves.
    Base = 2,
    /// Stride between frames in bytes.
    Delta = 3,
    /// Number of frames in the ring.
    Number = 4,
    /// Frames between `QTI` messages.
    Inform = 5,
    /// Maximum time between `QTI` messages, in milliseconds.
    Period = 6,
    /// Payload bytes per frame.
    Size = 7,
    /// Tail index of the host.
    Tail = 8,
    /// Head index of the card.
    Head = 9,
    /// Dropped frame counter of the card.
    Drops = 10,
    /// Flushes partially written frames.
    Flush = 11,
}

impl QtSetting {
    /// Builds the `QTS` command for this setting.
    pub fn command(self, arg0: u32, arg1: u32) -> Command {
        Command::new(CommandCode::QTS, [self as u32, arg0, arg1])
    }
}

/// Settings of quiet transfers.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuietConfig {
    /// Frames between `QTI` messages.
    pub inform_frames: u32,
    /// Maximum time between `QTI` messages, in milliseconds.
    pub inform_period_ms: u32,
}

impl Default for QuietConfig {
    fn default() -> QuietConfig {
        QuietConfig {
            inform_frames: 1,
            inform_period_ms: 100,
        }
    }
}

/// Issues a blocking command, retrying while the engine is busy.
///
/// The grant task may hold the engine for short periods in quiet mode, so
/// configuration commands are retried rather than failed.
pub async fn send_retrying(engine: &CommandEngine, command: Command) -> Result<Reply> {
    for _ in 0..RETRY_ATTEMPTS {
        match engine.send_sync(command).await {
            Err(Error::Busy) | Err(Error::Retry) => tokio::time::sleep(RETRY_DELAY).await,
            result => return result,
        }
    }
    Err(Error::Busy)
}

async fn quiet_setting(
    engine: &CommandEngine,
    setting: QtSetting,
    arg0: u32,
    arg1: u32,
) -> Result<()> {
    let reply = send_retrying(engine, setting.command(arg0, arg1)).await?;
    if !reply.is_ack() {
        tracing::error!(card = %engine.card(), "{setting:?} setting rejected by DSP");
        return Err(Error::Protocol(format!(
            "QTS {setting:?} answered with {:?}",
            reply.status
        )));
    }
    Ok(())
}

/// Programs the card for quiet transfers into `frames`.
///
/// Quiet transfers are disabled while the ring geometry and indices are
/// loaded and re-enabled at the end.
#[tracing::instrument(name = "datamode::configure_quiet", level = "debug", skip_all)]
pub async fn configure_quiet(
    engine: &CommandEngine,
    frames: &FrameBuffer,
    config: &QuietConfig,
) -> Result<()> {
    let bus_addr = frames.bus_addr();
    let base = u32::try_from(bus_addr).map_err(|_| {
        Error::Protocol(format!(
            "frame buffer at {bus_addr:#x} is out of reach of 32-bit DMA"
        ))
    })?;
    let status = frames.status();
    let settings = [
        (QtSetting::Enable, 0, 0),
        (QtSetting::Base, base & 0xffff, base >> 16),
        (QtSetting::Delta, status.frame_size as u32, 0),
        (QtSetting::Number, status.count as u32, 0),
        (QtSetting::Size, status.data_size as u32, 0),
        (QtSetting::Tail, status.tail as u32, 0),
        (QtSetting::Head, status.head as u32, 0),
        (QtSetting::Drops, 0, 0),
        (QtSetting::Inform, config.inform_frames, 0),
        (QtSetting::Period, config.inform_period_ms, 0),
        (QtSetting::Enable, 1, 0),
    ];
    for (setting, arg0, arg1) in settings {
        quiet_setting(engine, setting, arg0, arg1).await?;
    }
    tracing::info!(
        card = %engine.card(),
        "quiet transfers enabled: {} frames of {:#x} bytes",
        status.count,
        status.frame_size
    );
    Ok(())
}

/// Stops quiet transfers on the card.
pub async fn disable_quiet(engine: &CommandEngine) -> Result<()> {
    quiet_setting(engine, QtSetting::Enable, 0, 0).await
}

/// Sends the host indices of a freshly reset ring to the card.
pub async fn reset_quiet(engine: &CommandEngine, frames: &FrameBuffer) -> Result<()> {
    quiet_setting(engine, QtSetting::Tail, frames.tail() as u32, 0).await?;
    quiet_setting(engine, QtSetting::Head, frames.head() as u32, 0).await
}

/// Grants free ring space to the card whenever a batch is recorded.
///
/// Each grant sends the current tail index with a non-blocking command. While
/// the engine is busy the grant is retried after a short delay.
pub async fn run_grant(engine: Arc<CommandEngine>, frames: Arc<FrameBuffer>) {
    loop {
        frames.wait_grant().await;
        loop {
            let command = QtSetting::Tail.command(frames.tail() as u32, 0);
            let result = engine.send_async(
                command,
                Box::new(|card, result| match result {
                    Ok(reply) if reply.is_ack() => (),
                    Ok(reply) => {
                        tracing::warn!(%card, "tail grant answered with {:?}", reply.status)
                    }
                    Err(err) => tracing::warn!(%card, "tail grant failed: {err}"),
                }),
            );
            match result {
                Ok(()) => break,
                Err(Error::Busy) => tokio::time::sleep(RETRY_DELAY).await,
                Err(err) => {
                    tracing::error!(card = %engine.card(), "could not grant frames: {err}");
                    break;
                }
            }
        }
    }
}

/// Handler of `NFY` messages in classic mode.
#[derive(Debug)]
pub struct ClassicProducer(pub Arc<FrameBuffer>);

impl MessageHandler for ClassicProducer {
    fn handle(&self, card: CardId, message: &Message) {
        if let Message::Notify { .. } = message {
            if !self.0.produce_one() {
                tracing::trace!(%card, "frame dropped, buffer full");
            }
        }
    }
}

/// Handler of `QTI` messages in quiet mode.
#[derive(Debug)]
pub struct QuietProducer(pub Arc<FrameBuffer>);

impl MessageHandler for QuietProducer {
    fn handle(&self, _card: CardId, message: &Message) {
        if let Message::QuietInform { head } = message {
            self.0.produce_batch(*head as usize);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dispatch::{Dispatcher, IrqSource};
    use crate::dmabuf::{HostBuffer, SIMULATED_BUS_ADDR};
    use crate::engine::ReplyHandler;
    use crate::message::TypeCode;
    use crate::sim::{SimConfig, SimulatedCard};
    use tokio::runtime::Handle;

    struct Rig {
        sim: Arc<SimulatedCard>,
        engine: Arc<CommandEngine>,
        frames: Arc<FrameBuffer>,
        dispatcher: Arc<Dispatcher>,
    }

    fn rig() -> Rig {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let engine = CommandEngine::new(
            CardId(0),
            sim.clone(),
            Duration::from_millis(200),
            Handle::current(),
        );
        let region = HostBuffer::new(8 * 64).unwrap();
        let frames = Arc::new(FrameBuffer::new(Box::new(region), 40, 64).unwrap());
        let dispatcher = Dispatcher::new(CardId(0), sim.clone(), 4, Handle::current());
        dispatcher
            .handlers()
            .register(TypeCode::REP, Arc::new(ReplyHandler(Arc::clone(&engine))))
            .unwrap();
        tokio::spawn(IrqSource::Polling(Duration::from_millis(1)).run(Arc::clone(&dispatcher)));
        Rig {
            sim,
            engine,
            frames,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn quiet_configuration_sequence() {
        let rig = rig();
        configure_quiet(&rig.engine, &rig.frames, &QuietConfig::default())
            .await
            .unwrap();
        let commands = rig.sim.commands();
        let settings: Vec<[u32; 3]> = commands.iter().map(|c| c.args).collect();
        let base = SIMULATED_BUS_ADDR as u32;
        assert_eq!(
            settings,
            vec![
                [QtSetting::Enable as u32, 0, 0],
                [QtSetting::Base as u32, base & 0xffff, base >> 16],
                [QtSetting::Delta as u32, 64, 0],
                [QtSetting::Number as u32, 8, 0],
                [QtSetting::Size as u32, 40, 0],
                [QtSetting::Tail as u32, 0, 0],
                [QtSetting::Head as u32, 0, 0],
                [QtSetting::Drops as u32, 0, 0],
                [QtSetting::Inform as u32, 1, 0],
                [QtSetting::Period as u32, 100, 0],
                [QtSetting::Enable as u32, 1, 0],
            ]
        );
        assert!(commands.iter().all(|c| c.code == CommandCode::QTS));
    }

    #[tokio::test]
    async fn unreachable_buffer_is_rejected() {
        let rig = rig();
        let region = HostBuffer::with_bus_addr(4 * 64, 0x1_0000_0000).unwrap();
        let frames = FrameBuffer::new(Box::new(region), 64, 64).unwrap();
        assert!(matches!(
            configure_quiet(&rig.engine, &frames, &QuietConfig::default()).await,
            Err(Error::Protocol(_))
        ));
        assert!(rig.sim.commands().is_empty());
    }

    #[tokio::test]
    async fn classic_producer() {
        let rig = rig();
        rig.dispatcher
            .handlers()
            .register(TypeCode::NFY, Arc::new(ClassicProducer(Arc::clone(&rig.frames))))
            .unwrap();
        rig.sim.upload_frame(&rig.frames, &[5; 40]);
        rig.frames.wait_readable().await;
        let mut dest = [0; 64];
        assert_eq!(rig.frames.consume(&mut dest), 40);
        assert!(dest[..40].iter().all(|&b| b == 5));
    }

    #[tokio::test]
    async fn quiet_producer_grants_tail() {
        let rig = rig();
        rig.dispatcher
            .handlers()
            .register(TypeCode::QTI, Arc::new(QuietProducer(Arc::clone(&rig.frames))))
            .unwrap();
        let grant = tokio::spawn(run_grant(Arc::clone(&rig.engine), Arc::clone(&rig.frames)));
        rig.sim.upload_batch(&rig.frames, &[&[1; 40], &[2; 40], &[3; 40]]);
        tokio::time::timeout(Duration::from_secs(5), rig.frames.wait_readable())
            .await
            .unwrap();
        assert_eq!(rig.frames.head(), 3);
        tokio::time::timeout(Duration::from_secs(5), async {
            while rig.sim.granted_tail().is_none() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(rig.sim.granted_tail(), Some(0));
        let mut dest = vec![0; 120];
        assert_eq!(rig.frames.consume(&mut dest), 120);
        assert_eq!(dest[40], 2);
        grant.abort();
    }
}
