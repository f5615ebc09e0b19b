//! DSP command/reply engine.
//!
//! The DSP accepts one command at a time. A command is written into the
//! transmit FIFO and triggered through its host command vector; the DSP later
//! answers with a `REP` message, which reaches the engine through the
//! interrupt dispatcher. Every command in flight has a deadline, so the engine
//! always returns to [`EngineState::Idle`], either when the reply arrives or
//! when the deadline expires, whichever happens first.
//!
//! [`CommandEngine::send_async`] is the non-blocking interface: it registers a
//! callback that runs exactly once per command. [`CommandEngine::send_sync`]
//! builds on it to wait for the reply.

use crate::card::CardId;
use crate::error::{Error, Result};
use crate::handlers::MessageHandler;
use crate::message::{Command, Message, Reply, WORDS};
use crate::regs::{hcvr, hstr, HostInterface};
use crate::vector::{self, CommandCode, DispatchStyle};
use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// Default command deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Completion callback of a command.
///
/// It receives the reply, or [`Error::Timeout`] if no reply arrived before the
/// deadline. It runs in the dispatcher or in the deadline task, so it must not
/// block; it may issue a new command.
pub type Callback = Box<dyn FnOnce(CardId, Result<Reply>) + Send>;

/// State of the command engine.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No command in flight. A command can be issued.
    Idle,
    /// A command has been issued and its reply is awaited.
    AwaitingReply,
}

/// Diagnostic counters of the command engine.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize)]
pub struct EngineCounters {
    /// Commands issued successfully.
    pub commands: u64,
    /// Replies delivered to a callback.
    pub replies: u64,
    /// Commands whose deadline expired.
    pub timeouts: u64,
    /// Replies received while no command was in flight.
    pub unexpected: u64,
}

struct Pending {
    sequence: u64,
    callback: Callback,
    deadline: AbortHandle,
}

struct Inner {
    state: EngineState,
    // identifies the command in flight, so that a stale deadline cannot
    // expire a later command
    sequence: u64,
    pending: Option<Pending>,
    counters: EngineCounters,
}

/// Command engine of one card.
pub struct CommandEngine {
    card: CardId,
    regs: Arc<dyn HostInterface>,
    runtime: Handle,
    timeout: Duration,
    inner: Mutex<Inner>,
    gate: tokio::sync::Mutex<()>,
    weak: Weak<CommandEngine>,
}

impl std::fmt::Debug for CommandEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEngine")
            .field("card", &self.card)
            .field("timeout", &self.timeout)
            .field("state", &self.state())
            .field("counters", &self.counters())
            .finish()
    }
}

impl CommandEngine {
    /// Creates the command engine of a card.
    ///
    /// Deadlines are armed as tasks in `runtime`.
    pub fn new(
        card: CardId,
        regs: Arc<dyn HostInterface>,
        timeout: Duration,
        runtime: Handle,
    ) -> Arc<CommandEngine> {
        Arc::new_cyclic(|weak| CommandEngine {
            card,
            regs,
            runtime,
            timeout,
            inner: Mutex::new(Inner {
                state: EngineState::Idle,
                sequence: 0,
                pending: None,
                counters: EngineCounters::default(),
            }),
            gate: tokio::sync::Mutex::new(()),
            weak: weak.clone(),
        })
    }

    /// Gives the card this engine belongs to.
    pub fn card(&self) -> CardId {
        self.card
    }

    /// Gives the command deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Gives the current state.
    pub fn state(&self) -> EngineState {
        self.inner.lock().unwrap().state
    }

    /// Gives a copy of the diagnostic counters.
    pub fn counters(&self) -> EngineCounters {
        self.inner.lock().unwrap().counters
    }

    /// Issues a command without waiting for its reply.
    ///
    /// Fails with [`Error::Busy`] if another command is in flight. On success
    /// `callback` will be called exactly once, with the reply or with
    /// [`Error::Timeout`]. On failure the engine state is unchanged and the
    /// callback is dropped without being called.
    pub fn send_async(&self, command: Command, callback: Callback) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != EngineState::Idle {
            tracing::warn!(
                card = %self.card,
                "engine not idle at command {}, cannot send {}",
                inner.counters.commands,
                command.code
            );
            return Err(Error::Busy);
        }
        self.send_now(&command)?;
        inner.sequence += 1;
        inner.counters.commands += 1;
        let sequence = inner.sequence;
        let deadline = self.arm_deadline(sequence);
        inner.pending = Some(Pending {
            sequence,
            callback,
            deadline,
        });
        inner.state = EngineState::AwaitingReply;
        tracing::debug!(
            card = %self.card,
            "sent {} ({})",
            command.code,
            inner.counters.commands
        );
        Ok(())
    }

    /// Issues a command and waits for its reply.
    ///
    /// Only one caller at a time can wait on a card. If another caller is
    /// waiting, this fails immediately with [`Error::Retry`]. If the caller
    /// stops awaiting the returned future, the command is left to complete or
    /// expire on its own.
    ///
    /// Quick commands never produce a reply, so this always returns
    /// [`Error::Timeout`] for them.
    pub async fn send_sync(&self, command: Command) -> Result<Reply> {
        let _gate = self.gate.try_lock().map_err(|_| Error::Retry)?;
        let (sender, receiver) = oneshot::channel();
        self.send_async(
            command,
            Box::new(move |_, result| {
                // the receiver is gone if the caller stopped waiting
                let _ = sender.send(result);
            }),
        )?;
        receiver.await.unwrap_or(Err(Error::Offline))
    }

    /// Triggers a quick vector outside of the command state machine.
    ///
    /// Quick vectors take no payload and produce no reply, so they can be
    /// issued while a command is in flight (for instance from a message
    /// handler). Fails with [`Error::Protocol`] for standard commands.
    pub fn quick_command(&self, code: CommandCode) -> Result<()> {
        let vector = Self::lookup(code)?;
        if vector.style != DispatchStyle::Quick {
            return Err(Error::Protocol(format!("{code} is not a quick command")));
        }
        self.trigger(vector.address);
        Ok(())
    }

    /// Delivers a reply received by the dispatcher.
    ///
    /// If a command is in flight, the engine goes back to idle and its
    /// callback is invoked. Otherwise the reply is logged and dropped.
    pub fn deliver_reply(&self, reply: Reply) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == EngineState::AwaitingReply {
                inner.state = EngineState::Idle;
                inner.counters.replies += 1;
                tracing::debug!(
                    card = %self.card,
                    "REP received for {} ({} {:#08x}), calling back",
                    reply.command,
                    inner.counters.replies,
                    reply.data
                );
                inner.pending.take()
            } else {
                inner.counters.unexpected += 1;
                tracing::warn!(
                    card = %self.card,
                    "unexpected REP received for {} [commands={}, replies={}]",
                    reply.command,
                    inner.counters.commands,
                    inner.counters.replies
                );
                None
            }
        };
        // the engine is idle, so the callback may issue commands
        if let Some(pending) = pending {
            pending.deadline.abort();
            (pending.callback)(self.card, Ok(reply));
        }
    }

    /// Expires the command identified by `sequence`, if it is still in flight.
    fn deliver_timeout(&self, sequence: u64) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.pending {
                Some(pending)
                    if inner.state == EngineState::AwaitingReply
                        && pending.sequence == sequence =>
                {
                    inner.state = EngineState::Idle;
                    inner.counters.timeouts += 1;
                    inner.pending.take()
                }
                _ => None,
            }
        };
        match pending {
            Some(pending) => {
                tracing::error!(card = %self.card, "DSP reply timed out");
                (pending.callback)(self.card, Err(Error::Timeout));
            }
            None => tracing::trace!(card = %self.card, "deadline ignored"),
        }
    }

    /// Fails the command in flight, if any, with [`Error::Offline`].
    ///
    /// This is used when the card is taken offline.
    pub fn shutdown(&self) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = EngineState::Idle;
            inner.pending.take()
        };
        if let Some(pending) = pending {
            pending.deadline.abort();
            (pending.callback)(self.card, Err(Error::Offline));
        }
    }

    fn lookup(code: CommandCode) -> Result<vector::Vector> {
        vector::lookup(code).ok_or_else(|| {
            tracing::error!("could not identify command {code}");
            Error::UnknownCommand(code.0)
        })
    }

    fn send_now(&self, command: &Command) -> Result<()> {
        let vector = Self::lookup(command.code)?;
        match vector.style {
            DispatchStyle::Standard => self.send_vector(command, vector.address),
            DispatchStyle::Quick => {
                // never answered, the deadline completes the command
                self.trigger(vector.address);
                Ok(())
            }
        }
    }

    fn send_vector(&self, command: &Command, address: u32) -> Result<()> {
        // The DSP may still be servicing the previous vector
        if self.regs.read_hcvr() & hcvr::HC != 0 {
            return Err(Error::Busy);
        }
        if self.regs.read_hstr() & hstr::TRDY == 0 {
            tracing::error!(card = %self.card, "HSTR not ready to transmit");
            return Err(Error::DeviceNotReady);
        }
        let words = command.words();
        let mut written = 0;
        while written < WORDS && self.regs.read_hstr() & hstr::HTRQ != 0 {
            self.regs.write_htxr(words[written]);
            written += 1;
        }
        if written < WORDS {
            let status = self.regs.read_hstr();
            tracing::error!(
                card = %self.card,
                "HTXR filled up during write, HSTR={status:#x}"
            );
            return Err(Error::Protocol(format!(
                "transmit FIFO full after {written}/{WORDS} words"
            )));
        }
        self.trigger(address);
        Ok(())
    }

    fn trigger(&self, address: u32) {
        tracing::trace!(card = %self.card, "sending vector {address:#x}");
        self.regs.write_hcvr(address | hcvr::HC);
    }

    fn arm_deadline(&self, sequence: u64) -> AbortHandle {
        let engine = self.weak.clone();
        let timeout = self.timeout;
        self.runtime
            .spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(engine) = engine.upgrade() {
                    engine.deliver_timeout(sequence);
                }
            })
            .abort_handle()
    }
}

/// Handler of `REP` messages, which forwards replies to the command engine.
#[derive(Debug)]
pub struct ReplyHandler(pub Arc<CommandEngine>);

impl MessageHandler for ReplyHandler {
    fn handle(&self, _card: CardId, message: &Message) {
        if let Message::Reply(reply) = message {
            self.0.deliver_reply(*reply);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::ReplyStatus;
    use crate::sim::{SimConfig, SimulatedCard};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn new_engine(regs: Arc<dyn HostInterface>) -> Arc<CommandEngine> {
        CommandEngine::new(CardId(0), regs, TIMEOUT, Handle::current())
    }

    fn ack(command: CommandCode) -> Reply {
        Reply {
            command,
            status: ReplyStatus::Ack,
            data: 0,
        }
    }

    fn counting_callback(count: &Arc<AtomicUsize>) -> Callback {
        let count = Arc::clone(count);
        Box::new(move |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    // Host interface with fixed status registers, used to exercise the
    // register-level failure paths.
    #[derive(Debug)]
    struct FixedStatus {
        hstr: u32,
        hcvr: u32,
        writes: AtomicU32,
    }

    impl HostInterface for FixedStatus {
        fn read_hstr(&self) -> u32 {
            self.hstr
        }
        fn read_hctr(&self) -> u32 {
            0
        }
        fn write_hctr(&self, _value: u32) {}
        fn read_hcvr(&self) -> u32 {
            self.hcvr
        }
        fn write_hcvr(&self, _value: u32) {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        fn write_htxr(&self, _value: u32) {}
        fn read_hrxs(&self) -> u32 {
            0
        }
    }

    fn fixed(hstr: u32, hcvr: u32) -> Arc<FixedStatus> {
        Arc::new(FixedStatus {
            hstr,
            hcvr,
            writes: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn busy_while_awaiting_reply() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let engine = new_engine(sim.clone());
        let count = Arc::new(AtomicUsize::new(0));
        engine
            .send_async(Command::bare(CommandCode::VER), counting_callback(&count))
            .unwrap();
        assert_eq!(engine.state(), EngineState::AwaitingReply);
        assert_eq!(
            engine.send_async(Command::bare(CommandCode::RST), counting_callback(&count)),
            Err(Error::Busy)
        );
        assert_eq!(engine.state(), EngineState::AwaitingReply);
        assert_eq!(engine.counters().commands, 1);
        // only the first command reached the card
        assert_eq!(sim.commands(), vec![Command::bare(CommandCode::VER)]);
    }

    #[tokio::test]
    async fn reply_wins_over_deadline() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let engine = new_engine(sim);
        let results = Arc::new(Mutex::new(Vec::new()));
        let callback: Callback = {
            let results = Arc::clone(&results);
            Box::new(move |_, result| results.lock().unwrap().push(result))
        };
        engine
            .send_async(Command::bare(CommandCode::GOA), callback)
            .unwrap();
        engine.deliver_reply(ack(CommandCode::GOA));
        assert_eq!(engine.state(), EngineState::Idle);
        tokio::time::sleep(2 * TIMEOUT).await;
        assert_eq!(*results.lock().unwrap(), vec![Ok(ack(CommandCode::GOA))]);
        let counters = engine.counters();
        assert_eq!(counters.replies, 1);
        assert_eq!(counters.timeouts, 0);
    }

    #[tokio::test]
    async fn deadline_returns_to_idle() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let engine = new_engine(sim);
        let results = Arc::new(Mutex::new(Vec::new()));
        let callback: Callback = {
            let results = Arc::clone(&results);
            Box::new(move |_, result| results.lock().unwrap().push(result))
        };
        engine
            .send_async(Command::bare(CommandCode::STP), callback)
            .unwrap();
        tokio::time::sleep(2 * TIMEOUT).await;
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(*results.lock().unwrap(), vec![Err(Error::Timeout)]);
        // a reply arriving late is dropped
        engine.deliver_reply(ack(CommandCode::STP));
        assert_eq!(results.lock().unwrap().len(), 1);
        assert_eq!(engine.counters().unexpected, 1);
    }

    #[tokio::test]
    async fn exactly_one_completion_per_command() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let engine = new_engine(sim);
        let count = Arc::new(AtomicUsize::new(0));
        let mut issued = 0;
        for n in 0..12u64 {
            engine
                .send_async(Command::bare(CommandCode::HST), counting_callback(&count))
                .unwrap();
            issued += 1;
            // replies arriving before, around and after the deadline
            tokio::time::sleep(TIMEOUT * (n % 3) as u32 / 2 + Duration::from_millis(n % 2))
                .await;
            engine.deliver_reply(ack(CommandCode::HST));
            tokio::time::sleep(TIMEOUT + Duration::from_millis(10)).await;
            assert_eq!(engine.state(), EngineState::Idle);
        }
        assert_eq!(count.load(Ordering::SeqCst), issued);
        let counters = engine.counters();
        assert_eq!(counters.replies + counters.timeouts, issued as u64);
    }

    #[tokio::test]
    async fn stale_deadline_does_not_expire_next_command() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let engine = new_engine(sim);
        let count = Arc::new(AtomicUsize::new(0));
        engine
            .send_async(Command::bare(CommandCode::HST), counting_callback(&count))
            .unwrap();
        tokio::time::sleep(TIMEOUT / 2).await;
        engine.deliver_reply(ack(CommandCode::HST));
        engine
            .send_async(Command::bare(CommandCode::HST), counting_callback(&count))
            .unwrap();
        // past the first deadline but before the second one
        tokio::time::sleep(TIMEOUT * 3 / 4).await;
        assert_eq!(engine.state(), EngineState::AwaitingReply);
        assert_eq!(engine.counters().timeouts, 0);
    }

    #[tokio::test]
    async fn callback_can_issue_command() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let engine = new_engine(sim.clone());
        let chained = Arc::new(Mutex::new(None));
        let callback: Callback = {
            let engine = Arc::clone(&engine);
            let chained = Arc::clone(&chained);
            Box::new(move |_, _| {
                let result = engine.send_async(Command::bare(CommandCode::GOA), Box::new(|_, _| {}));
                *chained.lock().unwrap() = Some(result);
            })
        };
        engine
            .send_async(Command::bare(CommandCode::STP), callback)
            .unwrap();
        engine.deliver_reply(ack(CommandCode::STP));
        assert_eq!(*chained.lock().unwrap(), Some(Ok(())));
        assert_eq!(engine.state(), EngineState::AwaitingReply);
        assert_eq!(sim.commands().len(), 2);
    }

    #[tokio::test]
    async fn register_failures_leave_engine_idle() {
        // transmitter not ready
        let regs = fixed(0, 0);
        let engine = new_engine(regs.clone());
        assert_eq!(
            engine.send_async(Command::bare(CommandCode::VER), Box::new(|_, _| {})),
            Err(Error::DeviceNotReady)
        );
        assert_eq!(engine.state(), EngineState::Idle);

        // transmit FIFO never accepts a word
        let regs = fixed(hstr::TRDY, 0);
        let engine = new_engine(regs.clone());
        assert!(matches!(
            engine.send_async(Command::bare(CommandCode::VER), Box::new(|_, _| {})),
            Err(Error::Protocol(_))
        ));
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(regs.writes.load(Ordering::SeqCst), 0);

        // previous vector not taken yet
        let regs = fixed(hstr::TRDY | hstr::HTRQ, hcvr::HC);
        let engine = new_engine(regs.clone());
        assert_eq!(
            engine.send_async(Command::bare(CommandCode::VER), Box::new(|_, _| {})),
            Err(Error::Busy)
        );
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.counters().commands, 0);
    }

    #[tokio::test]
    async fn partial_fifo_write_is_a_protocol_error() {
        let sim = Arc::new(SimulatedCard::new(SimConfig {
            tx_depth: 2,
            ..SimConfig::default()
        }));
        let engine = new_engine(sim.clone());
        assert!(matches!(
            engine.send_async(Command::bare(CommandCode::WRM), Box::new(|_, _| {})),
            Err(Error::Protocol(_))
        ));
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(sim.vectors().is_empty());
    }

    #[tokio::test]
    async fn unknown_command() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let engine = new_engine(sim);
        let code = CommandCode(vector::mnemonic(b"XYZ"));
        assert_eq!(
            engine.send_async(Command::bare(code), Box::new(|_, _| {})),
            Err(Error::UnknownCommand(code.0))
        );
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn quick_command_always_times_out() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let engine = new_engine(sim.clone());
        assert_eq!(
            engine.send_sync(Command::bare(CommandCode::INT_RPC)).await,
            Err(Error::Timeout)
        );
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(sim.vectors(), vec![crate::regs::hcvr::INT_RPC]);
    }

    #[tokio::test]
    async fn quick_command_bypasses_state() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let engine = new_engine(sim.clone());
        engine
            .send_async(Command::bare(CommandCode::VER), Box::new(|_, _| {}))
            .unwrap();
        engine.quick_command(CommandCode::INT_RPC).unwrap();
        assert!(matches!(
            engine.quick_command(CommandCode::VER),
            Err(Error::Protocol(_))
        ));
        assert_eq!(engine.state(), EngineState::AwaitingReply);
    }

    #[tokio::test]
    async fn gate_rejects_second_waiter() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let engine = new_engine(sim);
        let first = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.send_sync(Command::bare(CommandCode::VER)).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.state() != EngineState::AwaitingReply {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            engine.send_sync(Command::bare(CommandCode::VER)).await,
            Err(Error::Retry)
        );
        // nothing delivers the reply, so the first waiter times out and
        // releases the gate
        assert_eq!(first.await.unwrap(), Err(Error::Timeout));
        engine
            .send_async(Command::bare(CommandCode::VER), Box::new(|_, _| {}))
            .unwrap();
    }

    #[tokio::test]
    async fn abandoned_wait_is_resolved_by_deadline() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let engine = new_engine(sim);
        let wait = engine.send_sync(Command::bare(CommandCode::VER));
        assert!(tokio::time::timeout(TIMEOUT / 5, wait).await.is_err());
        assert_eq!(engine.state(), EngineState::AwaitingReply);
        tokio::time::sleep(TIMEOUT).await;
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.counters().timeouts, 1);
    }

    #[tokio::test]
    async fn shutdown_fails_pending_command() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let engine = new_engine(sim);
        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.send_sync(Command::bare(CommandCode::VER)).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.state() != EngineState::AwaitingReply {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        engine.shutdown();
        assert_eq!(waiter.await.unwrap(), Err(Error::Offline));
        assert_eq!(engine.state(), EngineState::Idle);
    }
}
