//! Interrupt dispatcher.
//!
//! The DSP signals a new message by raising HF3 (and the PCI interrupt line,
//! unless the host runs in no-IRQ mode). [`Dispatcher::service`] acknowledges
//! the interrupt, drains the four message words from the receive FIFO and
//! hands the decoded message to the handler registered for its type.
//!
//! Two acknowledge variants exist, depending on the firmware:
//!
//! - Legacy: the host triggers `INT_RST` before reading the message and
//!   `INT_DON` after it.
//! - Handshake (firmware U0105 and later): the host raises HF0, reads the
//!   message, waits for the DSP to drop HF3 and then lowers HF0. If HF3 does
//!   not drop promptly, lowering HF0 is deferred to a task so that the
//!   dispatcher never waits on the card.
//!
//! The dispatcher runs from an [`IrqSource`]: either the UIO device, which
//! delivers the PCI interrupt, or a polling timer.

use crate::card::CardId;
use crate::handlers::{HandlerRegistry, MessageHandler};
use crate::message::{Message, RawMessage, WORDS};
use crate::regs::{hctr, hcvr, hstr, HostInterface, DATA_MASK};
use crate::uio::Uio;
use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Number of HF3 checks before the acknowledge is deferred.
const ACK_CHECKS: usize = 8;
/// Delay between deferred acknowledge attempts.
const ACK_RETRY_DELAY: Duration = Duration::from_micros(200);
/// Maximum number of words discarded by [`Dispatcher::flush`].
const FLUSH_LIMIT: usize = 256;
/// Maximum number of messages serviced per polling tick.
const POLL_BURST: usize = 16;

/// Outcome of servicing an interrupt.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum IrqReturn {
    /// The interrupt was not raised by this card.
    None,
    /// The interrupt was serviced.
    Handled,
}

/// Diagnostic counters of the dispatcher.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize)]
pub struct DispatchCounters {
    /// Messages received.
    pub messages: u64,
    /// Entries without HF3 set.
    pub spurious: u64,
    /// Messages with fewer than four words.
    pub short_reads: u64,
    /// Messages without a registered handler.
    pub unhandled: u64,
    /// Acknowledges deferred because HF3 did not drop.
    pub deferred_acks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    messages: AtomicU64,
    spurious: AtomicU64,
    short_reads: AtomicU64,
    unhandled: AtomicU64,
    deferred_acks: AtomicU64,
}

/// Interrupt dispatcher of one card.
#[derive(Debug)]
pub struct Dispatcher {
    card: CardId,
    regs: Arc<dyn HostInterface>,
    handlers: HandlerRegistry,
    comm_mode: AtomicU32,
    ack_pending: AtomicBool,
    deferred_ack: Mutex<Option<AbortHandle>>,
    stopped: AtomicBool,
    counters: Counters,
    runtime: Handle,
    weak: Weak<Dispatcher>,
}

impl Dispatcher {
    /// Creates the dispatcher of a card, with room for `capacity` handlers.
    ///
    /// Deferred acknowledges run as tasks in `runtime`.
    pub fn new(
        card: CardId,
        regs: Arc<dyn HostInterface>,
        capacity: usize,
        runtime: Handle,
    ) -> Arc<Dispatcher> {
        Arc::new_cyclic(|weak| Dispatcher {
            card,
            regs,
            handlers: HandlerRegistry::new(capacity),
            comm_mode: AtomicU32::new(hctr::BASE_MODE),
            ack_pending: AtomicBool::new(false),
            deferred_ack: Mutex::new(None),
            stopped: AtomicBool::new(false),
            counters: Counters::default(),
            runtime,
            weak: weak.clone(),
        })
    }

    /// Gives the handler registry of the card.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Gives the communication mode programmed in HCTR.
    pub fn comm_mode(&self) -> u32 {
        self.comm_mode.load(Ordering::Acquire)
    }

    /// Programs the communication mode into HCTR.
    pub fn set_comm_mode(&self, mode: u32) {
        tracing::debug!(card = %self.card, "setting HCTR mode {mode:#x}");
        self.comm_mode.store(mode, Ordering::Release);
        self.regs.write_hctr(mode);
    }

    /// Returns `true` if the handshake acknowledge variant is in use.
    pub fn handshake(&self) -> bool {
        self.comm_mode() & hctr::MODE_HANDSHAKE != 0
    }

    /// Returns `true` if the card runs in no-IRQ mode.
    pub fn polling(&self) -> bool {
        self.comm_mode() & hctr::MODE_NOIRQ != 0
    }

    /// Gives a copy of the diagnostic counters.
    pub fn counters(&self) -> DispatchCounters {
        let c = &self.counters;
        DispatchCounters {
            messages: c.messages.load(Ordering::Relaxed),
            spurious: c.spurious.load(Ordering::Relaxed),
            short_reads: c.short_reads.load(Ordering::Relaxed),
            unhandled: c.unhandled.load(Ordering::Relaxed),
            deferred_acks: c.deferred_acks.load(Ordering::Relaxed),
        }
    }

    /// Services one interrupt.
    ///
    /// Returns [`IrqReturn::None`] if the card has no message pending.
    pub fn service(&self) -> IrqReturn {
        if self.ack_pending.load(Ordering::Acquire) {
            // HF3 still belongs to the previous message
            return IrqReturn::None;
        }
        if self.regs.read_hstr() & hstr::HF3 == 0 {
            self.counters.spurious.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(card = %self.card, "irq entry without HF3 bit");
            return IrqReturn::None;
        }
        let handshake = self.handshake();
        if handshake {
            self.regs.write_hctr(self.comm_mode() | hctr::HF0);
        } else {
            self.regs.write_hcvr(hcvr::INT_RST | hcvr::HC);
        }

        let mut words = [0; WORDS];
        let mut n = 0;
        while n < WORDS && self.regs.read_hstr() & hstr::HRRQ != 0 {
            words[n] = self.regs.read_hrxs() & DATA_MASK;
            n += 1;
        }

        if handshake {
            self.ack_or_defer();
        } else {
            self.regs.write_hcvr(hcvr::INT_DON | hcvr::HC);
        }

        if n < WORDS {
            self.counters.short_reads.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                card = %self.card,
                "incomplete message {n}/{WORDS} words: {:x?}",
                &words[..n]
            );
            return IrqReturn::Handled;
        }
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        let message = Message::from(RawMessage(words));
        tracing::trace!(card = %self.card, ?message, "message received");
        if !self.handlers.dispatch(self.card, &message) {
            self.counters.unhandled.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                card = %self.card,
                "no handler for message type {:#08x}",
                message.type_code().0
            );
        }
        IrqReturn::Handled
    }

    // Lowers HF0 once the DSP has dropped HF3, deferring to a task if it
    // does not do so within a few register reads.
    fn ack_or_defer(&self) {
        // held across the register accesses so that stop() waits for them
        let mut deferred = self.deferred_ack.lock().unwrap();
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        for _ in 0..ACK_CHECKS {
            if self.regs.read_hstr() & hstr::HF3 == 0 {
                self.regs.write_hctr(self.comm_mode());
                self.ack_pending.store(false, Ordering::Release);
                return;
            }
        }
        self.ack_pending.store(true, Ordering::Release);
        self.counters.deferred_acks.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(card = %self.card, "HF3 still set, deferring acknowledge");
        let dispatcher = self.weak.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(ACK_RETRY_DELAY).await;
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.ack_or_defer();
            }
        });
        *deferred = Some(task.abort_handle());
    }

    /// Stops the dispatcher.
    ///
    /// A deferred acknowledge is cancelled and HCTR is not written again by
    /// the dispatcher.
    pub fn stop(&self) {
        let mut deferred = self.deferred_ack.lock().unwrap();
        self.stopped.store(true, Ordering::Release);
        if let Some(task) = deferred.take() {
            task.abort();
        }
    }

    /// Returns `true` if an acknowledge is waiting for HF3 to drop.
    pub fn ack_pending(&self) -> bool {
        self.ack_pending.load(Ordering::Acquire)
    }

    /// Discards any words left in the receive FIFO.
    ///
    /// Returns the number of words discarded.
    pub fn flush(&self) -> usize {
        let mut n = 0;
        while n < FLUSH_LIMIT && self.regs.read_hstr() & hstr::HRRQ != 0 {
            let word = self.regs.read_hrxs();
            tracing::trace!(card = %self.card, "flushed {word:#08x}");
            n += 1;
        }
        if n > 0 {
            tracing::info!(card = %self.card, "flushed {n} words from HRXS");
        }
        n
    }
}

/// Handler of `HEY` messages, which logs their payload.
#[derive(Debug, Default)]
pub struct DiagnosticHandler;

impl MessageHandler for DiagnosticHandler {
    fn handle(&self, card: CardId, message: &Message) {
        if let Message::Hey {
            command,
            reply,
            data,
        } = message
        {
            tracing::info!(%card, "HEY received: {command:#08x} {reply:#08x} {data:#08x}");
        }
    }
}

/// Source of interrupt entries for a dispatcher.
#[derive(Debug)]
pub enum IrqSource {
    /// PCI interrupt delivered through a UIO device.
    Uio(Uio),
    /// Timer polling the card with the given period.
    Polling(Duration),
}

impl IrqSource {
    /// Returns `true` if this source polls the card.
    pub fn is_polling(&self) -> bool {
        matches!(self, IrqSource::Polling(_))
    }

    /// Runs the dispatcher on every interrupt entry.
    ///
    /// This only returns if waiting for interrupts fails.
    pub async fn run(self, dispatcher: Arc<Dispatcher>) -> Result<()> {
        match self {
            IrqSource::Uio(mut uio) => loop {
                uio.unmask_irq().await?;
                uio.wait_irq().await?;
                if dispatcher.service() == IrqReturn::None {
                    tracing::trace!("interrupt not raised by this card");
                }
            },
            IrqSource::Polling(period) => {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    for _ in 0..POLL_BURST {
                        if dispatcher.service() == IrqReturn::None {
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{Reply, ReplyStatus, TypeCode};
    use crate::sim::{SimConfig, SimulatedCard};
    use crate::vector::CommandCode;
    use std::sync::Mutex;

    fn setup(sim: &Arc<SimulatedCard>, mode: u32) -> (Arc<Dispatcher>, Arc<Mutex<Vec<Message>>>) {
        let dispatcher = Dispatcher::new(CardId(0), sim.clone(), 4, Handle::current());
        dispatcher.set_comm_mode(mode);
        let received = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn MessageHandler> = {
            let received = Arc::clone(&received);
            Arc::new(move |_: CardId, message: &Message| received.lock().unwrap().push(*message))
        };
        for code in [TypeCode::REP, TypeCode::NFY] {
            dispatcher.handlers().register(code, handler.clone()).unwrap();
        }
        (dispatcher, received)
    }

    #[tokio::test]
    async fn spurious_entry() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let (dispatcher, received) = setup(&sim, hctr::BASE_MODE);
        assert_eq!(dispatcher.service(), IrqReturn::None);
        assert_eq!(dispatcher.counters().spurious, 1);
        assert!(received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn legacy_acknowledge() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let (dispatcher, received) = setup(&sim, hctr::BASE_MODE);
        sim.push_message(Message::Notify { data: 1 });
        sim.push_message(Message::Notify { data: 2 });
        assert_eq!(dispatcher.service(), IrqReturn::Handled);
        assert_eq!(
            sim.vectors(),
            vec![hcvr::INT_RST, hcvr::INT_DON]
        );
        // INT_DON raised the second message
        assert_eq!(dispatcher.service(), IrqReturn::Handled);
        assert_eq!(dispatcher.service(), IrqReturn::None);
        assert_eq!(
            *received.lock().unwrap(),
            vec![Message::Notify { data: 1 }, Message::Notify { data: 2 }]
        );
    }

    #[tokio::test]
    async fn handshake_acknowledge() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let mode = hctr::BASE_MODE | hctr::MODE_HANDSHAKE;
        let (dispatcher, received) = setup(&sim, mode);
        let reply = Reply {
            command: CommandCode::VER,
            status: ReplyStatus::Ack,
            data: 0x550105,
        };
        sim.push_message(Message::Reply(reply));
        assert_eq!(dispatcher.service(), IrqReturn::Handled);
        assert_eq!(sim.read_hctr(), mode);
        assert!(sim.vectors().is_empty());
        assert_eq!(*received.lock().unwrap(), vec![Message::Reply(reply)]);
        assert_eq!(dispatcher.counters().deferred_acks, 0);
    }

    #[tokio::test]
    async fn deferred_acknowledge() {
        let sim = Arc::new(SimulatedCard::new(SimConfig {
            ack_delay: 3 * ACK_CHECKS,
            ..SimConfig::default()
        }));
        let mode = hctr::BASE_MODE | hctr::MODE_HANDSHAKE;
        let (dispatcher, received) = setup(&sim, mode);
        sim.push_message(Message::Notify { data: 1 });
        sim.push_message(Message::Notify { data: 2 });
        assert_eq!(dispatcher.service(), IrqReturn::Handled);
        assert_eq!(dispatcher.counters().deferred_acks, 1);
        assert_eq!(sim.read_hctr(), mode | hctr::HF0);
        // entries while the acknowledge is outstanding are ignored
        assert_eq!(dispatcher.service(), IrqReturn::None);
        tokio::time::timeout(Duration::from_secs(5), async {
            while sim.read_hctr() & hctr::HF0 != 0 {
                tokio::time::sleep(ACK_RETRY_DELAY).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(dispatcher.service(), IrqReturn::Handled);
        assert_eq!(received.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn short_read_is_not_dispatched() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let (dispatcher, received) = setup(&sim, hctr::BASE_MODE);
        sim.push_words(vec![TypeCode::NFY.0, 0]);
        assert_eq!(dispatcher.service(), IrqReturn::Handled);
        assert_eq!(dispatcher.counters().short_reads, 1);
        assert!(received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn words_are_masked_and_unhandled_types_counted() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let (dispatcher, received) = setup(&sim, hctr::BASE_MODE);
        sim.push_words(vec![0xff00_0000 | TypeCode::NFY.0, 0, 0, 0xab00_0007]);
        sim.push_words(vec![TypeCode::HEY.0, 1, 2, 3]);
        dispatcher.service();
        dispatcher.service();
        assert_eq!(*received.lock().unwrap(), vec![Message::Notify { data: 7 }]);
        let counters = dispatcher.counters();
        assert_eq!(counters.messages, 2);
        assert_eq!(counters.unhandled, 1);
    }

    #[tokio::test]
    async fn polling_source_drains_messages() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let (dispatcher, received) = setup(&sim, hctr::BASE_MODE | hctr::MODE_NOIRQ);
        assert!(dispatcher.polling());
        let source = IrqSource::Polling(Duration::from_millis(1));
        assert!(source.is_polling());
        let task = tokio::spawn(source.run(Arc::clone(&dispatcher)));
        for n in 0..5 {
            sim.push_message(Message::Notify { data: n });
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while received.lock().unwrap().len() < 5 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        task.abort();
    }

    #[tokio::test]
    async fn flush_discards_stale_words() {
        let sim = Arc::new(SimulatedCard::new(SimConfig::default()));
        let (dispatcher, _) = setup(&sim, hctr::BASE_MODE);
        sim.push_words(vec![1, 2, 3]);
        assert_eq!(dispatcher.flush(), 3);
        assert_eq!(dispatcher.flush(), 0);
    }
}
