//! Message handler registry.
//!
//! The dispatcher routes each message received from the DSP to the handler
//! registered for its type code. A card has a bounded number of handler
//! slots; each type code has at most one handler.

use crate::card::CardId;
use crate::error::{Error, Result};
use crate::message::{Message, TypeCode};
use std::sync::{Arc, RwLock};

/// Default number of handler slots of a card.
pub const DEFAULT_CAPACITY: usize = 16;

/// Handler of messages of one type.
///
/// Handlers run in the dispatcher, so they must not block. Any context a
/// handler needs is owned by the handler object itself.
pub trait MessageHandler: Send + Sync {
    /// Handles a message received by the card `card`.
    fn handle(&self, card: CardId, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(CardId, &Message) + Send + Sync,
{
    fn handle(&self, card: CardId, message: &Message) {
        self(card, message)
    }
}

struct Entry {
    code: TypeCode,
    handler: Arc<dyn MessageHandler>,
}

/// Registry mapping message type codes to handlers.
pub struct HandlerRegistry {
    capacity: usize,
    entries: RwLock<Vec<Entry>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("capacity", &self.capacity)
            .field("codes", &self.codes())
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry with `capacity` slots.
    pub fn new(capacity: usize) -> HandlerRegistry {
        HandlerRegistry {
            capacity,
            entries: RwLock::new(Vec::with_capacity(capacity)),
        }
    }

    /// Gives the number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Gives the number of slots in use.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Returns `true` if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gives the registered type codes, in table order.
    pub fn codes(&self) -> Vec<TypeCode> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|entry| entry.code)
            .collect()
    }

    /// Registers a handler for a type code.
    ///
    /// If the code already has a handler, it is replaced and no new slot is
    /// used. Otherwise the handler is appended, which fails if all the slots
    /// are in use.
    pub fn register(&self, code: TypeCode, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.iter_mut().find(|entry| entry.code == code) {
            entry.handler = handler;
            return Ok(());
        }
        if entries.len() >= self.capacity {
            tracing::error!("no available handler slots for type {:#08x}", code.0);
            return Err(Error::HandlerTableFull {
                capacity: self.capacity,
            });
        }
        entries.push(Entry { code, handler });
        Ok(())
    }

    /// Removes the handler of a type code.
    ///
    /// The remaining handlers keep their relative order.
    pub fn remove(&self, code: TypeCode) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        let index = entries
            .iter()
            .position(|entry| entry.code == code)
            .ok_or(Error::NoHandler(code.0))?;
        entries.remove(index);
        Ok(())
    }

    /// Gives the handler of a type code.
    ///
    /// The handler is returned by reference count so that it can be invoked
    /// without holding the registry lock.
    pub fn lookup(&self, code: TypeCode) -> Option<Arc<dyn MessageHandler>> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .find(|entry| entry.code == code)
            .map(|entry| Arc::clone(&entry.handler))
    }

    /// Invokes the handler registered for the message type, if any.
    ///
    /// Returns `true` if a handler was found.
    pub fn dispatch(&self, card: CardId, message: &Message) -> bool {
        match self.lookup(message.type_code()) {
            Some(handler) => {
                handler.handle(card, message);
                true
            }
            None => false,
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> HandlerRegistry {
        HandlerRegistry::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::RawMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn MessageHandler>) {
        let count = Arc::new(AtomicUsize::new(0));
        let handler: Arc<dyn MessageHandler> = {
            let count = Arc::clone(&count);
            Arc::new(move |_card: CardId, _message: &Message| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        (count, handler)
    }

    #[test]
    fn capacity_is_enforced() {
        let registry = HandlerRegistry::new(2);
        let (_, handler) = counter();
        registry.register(TypeCode::REP, handler.clone()).unwrap();
        registry.register(TypeCode::HEY, handler.clone()).unwrap();
        assert_eq!(
            registry.register(TypeCode::NFY, handler.clone()),
            Err(Error::HandlerTableFull { capacity: 2 })
        );
        // replacing an existing code does not use a new slot
        registry.register(TypeCode::HEY, handler).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn replace_routes_to_new_handler() {
        let registry = HandlerRegistry::new(4);
        let (first, handler) = counter();
        registry.register(TypeCode::HEY, handler).unwrap();
        let (second, handler) = counter();
        registry.register(TypeCode::HEY, handler).unwrap();
        let message = Message::Hey {
            command: 1,
            reply: 2,
            data: 3,
        };
        assert!(registry.dispatch(CardId(0), &message));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_compacts_preserving_order() {
        let registry = HandlerRegistry::new(4);
        let (_, handler) = counter();
        for code in [TypeCode::REP, TypeCode::HEY, TypeCode::NFY, TypeCode::QTI] {
            registry.register(code, handler.clone()).unwrap();
        }
        registry.remove(TypeCode::HEY).unwrap();
        assert_eq!(
            registry.codes(),
            vec![TypeCode::REP, TypeCode::NFY, TypeCode::QTI]
        );
        assert_eq!(
            registry.remove(TypeCode::HEY),
            Err(Error::NoHandler(TypeCode::HEY.0))
        );
        // the freed slot can be reused
        registry.register(TypeCode(0x111111), handler).unwrap();
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn missing_handler_is_not_an_error() {
        let registry = HandlerRegistry::default();
        let message = Message::from(RawMessage([0x414141, 0, 0, 0]));
        assert!(!registry.dispatch(CardId(0), &message));
    }
}
