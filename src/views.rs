//! Cached derived views and the current conversation selection.
//!
//! Each cached slot carries a generation counter. A reader notes the
//! generation before fetching and may only store its result if no
//! invalidation happened in between, so a slow fetch never overwrites
//! fresher state.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;
use tracing::trace;

use crate::models::{Conversation, ConversationId, Message, TicketView};

struct Slot<V> {
    generation: u64,
    value: Option<V>,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            generation: 0,
            value: None,
        }
    }
}

/// Generation-guarded cache of one kind of view, keyed by `K`.
pub struct ViewStore<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> Default for ViewStore<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> ViewStore<K, V> {
    /// Cached value, if present and not invalidated.
    pub fn get(&self, key: &K) -> Option<V> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).and_then(|slot| slot.value.clone())
    }

    /// Generation to hand back to [`ViewStore::store`] after fetching.
    pub fn generation(&self, key: &K) -> u64 {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).map_or(0, |slot| slot.generation)
    }

    /// Store `value` unless the slot was invalidated since `generation`.
    /// Returns whether the value was stored.
    pub fn store(&self, key: K, generation: u64, value: V) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key).or_default();
        if slot.generation != generation {
            trace!(expected = generation, current = slot.generation, "discarding stale view");
            return false;
        }
        slot.value = Some(value);
        true
    }

    /// Drop the cached value and bump the generation.
    pub fn invalidate(&self, key: &K) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key.clone()).or_default();
        slot.generation += 1;
        slot.value = None;
    }
}

/// All derived views the presentation layer reads.
#[derive(Default)]
pub struct ViewCache {
    /// Resolved conversation list
    pub conversations: ViewStore<(), Vec<Conversation>>,
    /// Tickets with steps, per conversation
    pub tickets: ViewStore<ConversationId, Vec<TicketView>>,
    /// Message stream, per conversation
    pub messages: ViewStore<ConversationId, Vec<Message>>,
}

impl ViewCache {
    /// Empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cached conversation list.
    pub fn invalidate_conversations(&self) {
        self.conversations.invalidate(&());
    }

    /// Drop the cached ticket views of `conversation`.
    pub fn invalidate_tickets(&self, conversation: ConversationId) {
        self.tickets.invalidate(&conversation);
    }

    /// Drop the cached messages of `conversation`.
    pub fn invalidate_messages(&self, conversation: ConversationId) {
        self.messages.invalidate(&conversation);
    }
}

/// Which conversation is open, if any.
///
/// Async work that outlives a selection change checks
/// [`Selection::is_current`] before applying its result.
pub struct Selection {
    tx: watch::Sender<Option<ConversationId>>,
}

impl Default for Selection {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }
}

impl Selection {
    /// Nothing selected
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `conversation`, or close the current one with `None`.
    pub fn select(&self, conversation: Option<ConversationId>) {
        self.tx.send_replace(conversation);
    }

    /// The open conversation
    #[must_use]
    pub fn current(&self) -> Option<ConversationId> {
        *self.tx.borrow()
    }

    /// True while `conversation` is the open one.
    #[must_use]
    pub fn is_current(&self, conversation: ConversationId) -> bool {
        self.current() == Some(conversation)
    }

    /// Receiver notified on every change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<ConversationId>> {
        self.tx.subscribe()
    }
}
