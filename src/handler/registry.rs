use fnv::FnvHashMap;

use crate::types::{MessageKey, SessionId};

/// The broker's single-use result slots, keyed by `(sessionId, id)`.
///
/// A key lives in here from the moment its command is written until the
/// response is delivered or the slot is drained on shutdown; keys are unique
/// across the whole broker for that window.
#[derive(Debug)]
pub(crate) struct PendingRequests<T> {
    slots: FnvHashMap<MessageKey, T>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            slots: FnvHashMap::default(),
        }
    }
}

impl<T> PendingRequests<T> {
    /// Insert a fresh slot. A colliding key is a caller bug; the slot is
    /// handed back so its waiter can be failed.
    pub fn reserve(&mut self, key: MessageKey, slot: T) -> Result<(), T> {
        if self.slots.contains_key(&key) {
            return Err(slot);
        }
        self.slots.insert(key, slot);
        Ok(())
    }

    /// Move the slot out for resolution. `None` for unknown keys: those are
    /// a warning at the call site, not an error.
    pub fn resolve(&mut self, key: &MessageKey) -> Option<T> {
        self.slots.remove(key)
    }

    /// Take every outstanding slot; used to fail all waiters on shutdown.
    pub fn drain(&mut self) -> Vec<T> {
        self.slots.drain().map(|(_, slot)| slot).collect()
    }

    /// Take the slots belonging to one session, e.g. when it detaches.
    pub fn drain_session(&mut self, session_id: &SessionId) -> Vec<T> {
        let keys: Vec<MessageKey> = self
            .slots
            .keys()
            .filter(|key| &key.session_id == session_id)
            .cloned()
            .collect();
        keys.iter()
            .filter_map(|key| self.slots.remove(key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CallId;

    fn key(session: &str, id: u64) -> MessageKey {
        MessageKey::new(session, CallId::new(id))
    }

    #[test]
    fn keys_are_unique_while_outstanding() {
        let mut pending = PendingRequests::default();
        pending.reserve(key("", 0), "a").unwrap();
        pending.reserve(key("S", 0), "b").unwrap();

        // same pair again is refused and the slot comes back
        assert_eq!(pending.reserve(key("", 0), "c"), Err("c"));

        // once resolved the key may be reused
        assert_eq!(pending.resolve(&key("", 0)), Some("a"));
        pending.reserve(key("", 0), "d").unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn resolve_is_exactly_once() {
        let mut pending = PendingRequests::default();
        pending.reserve(key("S", 7), "slot").unwrap();
        assert_eq!(pending.resolve(&key("S", 7)), Some("slot"));
        assert_eq!(pending.resolve(&key("S", 7)), None);
    }

    #[test]
    fn drain_empties_everything() {
        let mut pending = PendingRequests::default();
        pending.reserve(key("", 0), 1).unwrap();
        pending.reserve(key("A", 0), 2).unwrap();
        pending.reserve(key("A", 1), 3).unwrap();

        let mut drained = pending.drain();
        drained.sort();
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(pending.is_empty());
    }

    #[test]
    fn drain_session_leaves_other_sessions_alone() {
        let mut pending = PendingRequests::default();
        pending.reserve(key("A", 0), "a0").unwrap();
        pending.reserve(key("A", 1), "a1").unwrap();
        pending.reserve(key("B", 0), "b0").unwrap();

        let drained = pending.drain_session(&"A".into());
        assert_eq!(drained.len(), 2);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.resolve(&key("B", 0)), Some("b0"));
    }
}
