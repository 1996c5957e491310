//! Message-id bookkeeping for duplicate suppression.

use std::collections::VecDeque;

/// How many recent message ids are remembered.
pub const RECENT_CAPACITY: usize = 10;

/// Last-seen message ids.
///
/// Ids are kept in arrival order; once the window is full the oldest id
/// is evicted first.
#[derive(Debug, Clone)]
pub struct SessionState {
    last_message_id: Option<String>,
    recent: VecDeque<String>,
    capacity: usize,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::with_capacity(RECENT_CAPACITY)
    }
}

impl SessionState {
    /// Create a session with the default window.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session remembering `capacity` ids (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            last_message_id: None,
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `mid`. Returns `false` if it is a duplicate.
    pub fn observe(&mut self, mid: &str) -> bool {
        if self.is_duplicate(mid) {
            return false;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(mid.to_string());
        self.last_message_id = Some(mid.to_string());
        true
    }

    /// Whether `mid` is within the remembered window.
    #[must_use]
    pub fn is_duplicate(&self, mid: &str) -> bool {
        self.recent.iter().any(|seen| seen == mid)
    }

    /// Most recently accepted id.
    #[must_use]
    pub fn last_message_id(&self) -> Option<&str> {
        self.last_message_id.as_deref()
    }

    /// Remembered ids, oldest first.
    pub fn recent_ids(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }

    /// Number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.recent.len()
    }

    /// Whether no id has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_duplicate_rejected() {
        let mut session = SessionState::new();
        assert!(session.observe("a"));
        assert!(!session.observe("a"));
        assert_eq!(session.len(), 1);
        assert_eq!(session.last_message_id(), Some("a"));
    }

    #[test]
    fn test_oldest_evicted_first() {
        let mut session = SessionState::new();
        for i in 0..11 {
            assert!(session.observe(&i.to_string()));
        }
        assert_eq!(session.len(), RECENT_CAPACITY);
        assert_eq!(session.recent_ids().next(), Some("1"));
        // "0" fell out of the window and is accepted again
        assert!(session.observe("0"));
        assert!(!session.observe("5"));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut session = SessionState::with_capacity(0);
        assert!(session.observe("a"));
        assert!(!session.observe("a"));
        assert!(session.observe("b"));
        assert!(session.observe("a"));
    }

    proptest! {
        #[test]
        fn prop_window_never_exceeds_capacity(ids in proptest::collection::vec(0u8..30, 0..200)) {
            let mut session = SessionState::new();
            for id in &ids {
                session.observe(&id.to_string());
                prop_assert!(session.len() <= RECENT_CAPACITY);
            }
        }

        #[test]
        fn prop_matches_fifo_model(ids in proptest::collection::vec(0u8..15, 0..200)) {
            let mut session = SessionState::new();
            let mut model: VecDeque<String> = VecDeque::new();
            for id in ids.iter().map(ToString::to_string) {
                let expected_new = !model.contains(&id);
                if expected_new {
                    if model.len() == RECENT_CAPACITY {
                        model.pop_front();
                    }
                    model.push_back(id.clone());
                }
                prop_assert_eq!(session.observe(&id), expected_new);
                prop_assert!(session.recent_ids().eq(model.iter().map(String::as_str)));
            }
        }

        #[test]
        fn prop_repeated_delivery_accepted_once(ids in proptest::collection::hash_set("[a-z0-9]{1,8}", 1..10), repeats in 2usize..5) {
            // with fewer distinct ids than the window, every id is accepted exactly once
            let mut session = SessionState::new();
            let mut accepted = 0usize;
            for _ in 0..repeats {
                for id in &ids {
                    if session.observe(id) {
                        accepted += 1;
                    }
                }
            }
            prop_assert_eq!(accepted, ids.len());
        }
    }
}
