//! Typing indicators.
//!
//! Each signal only refreshes a timestamp. Whoever scheduled the follow-up
//! check calls [`TypingTracker::clear_if_stale`], which clears the entry
//! only if no newer signal arrived in the meantime, so overlapping signals
//! never make the indicator flicker.

use std::collections::HashMap;
use std::time::Duration;

use sigil_shared::{Address, DialogId};
use tokio::time::Instant;

#[derive(Debug)]
pub struct TypingTracker {
    window: Duration,
    active: HashMap<DialogId, HashMap<Address, Instant>>,
}

impl TypingTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            active: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a signal. Returns `true` if `who` was not already typing.
    pub fn touch(&mut self, key: &DialogId, who: &Address, now: Instant) -> bool {
        self.active
            .entry(key.clone())
            .or_default()
            .insert(who.clone(), now)
            .is_none()
    }

    /// Clear `who` if the last signal is at least one window old. Returns
    /// `true` if it was cleared.
    pub fn clear_if_stale(&mut self, key: &DialogId, who: &Address, now: Instant) -> bool {
        let Some(typers) = self.active.get_mut(key) else {
            return false;
        };
        let stale = typers
            .get(who)
            .is_some_and(|last| now.saturating_duration_since(*last) >= self.window);
        if !stale {
            return false;
        }
        typers.remove(who);
        if typers.is_empty() {
            self.active.remove(key);
        }
        true
    }

    /// Drop `who` immediately, e.g. because their message just arrived.
    pub fn clear(&mut self, key: &DialogId, who: &Address) -> bool {
        let Some(typers) = self.active.get_mut(key) else {
            return false;
        };
        let removed = typers.remove(who).is_some();
        if typers.is_empty() {
            self.active.remove(key);
        }
        removed
    }

    pub fn typing(&self, key: &DialogId) -> Vec<Address> {
        let mut who: Vec<Address> = self
            .active
            .get(key)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        who.sort();
        who
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(3);

    fn setup() -> (TypingTracker, DialogId, Address) {
        (
            TypingTracker::new(WINDOW),
            DialogId("d".into()),
            Address::new("0xbob"),
        )
    }

    #[test]
    fn test_clears_after_window() {
        let (mut t, key, bob) = setup();
        let start = Instant::now();
        assert!(t.touch(&key, &bob, start));
        assert_eq!(t.typing(&key), vec![bob.clone()]);

        assert!(!t.clear_if_stale(&key, &bob, start + Duration::from_secs(1)));
        assert!(t.clear_if_stale(&key, &bob, start + WINDOW));
        assert!(t.typing(&key).is_empty());
    }

    #[test]
    fn test_refresh_defers_clear() {
        let (mut t, key, bob) = setup();
        let start = Instant::now();
        t.touch(&key, &bob, start);
        assert!(!t.touch(&key, &bob, start + Duration::from_secs(2)));

        // The check scheduled by the first signal must not clear.
        assert!(!t.clear_if_stale(&key, &bob, start + WINDOW));
        assert_eq!(t.typing(&key), vec![bob.clone()]);
        // The one scheduled by the refresh does.
        assert!(t.clear_if_stale(&key, &bob, start + Duration::from_secs(5)));
    }

    #[test]
    fn test_keys_are_independent() {
        let (mut t, key, bob) = setup();
        let room = DialogId::room("lobby");
        let start = Instant::now();
        t.touch(&key, &bob, start);
        t.touch(&room, &bob, start + Duration::from_secs(2));

        assert!(t.clear_if_stale(&key, &bob, start + WINDOW));
        assert_eq!(t.typing(&room), vec![bob.clone()]);
        assert!(t.clear(&room, &bob));
        assert!(!t.clear(&room, &bob));
    }
}
