//! Remote cursor presence for the client.
//!
//! Tracks "who is where" in a document: each collaborator's latest cursor
//! range, fed by `remote-cursor` and `user-left` events. Cursor updates
//! are hints — unordered relative to ops, never persisted, never
//! transformed — so the registry is deliberately lossy: stale peers are
//! swept after an idle timeout, and outgoing local updates are throttled
//! so a fast-moving caret does not flood the room.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::CursorRange;

/// Minimum interval between outgoing cursor updates.
const CURSOR_SEND_INTERVAL: Duration = Duration::from_millis(50);
/// Peers silent for this long are swept.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A collaborator's last known cursor.
#[derive(Debug, Clone)]
pub struct RemoteCursor {
    pub user_id: String,
    /// `None` means the peer cleared its cursor.
    pub range: Option<CursorRange>,
    last_seen: Instant,
}

impl RemoteCursor {
    fn new(user_id: String, range: Option<CursorRange>) -> Self {
        Self { user_id, range, last_seen: Instant::now() }
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Client-side registry of remote cursors for one document.
pub struct CursorRegistry {
    local_user_id: String,
    peers: HashMap<String, RemoteCursor>,
    last_sent: Option<Instant>,
    send_interval: Duration,
    idle_timeout: Duration,
}

impl CursorRegistry {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            peers: HashMap::new(),
            last_sent: None,
            send_interval: CURSOR_SEND_INTERVAL,
            idle_timeout: IDLE_TIMEOUT,
        }
    }

    /// Custom throttle interval (tests).
    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Record a `remote-cursor` event. Echoes of our own cursor are
    /// ignored.
    pub fn apply_remote(&mut self, user_id: &str, range: Option<CursorRange>) {
        if user_id == self.local_user_id {
            return;
        }
        self.peers
            .insert(user_id.to_string(), RemoteCursor::new(user_id.to_string(), range));
    }

    /// Record a `user-left` event.
    pub fn apply_left(&mut self, user_id: &str) {
        self.peers.remove(user_id);
    }

    /// Throttle gate for outgoing updates: returns whether this local
    /// cursor move should be sent now.
    pub fn should_send(&mut self) -> bool {
        match self.last_sent {
            Some(last) if last.elapsed() < self.send_interval => false,
            _ => {
                self.last_sent = Some(Instant::now());
                true
            }
        }
    }

    /// Drop peers that have been silent past the idle timeout. Returns
    /// the swept user ids.
    pub fn sweep_idle(&mut self) -> Vec<String> {
        let timeout = self.idle_timeout;
        let stale: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.is_idle(timeout))
            .map(|p| p.user_id.clone())
            .collect();
        for user_id in &stale {
            self.peers.remove(user_id);
        }
        stale
    }

    pub fn peer(&self, user_id: &str) -> Option<&RemoteCursor> {
        self.peers.get(user_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &RemoteCursor> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_apply_remote_tracks_peer() {
        let mut registry = CursorRegistry::new("alice");
        registry.apply_remote("bob", Some(CursorRange::selection(2, 5)));

        assert_eq!(registry.peer_count(), 1);
        let bob = registry.peer("bob").unwrap();
        assert_eq!(bob.range, Some(CursorRange::selection(2, 5)));
    }

    #[test]
    fn test_own_echo_ignored() {
        let mut registry = CursorRegistry::new("alice");
        registry.apply_remote("alice", Some(CursorRange::caret(0)));
        assert_eq!(registry.peer_count(), 0);
    }

    #[test]
    fn test_cleared_cursor_keeps_peer() {
        let mut registry = CursorRegistry::new("alice");
        registry.apply_remote("bob", Some(CursorRange::caret(3)));
        registry.apply_remote("bob", None);

        assert_eq!(registry.peer_count(), 1);
        assert!(registry.peer("bob").unwrap().range.is_none());
    }

    #[test]
    fn test_user_left_removes_peer() {
        let mut registry = CursorRegistry::new("alice");
        registry.apply_remote("bob", Some(CursorRange::caret(1)));
        registry.apply_left("bob");
        assert_eq!(registry.peer_count(), 0);
    }

    #[test]
    fn test_send_throttling() {
        let mut registry =
            CursorRegistry::new("alice").with_send_interval(Duration::from_millis(30));

        assert!(registry.should_send());
        assert!(!registry.should_send());

        thread::sleep(Duration::from_millis(40));
        assert!(registry.should_send());
    }

    #[test]
    fn test_sweep_idle_peers() {
        let mut registry =
            CursorRegistry::new("alice").with_idle_timeout(Duration::from_millis(20));
        registry.apply_remote("bob", Some(CursorRange::caret(1)));
        registry.apply_remote("carol", Some(CursorRange::caret(2)));

        thread::sleep(Duration::from_millis(40));
        registry.apply_remote("carol", Some(CursorRange::caret(3)));

        let swept = registry.sweep_idle();
        assert_eq!(swept, vec!["bob".to_string()]);
        assert_eq!(registry.peer_count(), 1);
        assert!(registry.peer("carol").is_some());
    }
}
