// Connection counting per agent. An agent may hold several sockets; only
// the 0->1 and 1->0 edges flip the stored online flag and emit presence
// events.
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
pub struct PresenceTracker {
    counts: Mutex<HashMap<String, i64>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this is the agent's first live connection.
    pub fn connect(&self, agent_id: &str) -> bool {
        let cleaned = agent_id.trim();
        if cleaned.is_empty() {
            return false;
        }
        let mut counts = self.counts.lock();
        let entry = counts.entry(cleaned.to_string()).or_insert(0);
        *entry += 1;
        *entry == 1
    }

    /// Returns true when this was the agent's last live connection.
    pub fn disconnect(&self, agent_id: &str) -> bool {
        let cleaned = agent_id.trim();
        if cleaned.is_empty() {
            return false;
        }
        let mut counts = self.counts.lock();
        match counts.get_mut(cleaned) {
            Some(entry) if *entry > 1 => {
                *entry -= 1;
                false
            }
            Some(_) => {
                counts.remove(cleaned);
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.counts.lock().contains_key(agent_id.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::PresenceTracker;

    #[test]
    fn edges_fire_only_on_first_and_last_connection() {
        let tracker = PresenceTracker::new();
        assert!(tracker.connect("ava"));
        assert!(!tracker.connect("ava"));
        assert!(tracker.is_connected("ava"));
        assert!(!tracker.disconnect("ava"));
        assert!(tracker.disconnect("ava"));
        assert!(!tracker.is_connected("ava"));
    }

    #[test]
    fn disconnect_without_connect_is_a_no_op() {
        let tracker = PresenceTracker::new();
        assert!(!tracker.disconnect("ghost"));
    }
}
