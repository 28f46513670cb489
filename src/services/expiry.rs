// Periodic reclamation of disappearing messages. Each pass notifies both
// participants, then deletes; duplicate notifications on a retried pass are
// acceptable.
use crate::services::error::ServiceResult;
use crate::services::events::{agent_room, EventBus, EventKind, RealtimeEvent};
use crate::services::now_ts;
use crate::storage::StorageBackend;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const SWEEP_INTERVAL_SECS: u64 = 60;

pub struct ExpirySweeper {
    storage: Arc<dyn StorageBackend>,
    events: Arc<EventBus>,
}

impl ExpirySweeper {
    pub fn new(storage: Arc<dyn StorageBackend>, events: Arc<EventBus>) -> Self {
        Self { storage, events }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.sweep(now_ts()) {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "expired direct messages reclaimed"),
                    Err(err) => warn!("expiry sweep failed, retrying next tick: {err}"),
                }
            }
        })
    }

    /// One pass: emit `dm:expired` to both participants per row, then
    /// delete the rows.
    pub fn sweep(&self, now: f64) -> ServiceResult<usize> {
        let expired = self.storage.list_expired_direct_messages(now)?;
        if expired.is_empty() {
            return Ok(0);
        }
        for message in &expired {
            let payload = json!({ "message_id": message.message_id });
            for participant in [&message.from_agent_id, &message.to_agent_id] {
                self.events.publish(
                    &agent_room(participant),
                    RealtimeEvent::new(EventKind::DmExpired, payload.clone()),
                );
            }
        }
        let ids: Vec<String> = expired
            .iter()
            .map(|message| message.message_id.clone())
            .collect();
        self.storage.delete_direct_messages_by_ids(&ids)?;
        Ok(ids.len())
    }
}
