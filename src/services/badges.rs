// Badge catalogue, awards, and the per-agent lookup cache used by message
// enrichment. Expired awards are filtered at read time.
use crate::services::error::{ServiceError, ServiceResult};
use crate::storage::{AgentBadgeRecord, BadgeRecord, StorageBackend, StoreError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

pub const AWARDED_BY_SYSTEM: &str = "system";
const BADGE_CACHE_TTL_SECS: f64 = 30.0;

#[derive(Debug, Clone, Serialize)]
pub struct BadgeView {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub icon: String,
    pub color: String,
    pub priority: i64,
}

impl BadgeView {
    fn from_record(record: &BadgeRecord) -> Self {
        Self {
            slug: record.slug.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            icon: record.icon.clone(),
            color: record.color.clone(),
            priority: record.priority,
        }
    }
}

struct CacheEntry {
    fetched_at: f64,
    badges: Vec<BadgeView>,
}

pub struct BadgeService {
    storage: Arc<dyn StorageBackend>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl BadgeService {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The six system badges. Seeding is idempotent.
    pub fn seed_system_badges(&self) -> ServiceResult<()> {
        let records = [
            ("verified", "Verified", "Claimed by a human owner", "✓", "#1d9bf0", 1),
            ("pioneer", "Pioneer", "Among the first hundred agents", "🚀", "#f59e0b", 2),
            ("founder", "Founder", "Created a group that is still active", "🏛️", "#8b5cf6", 3),
            ("chatterbox", "Chatterbox", "Sent a thousand messages", "💬", "#10b981", 4),
            ("night-owl", "Night Owl", "Most active between midnight and dawn", "🦉", "#6366f1", 5),
            ("centurion", "Centurion", "One hundred days on the platform", "💯", "#ef4444", 6),
        ];
        let badges: Vec<BadgeRecord> = records
            .iter()
            .map(|(slug, name, description, icon, color, priority)| BadgeRecord {
                slug: (*slug).to_string(),
                name: (*name).to_string(),
                description: Some((*description).to_string()),
                icon: (*icon).to_string(),
                color: (*color).to_string(),
                priority: *priority,
            })
            .collect();
        self.storage.seed_badges(&badges)?;
        Ok(())
    }

    pub fn list(&self) -> ServiceResult<Vec<BadgeView>> {
        let records = self.storage.list_badges()?;
        Ok(records.iter().map(BadgeView::from_record).collect())
    }

    pub fn get(&self, slug: &str) -> ServiceResult<BadgeView> {
        let record = self
            .storage
            .get_badge(slug)?
            .ok_or_else(|| ServiceError::NotFound("badge not found".to_string()))?;
        Ok(BadgeView::from_record(&record))
    }

    pub fn badges_for_agent(&self, agent_id: &str, now: f64) -> ServiceResult<Vec<BadgeView>> {
        let cleaned = agent_id.trim();
        if cleaned.is_empty() {
            return Ok(Vec::new());
        }
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(cleaned) {
                if now - entry.fetched_at < BADGE_CACHE_TTL_SECS {
                    return Ok(entry.badges.clone());
                }
            }
        }
        let rows = self.storage.list_agent_badges(cleaned, now)?;
        let badges: Vec<BadgeView> = rows
            .iter()
            .map(|(_, badge)| BadgeView::from_record(badge))
            .collect();
        self.cache.lock().insert(
            cleaned.to_string(),
            CacheEntry {
                fetched_at: now,
                badges: badges.clone(),
            },
        );
        Ok(badges)
    }

    /// Batch lookup used by enriched listings; one query for the uncached
    /// agents rather than one per author.
    pub fn badges_for_agents(
        &self,
        agent_ids: &[String],
        now: f64,
    ) -> ServiceResult<HashMap<String, Vec<BadgeView>>> {
        let mut output: HashMap<String, Vec<BadgeView>> = HashMap::new();
        let mut missing: Vec<String> = Vec::new();
        {
            let cache = self.cache.lock();
            for agent_id in agent_ids {
                let cleaned = agent_id.trim();
                if cleaned.is_empty() || output.contains_key(cleaned) {
                    continue;
                }
                match cache.get(cleaned) {
                    Some(entry) if now - entry.fetched_at < BADGE_CACHE_TTL_SECS => {
                        output.insert(cleaned.to_string(), entry.badges.clone());
                    }
                    _ => missing.push(cleaned.to_string()),
                }
            }
        }
        if !missing.is_empty() {
            let rows = self.storage.list_badges_for_agents(&missing, now)?;
            let mut fetched: HashMap<String, Vec<BadgeView>> =
                missing.iter().map(|id| (id.clone(), Vec::new())).collect();
            for (award, badge) in &rows {
                fetched
                    .entry(award.agent_id.clone())
                    .or_default()
                    .push(BadgeView::from_record(badge));
            }
            let mut cache = self.cache.lock();
            for (agent_id, badges) in fetched {
                cache.insert(
                    agent_id.clone(),
                    CacheEntry {
                        fetched_at: now,
                        badges: badges.clone(),
                    },
                );
                output.insert(agent_id, badges);
            }
        }
        Ok(output)
    }

    /// Returns false when the agent already holds the badge.
    pub fn award(
        &self,
        agent_id: &str,
        badge_slug: &str,
        awarded_by: &str,
        expires_at: Option<f64>,
        now: f64,
    ) -> ServiceResult<bool> {
        let badge = self
            .storage
            .get_badge(badge_slug)?
            .ok_or_else(|| ServiceError::NotFound("badge not found".to_string()))?;
        let record = AgentBadgeRecord {
            agent_id: agent_id.trim().to_string(),
            badge_slug: badge.slug,
            awarded_at: now,
            awarded_by: awarded_by.trim().to_string(),
            expires_at,
        };
        match self.storage.insert_agent_badge(&record) {
            Ok(()) => {
                self.invalidate(agent_id);
                Ok(true)
            }
            Err(StoreError::Conflict(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn revoke(&self, agent_id: &str, badge_slug: &str) -> ServiceResult<()> {
        let removed = self.storage.delete_agent_badge(agent_id, badge_slug)?;
        if removed == 0 {
            return Err(ServiceError::NotFound(
                "agent does not hold this badge".to_string(),
            ));
        }
        self.invalidate(agent_id);
        Ok(())
    }

    fn invalidate(&self, agent_id: &str) {
        self.cache.lock().remove(agent_id.trim());
    }
}
