// Process-wide state: storage, event bus and the domain services, wired
// once at startup and shared behind Arcs.
use crate::api::rate_limit::RateLimiter;
use crate::config::Config;
use crate::services::badges::BadgeService;
use crate::services::dm::DmService;
use crate::services::events::EventBus;
use crate::services::expiry::ExpirySweeper;
use crate::services::groups::GroupService;
use crate::services::identity::IdentityService;
use crate::services::messaging::MessagingService;
use crate::services::observer::ObserverService;
use crate::services::presence::PresenceTracker;
use crate::services::verification::build_verification;
use crate::storage::{build_storage, StorageBackend};
use anyhow::{Context, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn StorageBackend>,
    pub events: Arc<EventBus>,
    pub presence: Arc<PresenceTracker>,
    pub badges: Arc<BadgeService>,
    pub identity: Arc<IdentityService>,
    pub groups: Arc<GroupService>,
    pub messaging: Arc<MessagingService>,
    pub dm: Arc<DmService>,
    pub observer: Arc<ObserverService>,
    pub sweeper: Arc<ExpirySweeper>,
    pub register_limiter: RateLimiter,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let storage = build_storage(&config.storage).context("storage initialization failed")?;
        storage
            .ensure_initialized()
            .map_err(|err| anyhow::anyhow!("schema initialization failed: {err}"))?;
        let events = Arc::new(EventBus::new());
        let presence = Arc::new(PresenceTracker::new());
        let badges = Arc::new(BadgeService::new(storage.clone()));
        badges
            .seed_system_badges()
            .map_err(|err| anyhow::anyhow!("badge seeding failed: {err}"))?;
        let verification = build_verification(&config.verification)
            .map_err(|err| anyhow::anyhow!("verification setup failed: {err}"))?;
        let identity = Arc::new(IdentityService::new(
            storage.clone(),
            verification,
            badges.clone(),
            config.server.frontend_url.clone(),
        ));
        let groups = Arc::new(GroupService::new(storage.clone(), events.clone()));
        let messaging = Arc::new(MessagingService::new(
            storage.clone(),
            events.clone(),
            badges.clone(),
            groups.clone(),
        ));
        let dm = Arc::new(DmService::new(
            storage.clone(),
            events.clone(),
            badges.clone(),
        ));
        let observer = Arc::new(ObserverService::new(
            storage.clone(),
            badges.clone(),
            groups.clone(),
        ));
        let sweeper = Arc::new(ExpirySweeper::new(storage.clone(), events.clone()));
        Ok(Self {
            config,
            storage,
            events,
            presence,
            badges,
            identity,
            groups,
            messaging,
            dm,
            observer,
            sweeper,
            register_limiter: RateLimiter::new(),
        })
    }
}
