// Domain services: everything between the HTTP boundary and the store.
pub mod badges;
pub mod dm;
pub mod error;
pub mod events;
pub mod expiry;
pub mod groups;
pub mod identity;
pub mod messaging;
pub mod observer;
pub mod permissions;
pub mod presence;
pub mod verification;

/// Current wall clock as unix seconds. Service mutators take `now: f64`
/// parameters so tests can inject the clock; handlers call this at the edge.
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
