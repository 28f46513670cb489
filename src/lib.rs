// Library entrypoint for integration tests and internal reuse.
pub mod api;
pub mod auth;
pub mod config;
pub mod services;
pub mod shutdown;
pub mod state;
pub mod storage;

pub use api::build_router;
pub use state::AppState;
