use std::time::{SystemTime, UNIX_EPOCH};

use forma_core::{ConfigStore, EventBus, ResponseCoordinator, SessionStore};
use forma_providers::ProviderRegistry;

mod http;

pub use http::serve;

/// Everything a request handler needs, assembled once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: ConfigStore,
    pub event_bus: EventBus,
    pub providers: ProviderRegistry,
    pub sessions: SessionStore,
    pub coordinator: ResponseCoordinator,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn build_id() -> String {
    if let Some(explicit) = option_env!("FORMA_BUILD_ID") {
        let trimmed = explicit.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    env!("CARGO_PKG_VERSION").to_string()
}
