pub mod error;
pub mod handlers;
pub mod launch;
pub mod models;
pub mod routes;
pub mod session;
pub mod state;

use std::sync::Arc;

pub fn build_state() -> state::AppState {
    let mission_notifier: Arc<dyn state::MissionNotifier> =
        if let Some(webhook) = state::WebhookMissionNotifier::from_env() {
            Arc::new(webhook)
        } else {
            Arc::new(state::NoopMissionNotifier)
        };
    state::AppState::new(mission_notifier)
}
