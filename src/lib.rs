pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod handlers;
pub mod lifecycle;
pub mod models;
pub mod registry;
pub mod routes;
pub mod scoring;
pub mod session;
pub mod state;
pub mod store;
pub mod timer;

use anyhow::Context;
use config::Settings;
use store::InMemoryStore;
use tracing::info;

/// Opens the local store and imports the seed document, if one is configured.
pub async fn build_state(settings: Settings) -> anyhow::Result<state::AppState> {
    let db = InMemoryStore::open(settings.local_state_path.as_deref());
    if let Some(path) = settings.tests_seed_path.as_deref() {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read tests seed {path}"))?;
        let count = db
            .import_tests_json(&raw)
            .await
            .with_context(|| format!("import tests seed {path}"))?;
        info!(count, path, "tests seeded");
    }
    Ok(state::AppState::new(db, settings))
}
