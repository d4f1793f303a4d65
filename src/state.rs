use std::sync::Arc;

use crate::{config::Config, exam::autosave::AutosaveBuffer};
use axum::extract::FromRef;
use sqlx::PgPool;

/// Shared application state handed to every handler and background task.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub autosave: Arc<AutosaveBuffer>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        Self {
            pool,
            config,
            autosave: Arc::new(AutosaveBuffer::new()),
        }
    }
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<AppState> for Config {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}
