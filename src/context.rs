use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::Ledger;

/// Process-wide state built once at startup and handed to the orchestrator.
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub ledger: Ledger,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let ledger = Ledger::open(&config.ledger_path);
        Self {
            config: Arc::new(config),
            ledger,
        }
    }
}
