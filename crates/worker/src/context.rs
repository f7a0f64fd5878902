use std::sync::Arc;

use modhist_db::registry::EntityRegistry;
use modhist_db::DbPool;
use modhist_events::{EventBus, Notifier, RecipientDirectory, StaticDirectory};

use crate::config::WorkerConfig;

/// Everything a task handler needs. Cheap to clone.
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: DbPool,
    pub registry: Arc<EntityRegistry>,
    pub bus: Arc<EventBus>,
    /// `None` disables outbound notifications.
    pub notifier: Option<Arc<dyn Notifier>>,
    pub directory: Arc<dyn RecipientDirectory>,
    pub config: WorkerConfig,
}

impl WorkerContext {
    /// A context with no notifier and a directory of the configured
    /// moderator addresses.
    pub fn new(pool: DbPool, registry: Arc<EntityRegistry>, config: WorkerConfig) -> Self {
        let directory = StaticDirectory::new(config.moderator_emails.clone());
        Self {
            pool,
            registry,
            bus: Arc::new(EventBus::default()),
            notifier: None,
            directory: Arc::new(directory),
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn RecipientDirectory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }
}
