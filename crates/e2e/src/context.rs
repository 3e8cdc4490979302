//! Shared state handed to every variation

use std::sync::Arc;

use crate::config::HarnessConfig;
use crate::database::{DatabaseProvisioner, SqliteProvisioner};
use crate::error::HarnessResult;
use crate::ports::PortAllocator;
use crate::publish::{publisher_from_config, Publisher};

/// Configuration plus the collaborators variations share. Cheap to clone.
#[derive(Clone)]
pub struct HarnessContext {
    pub config: Arc<HarnessConfig>,
    pub ports: PortAllocator,
    pub database: Arc<dyn DatabaseProvisioner>,
    pub publisher: Arc<dyn Publisher>,
}

impl HarnessContext {
    pub fn from_config(config: HarnessConfig) -> HarnessResult<Self> {
        config.validate()?;
        let ports = PortAllocator::from_config(&config.ports);
        let database = Arc::new(SqliteProvisioner::from_config(&config.database));
        let publisher = publisher_from_config(&config.publish)?;
        Ok(Self {
            config: Arc::new(config),
            ports,
            database,
            publisher,
        })
    }

    pub fn with_database(mut self, database: Arc<dyn DatabaseProvisioner>) -> Self {
        self.database = database;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = publisher;
        self
    }
}
