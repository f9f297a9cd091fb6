//! Engine-to-factory registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::driver::backends::memory::MemoryFactory;
#[cfg(feature = "mongodb")]
use crate::driver::backends::mongodb::MongoFactory;
#[cfg(feature = "mysql")]
use crate::driver::backends::mysql::MySqlFactory;
use crate::driver::backends::postgres::PostgresFactory;
#[cfg(feature = "spanner")]
use crate::driver::backends::spanner::SpannerFactory;
use crate::driver::traits::{Driver, DriverFactory};
use crate::driver::types::{ConnectionConfig, ConnectionContext, DriverConfig, EngineType};
use crate::error::DriverError;

/// Maps each engine to the factory that opens its drivers.
///
/// Built once at startup and passed to whatever opens connections.
/// Registration normally happens before any reads, but the map is still
/// guarded so a registry can be shared across tasks.
#[derive(Default)]
pub struct Registry {
    factories: RwLock<HashMap<EngineType, Arc<dyn DriverFactory>>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every driver compiled into this build.
    pub fn with_default_drivers() -> Self {
        let registry = Self::new();
        registry.register(EngineType::Postgres, Arc::new(PostgresFactory));
        #[cfg(feature = "mysql")]
        registry.register(EngineType::MySql, Arc::new(MySqlFactory));
        #[cfg(feature = "mongodb")]
        registry.register(EngineType::MongoDb, Arc::new(MongoFactory));
        #[cfg(feature = "spanner")]
        registry.register(EngineType::Spanner, Arc::new(SpannerFactory));
        registry.register(EngineType::Memory, Arc::new(MemoryFactory::default()));
        registry
    }

    /// Registers `factory` for `engine`.
    ///
    /// # Panics
    ///
    /// Panics if `engine` already has a factory. Double registration is a
    /// wiring mistake, not something to recover from at runtime.
    pub fn register(&self, engine: EngineType, factory: Arc<dyn DriverFactory>) {
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        if factories.contains_key(&engine) {
            panic!("driver for engine {engine} registered twice");
        }
        factories.insert(engine, factory);
    }

    pub fn is_registered(&self, engine: EngineType) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&engine)
    }

    /// Opens a driver and pings it before handing it out. A driver that
    /// fails the ping is closed again.
    pub async fn open(
        &self,
        engine: EngineType,
        config: &DriverConfig,
        connection: &ConnectionConfig,
        context: &ConnectionContext,
    ) -> Result<Box<dyn Driver>, DriverError> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&engine)
            .cloned()
            .ok_or(DriverError::UnknownDriver(engine))?;

        let driver = factory.open(engine, config, connection, context).await?;
        if let Err(err) = driver.ping().await {
            if let Err(close_err) = driver.close().await {
                tracing::warn!(
                    engine = %engine,
                    error = %close_err,
                    "Failed to close driver after ping failure"
                );
            }
            return Err(err);
        }

        tracing::debug!(
            engine = %engine,
            target = %connection.target(engine),
            environment = %context.environment_name,
            instance = %context.instance_name,
            "Opened database driver"
        );
        Ok(driver)
    }
}
