//! Session factory: shared configuration for persistence contexts.
//!
//! A [`SessionFactory`] holds what every unit of work in an application
//! shares (the metadata model, the default [`SessionConfig`] and an optional
//! second-level cache region) and opens one [`PersistenceContext`] per unit
//! of work.
//!
//! # Example
//!
//! ```rust,ignore
//! use unitwork::prelude::*;
//!
//! let factory = SessionFactory::builder()
//!     .metadata(metadata)
//!     .config(SessionConfig::new().flush_mode(FlushMode::Commit))
//!     .cache(Arc::new(MapCacheRegion::new()))
//!     .build()?;
//!
//! let mut ctx = factory.open(db.connect());
//! ```

use std::sync::Arc;

use unitwork_core::{CacheRegion, Error, MetadataModel, Result, SqlExecutor};
use unitwork_session::{PersistenceContext, SessionConfig};

/// Opens persistence contexts that share metadata, configuration and cache.
#[derive(Clone)]
pub struct SessionFactory {
    metadata: Arc<dyn MetadataModel>,
    config: SessionConfig,
    cache: Option<Arc<dyn CacheRegion>>,
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("entity_types", &self.metadata.entity_types().len())
            .field("config", &self.config)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl SessionFactory {
    /// Create a factory with default configuration and no cache.
    pub fn new(metadata: Arc<dyn MetadataModel>) -> Self {
        Self {
            metadata,
            config: SessionConfig::default(),
            cache: None,
        }
    }

    pub fn builder() -> SessionFactoryBuilder {
        SessionFactoryBuilder::new()
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataModel> {
        &self.metadata
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&Arc<dyn CacheRegion>> {
        self.cache.as_ref()
    }

    /// Open a persistence context on `executor`.
    pub fn open<E: SqlExecutor>(&self, executor: E) -> PersistenceContext<E> {
        self.open_with_config(executor, self.config.clone())
    }

    /// Open a persistence context with configuration overriding the
    /// factory default.
    pub fn open_with_config<E: SqlExecutor>(
        &self,
        executor: E,
        config: SessionConfig,
    ) -> PersistenceContext<E> {
        tracing::debug!(flush_mode = ?config.flush_mode, cache = self.cache.is_some(), "Opening persistence context");
        let ctx = PersistenceContext::with_config(Arc::clone(&self.metadata), executor, config);
        match &self.cache {
            Some(cache) => ctx.with_cache(Arc::clone(cache)),
            None => ctx,
        }
    }
}

/// Builder for [`SessionFactory`].
#[derive(Default)]
pub struct SessionFactoryBuilder {
    metadata: Option<Arc<dyn MetadataModel>>,
    config: SessionConfig,
    cache: Option<Arc<dyn CacheRegion>>,
}

impl SessionFactoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Arc<dyn MetadataModel>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the default configuration from JSON.
    pub fn config_json(mut self, json: &str) -> Result<Self> {
        self.config = SessionConfig::from_json(json)?;
        Ok(self)
    }

    /// Share a second-level cache region between every opened context.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn CacheRegion>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<SessionFactory> {
        let metadata = self
            .metadata
            .ok_or_else(|| Error::InvalidMetadata("session factory has no metadata model".into()))?;
        Ok(SessionFactory {
            metadata,
            config: self.config,
            cache: self.cache,
        })
    }
}
