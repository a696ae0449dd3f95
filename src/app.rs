//! Wiring of the engine's components from one [`Config`].

use crate::config::Config;
use crate::content::{ContentStore, SqliteContentStore};
use crate::db::Database;
use crate::extractor::Extractor;
use crate::management::TranslationManager;
use crate::orchestrator::{Orchestrator, TranslationMetrics};
use crate::registry::TableRegistry;
use crate::scan::TaggingPass;
use crate::scope::ScopeMapper;
use crate::tagger::Tagger;
use crate::translation::Translator;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub db: Database,
    pub store: Arc<dyn ContentStore>,
    pub registry: Arc<TableRegistry>,
    pub tagger: Tagger,
    pub orchestrator: Orchestrator,
    pub metrics: Arc<TranslationMetrics>,
}

impl App {
    /// Open both databases and load the registry named by `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let db = Database::new(&config.database_path)?;
        let store = SqliteContentStore::open(&config.content_database_path)
            .with_context(|| format!("Failed to open content database {}", config.content_database_path))?;
        let registry = TableRegistry::load(&config.registry_file)?;
        Self::from_parts(config, db, Arc::new(store), registry)
    }

    pub fn from_parts(
        config: Config,
        db: Database,
        store: Arc<dyn ContentStore>,
        registry: TableRegistry,
    ) -> Result<Self> {
        let translator = Translator::new(config.translator_config())?;
        let metrics = Arc::new(TranslationMetrics::new());
        let orchestrator = Orchestrator::new(
            db.clone(),
            translator,
            Arc::new(config.rate_limiter()),
            metrics.clone(),
            config.orchestrator_config(),
        );

        info!(
            "Engine ready: {} registered tables, target languages {:?}",
            registry.tables().len(),
            config.target_languages
        );

        Ok(Self {
            tagger: Tagger::new(db.clone()),
            config: Arc::new(config),
            db,
            store,
            registry: Arc::new(registry),
            orchestrator,
            metrics,
        })
    }

    pub fn tagging_pass(&self) -> TaggingPass {
        TaggingPass::new(
            self.store.clone(),
            self.registry.clone(),
            self.tagger.clone(),
            Extractor::new(self.tagger.clone(), self.config.extract_context()),
            self.config.scan_config(),
        )
    }

    pub fn scope_mapper(&self) -> ScopeMapper {
        ScopeMapper::new(self.store.clone(), self.registry.clone(), self.db.clone())
    }

    pub fn manager(&self) -> TranslationManager {
        TranslationManager::new(self.tagger.clone(), self.store.clone(), self.registry.clone())
    }
}
