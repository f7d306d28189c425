//! Resolves configuration, database and content source for a command.
//!
//! Precedence for every path: command-line flag (or its environment
//! variable), then the config file, then `~/.siphon`.

use crate::cli::error::HelpfulError;
use anyhow::{Context as _, Result};
use siphon_db::SiphonDb;
use siphon_sync::{ContentProvider, JobClaimer, Manifest, SiphonConfig, SyncEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "siphon.db";

/// Paths given on the command line.
#[derive(Debug, Default, Clone)]
pub struct ContextArgs {
    pub config: Option<PathBuf>,
    pub database: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
}

pub struct Context {
    pub config: SiphonConfig,
    pub db: SiphonDb,
    manifest: Option<Arc<Manifest>>,
}

impl Context {
    pub async fn open(args: &ContextArgs) -> Result<Self> {
        let config_path = match &args.config {
            Some(path) => path.clone(),
            None => siphon_logging::siphon_home()?.join(CONFIG_FILE),
        };
        let config = SiphonConfig::load(&config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?;

        let db_path = match args.database.clone().or_else(|| config.database_path.clone()) {
            Some(path) => path,
            None => siphon_logging::siphon_home()?.join(DATABASE_FILE),
        };
        let db = SiphonDb::open(&db_path)
            .await
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;

        let manifest = match args.manifest.clone().or_else(|| config.manifest_path.clone()) {
            Some(path) => Some(Arc::new(load_manifest(&path)?)),
            None => None,
        };

        Ok(Self {
            config,
            db,
            manifest,
        })
    }

    /// Build a context around an already open database.
    #[cfg(test)]
    pub fn with_db(config: SiphonConfig, db: SiphonDb, manifest: Option<Manifest>) -> Self {
        Self {
            config,
            db,
            manifest: manifest.map(Arc::new),
        }
    }

    pub fn has_manifest(&self) -> bool {
        self.manifest.is_some()
    }

    pub fn providers(&self) -> Vec<Arc<dyn ContentProvider>> {
        match &self.manifest {
            Some(manifest) => manifest.providers(&self.db),
            None => Vec::new(),
        }
    }

    pub fn engine(&self) -> SyncEngine {
        let mut engine = SyncEngine::new(self.db.clone(), self.config.sync.clone());
        for provider in self.providers() {
            engine.add_provider(provider);
        }
        engine
    }

    /// Claimer with the manifest's providers and object tree.
    pub fn claimer(&self) -> Result<JobClaimer> {
        let Some(manifest) = &self.manifest else {
            return Err(HelpfulError::no_manifest().into());
        };
        let mut claimer = JobClaimer::new(self.db.clone(), self.config.claim.clone())
            .with_tree(Arc::new(manifest.tree.clone()));
        for provider in manifest.providers(&self.db) {
            claimer = claimer.with_provider(provider);
        }
        Ok(claimer)
    }

    /// Claimer without content access; enough for ack and fail.
    pub fn bare_claimer(&self) -> JobClaimer {
        JobClaimer::new(self.db.clone(), self.config.claim.clone())
    }
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    if !path.exists() {
        warn!(path = %path.display(), "Manifest not found");
        return Err(HelpfulError::new(format!("Manifest not found: {}", path.display()))
            .with_context("The content snapshot given by --manifest or manifest_path does not exist")
            .with_suggestions([format!("TRY: Check the path: ls -la {}", path.display())])
            .into());
    }
    let manifest = Manifest::load(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    debug!(path = %path.display(), kinds = manifest.kinds.len(), "Manifest loaded");
    Ok(manifest)
}
