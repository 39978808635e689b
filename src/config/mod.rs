use crate::core::{self, InitFlags};
use crate::scanner::{DbOptions, Engine, EngineField, FieldValue, ScanOptions, Settings};
use crate::utils::logging::Logger;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub fields: BTreeMap<EngineField, FieldValue>,
    pub scan: ScanOptions,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Falls back to `core::db_dir()` when unset.
    pub dir: Option<PathBuf>,
    pub options: DbOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            fields: BTreeMap::new(),
            scan: ScanOptions::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dir: None,
            options: DbOptions::STDOPT,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "WARN".to_string(),
            file: None,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {:?}", path))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("cannot parse config file {:?}", path))?;
        config.settings()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), anyhow::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).with_context(|| format!("cannot write config file {:?}", path))?;
        Ok(())
    }

    pub fn database_dir(&self) -> PathBuf {
        self.database.dir.clone().unwrap_or_else(core::db_dir)
    }

    /// The configured field overrides as a validated settings snapshot.
    pub fn settings(&self) -> Result<Settings, anyhow::Error> {
        Settings::with_values(self.fields.iter().map(|(f, v)| (*f, v.clone())))
            .context("invalid engine field in configuration")
    }

    pub fn init_logging(&self) -> Result<(), anyhow::Error> {
        Logger::init(Logger::level_filter(&self.logging.level), self.logging.file.clone())
    }

    /// Initializes the library and returns a compiled engine with the
    /// configured fields and database.
    pub fn build_engine(&self) -> Result<Engine, anyhow::Error> {
        core::init(InitFlags::DEFAULT)?;
        let settings = self.settings()?;

        let engine = Engine::new()?;
        let prepared = (|| -> Result<(), anyhow::Error> {
            engine.apply_settings(&settings)?;
            let dir = self.database_dir();
            let loaded = engine
                .load(&dir, self.database.options)
                .with_context(|| format!("cannot load signature database {:?}", dir))?;
            log::info!("engine ready with {} signatures from {:?}", loaded, dir);
            engine.compile()?;
            Ok(())
        })();

        if let Err(e) = prepared {
            engine.free()?;
            return Err(e);
        }
        Ok(engine)
    }
}
