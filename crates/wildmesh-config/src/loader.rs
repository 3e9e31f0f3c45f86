use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::schema::WildmeshConfig;
use wildmesh_core::MeshError;

/// Loads the wildmesh configuration from disk and the environment.
pub struct ConfigLoader {
    config: WildmeshConfig,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > WILDMESH_CONFIG env > ~/.wildmesh/wildmesh.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("WILDMESH_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".wildmesh")
            .join("wildmesh.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> wildmesh_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            Self::parse(&raw, &config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            WildmeshConfig::default()
        };

        let config = Self::apply_overrides(config, |key| std::env::var(key).ok());
        Self::check(&config)?;

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Parse TOML text. `origin` only appears in error messages.
    pub fn parse(raw: &str, origin: &Path) -> wildmesh_core::Result<WildmeshConfig> {
        toml::from_str::<WildmeshConfig>(raw).map_err(|e| {
            MeshError::Config(format!("failed to parse {}: {}", origin.display(), e))
        })
    }

    /// Validate config: log warnings, fail on errors.
    pub fn check(config: &WildmeshConfig) -> wildmesh_core::Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(MeshError::Config(e)),
        }
    }

    /// Get a snapshot of the loaded config.
    pub fn get(&self) -> WildmeshConfig {
        self.config.clone()
    }

    /// Path the config was resolved from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply overrides (WILDMESH_NODE_ID, WILDMESH_LOG_LEVEL, WILDMESH_MAX_RETRIES).
    /// `lookup` is `std::env::var` in production.
    pub fn apply_overrides<F>(mut config: WildmeshConfig, lookup: F) -> WildmeshConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WILDMESH_NODE_ID") {
            match v.parse::<wildmesh_core::NodeId>() {
                Ok(id) => config.node.id = id.get(),
                Err(e) => warn!(error = %e, "ignoring WILDMESH_NODE_ID"),
            }
        }
        if let Some(v) = lookup("WILDMESH_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = lookup("WILDMESH_MAX_RETRIES")
            && let Ok(retries) = v.parse::<u32>()
        {
            config.network.max_retries = retries;
        }
        config
    }
}
