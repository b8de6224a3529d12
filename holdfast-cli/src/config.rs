use anyhow::{bail, Context, Result};
use holdfast_sync::{HoldfastConfig, RetentionPolicy, RetentionUnit, Target};
use std::path::{Path, PathBuf};

/// Configuration file plus the path it was read from
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub path: PathBuf,
    pub config: HoldfastConfig,
}

impl LoadedConfig {
    /// Load `path`, or the default location when none is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => get_config_path()?,
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = HoldfastConfig::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if config.engine.database_path.is_relative() {
            if let Some(dir) = path.parent() {
                config.engine.database_path = dir.join(&config.engine.database_path);
            }
        }
        Ok(Self { path, config })
    }

    pub fn target(&self, target_id: &str) -> Result<&Target> {
        match self.config.target(target_id) {
            Some(target) => Ok(target),
            None => bail!(
                "No target named {:?} in {} (known: {})",
                target_id,
                self.path.display(),
                self.config
                    .targets
                    .iter()
                    .map(|t| t.target_id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

/// Write a starter configuration, refusing to overwrite
pub fn write_example(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("Config file already exists: {}", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }

    let mut target = Target::new("example", "db1.example.net:rpool/data", "tank/backup/db1/data")
        .context("Failed to build example target")?;
    target.recursive = true;
    target.policy.retention = RetentionPolicy::default().with(RetentionUnit::Hourly, 24);
    target.enabled = false;

    let config = HoldfastConfig {
        engine: Default::default(),
        targets: vec![target],
    };
    let content = toml::to_string_pretty(&config).context("Failed to serialize config to TOML")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(())
}

/// Get the path to the config file
pub fn get_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home.join(".holdfast").join("config.toml"))
}
