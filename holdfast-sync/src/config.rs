//! Engine and target configuration
//!
//! Targets are owned by a [`ConfigStore`]; the engine only reads them. The
//! file-backed store re-reads its TOML file on every query so edits take
//! effect at the next dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{Result, SyncError};
use crate::naming::{SnapshotNaming, DEFAULT_PREFIX};
use crate::policy::TargetPolicy;
use crate::snapshot::{DatasetPair, Endpoint};

/// Default ZFS user property carrying the owner tag
pub const DEFAULT_OWNER_PROPERTY: &str = "holdfast:owner";

/// Which transport moves a target's data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Snapshot stream piped through a remote shell
    RemoteShell,
    /// Snapshot send/receive on this machine
    Native,
    /// Bulk copy from object storage, snapshotted locally
    ObjectStorage,
    /// Arbitrary external command
    Exec,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::RemoteShell => "remote-shell",
            TransportKind::Native => "native",
            TransportKind::ObjectStorage => "object-storage",
            TransportKind::Exec => "exec",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    #[default]
    None,
    /// Replicate encrypted datasets without ever loading their keys
    Raw,
}

/// A configured pairing of remote dataset, local replica and policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub target_id: String,
    /// `host:pool/dataset`, or `pool/dataset` for a dataset on this machine
    pub remote: Endpoint,
    pub local: Endpoint,
    #[serde(default)]
    pub policy: TargetPolicy,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub encryption: EncryptionMode,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Tag distinguishing this target's snapshots from co-located ones
    #[serde(default)]
    pub owner_tag: Option<String>,
    /// Program and arguments for the exec transport
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Source URL for the object-storage transport
    #[serde(default)]
    pub source_url: Option<String>,
}

fn default_transport() -> TransportKind {
    TransportKind::RemoteShell
}

fn default_enabled() -> bool {
    true
}

impl Target {
    pub fn new(target_id: impl Into<String>, remote: &str, local: &str) -> Result<Self> {
        Ok(Self {
            target_id: target_id.into(),
            remote: remote.parse()?,
            local: local.parse()?,
            policy: TargetPolicy::default(),
            transport: default_transport(),
            recursive: false,
            encryption: EncryptionMode::None,
            compressed: false,
            enabled: true,
            owner_tag: None,
            command: None,
            source_url: None,
        })
    }

    pub fn root_pair(&self) -> DatasetPair {
        DatasetPair::new(self.remote.clone(), self.local.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_id.trim().is_empty() {
            return Err(SyncError::Config("target_id must not be empty".to_string()));
        }
        if self.local.host.is_some() {
            return Err(SyncError::Config(format!(
                "{}: local dataset must be on this machine, got {}",
                self.target_id, self.local
            )));
        }
        self.policy.validate()?;

        match self.transport {
            TransportKind::Exec if self.command.as_ref().map_or(true, Vec::is_empty) => {
                Err(SyncError::Config(format!(
                    "{}: exec transport requires a command",
                    self.target_id
                )))
            }
            TransportKind::ObjectStorage if self.source_url.is_none() => Err(SyncError::Config(
                format!("{}: object-storage transport requires source_url", self.target_id),
            )),
            TransportKind::Native if self.remote.host.is_some() => Err(SyncError::Config(format!(
                "{}: native transport cannot reach {}",
                self.target_id, self.remote
            ))),
            _ => Ok(()),
        }
    }
}

/// Engine-wide settings, the `[engine]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub snapshot_prefix: String,
    pub owner_property: String,
    pub control_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub stale_lock_timeout_secs: u64,
    pub persistent_failure_threshold: u32,
    pub max_concurrent_runs: usize,
    /// Finished runs averaged for duration estimates
    pub duration_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("holdfast.db"),
            snapshot_prefix: DEFAULT_PREFIX.to_string(),
            owner_property: DEFAULT_OWNER_PROPERTY.to_string(),
            control_timeout_secs: 120,
            heartbeat_interval_secs: 30,
            stale_lock_timeout_secs: 600,
            persistent_failure_threshold: 3,
            max_concurrent_runs: 4,
            duration_window: 10,
        }
    }
}

impl EngineConfig {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_lock_timeout_secs)
    }

    pub fn naming(&self) -> Result<SnapshotNaming> {
        SnapshotNaming::new(&self.snapshot_prefix)
    }

    pub fn validate(&self) -> Result<()> {
        self.naming()?;
        if self.control_timeout_secs == 0 {
            return Err(SyncError::Config("control_timeout_secs must be positive".into()));
        }
        if self.heartbeat_interval_secs == 0
            || self.heartbeat_interval_secs >= self.stale_lock_timeout_secs
        {
            return Err(SyncError::Config(
                "heartbeat_interval_secs must be positive and below stale_lock_timeout_secs".into(),
            ));
        }
        if self.max_concurrent_runs == 0 {
            return Err(SyncError::Config("max_concurrent_runs must be positive".into()));
        }
        if self.persistent_failure_threshold == 0 {
            return Err(SyncError::Config(
                "persistent_failure_threshold must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Contents of a holdfast TOML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HoldfastConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub targets: Vec<Target>,
}

impl HoldfastConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: HoldfastConfig =
            toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        let mut ids = HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !ids.insert(target.target_id.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate target_id {}",
                    target.target_id
                )));
            }
        }
        Ok(())
    }

    pub fn target(&self, target_id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.target_id == target_id)
    }
}

/// Read-only view of configured targets
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<Target>>;

    async fn get_policy(&self, target_id: &str) -> Result<TargetPolicy>;

    async fn get_target(&self, target_id: &str) -> Result<Target> {
        self.list_targets()
            .await?
            .into_iter()
            .find(|t| t.target_id == target_id)
            .ok_or_else(|| SyncError::Config(format!("unknown target {}", target_id)))
    }
}

/// Targets fixed at construction
#[derive(Debug, Clone, Default)]
pub struct StaticConfigStore {
    targets: Vec<Target>,
}

impl StaticConfigStore {
    pub fn new(targets: Vec<Target>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl ConfigStore for StaticConfigStore {
    async fn list_targets(&self) -> Result<Vec<Target>> {
        Ok(self.targets.clone())
    }

    async fn get_policy(&self, target_id: &str) -> Result<TargetPolicy> {
        Ok(self.get_target(target_id).await?.policy)
    }
}

/// Targets read from a TOML file on every query
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<HoldfastConfig> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        HoldfastConfig::from_toml_str(&content)
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn list_targets(&self) -> Result<Vec<Target>> {
        Ok(self.read().await?.targets)
    }

    async fn get_policy(&self, target_id: &str) -> Result<TargetPolicy> {
        Ok(self.get_target(target_id).await?.policy)
    }
}
