//! ZFS snapshot store
//!
//! Lists, destroys and rolls back snapshots with the `zfs` tool, locally or
//! on a remote host through [`RemoteShell`]. Listing output is parsed
//! strictly; anything unexpected fails closed as unreachable.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use holdfast_sync::{Endpoint, Result, Side, Snapshot, SnapshotStore, SyncError};
use tracing::{debug, info};

use crate::command::{self, RemoteShell};

/// `zfs` output for a dataset that does not exist yet
const MISSING_DATASET: &str = "dataset does not exist";

#[derive(Debug, Clone)]
pub struct ZfsStore {
    shell: RemoteShell,
    binary: String,
    owner_property: String,
}

impl ZfsStore {
    pub fn new(shell: RemoteShell, owner_property: impl Into<String>) -> Self {
        Self {
            shell,
            binary: "zfs".to_string(),
            owner_property: owner_property.into(),
        }
    }

    /// Use another `zfs` executable
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn shell(&self) -> &RemoteShell {
        &self.shell
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn owner_property(&self) -> &str {
        &self.owner_property
    }

    fn side(endpoint: &Endpoint) -> Side {
        if endpoint.host.is_some() {
            Side::Remote
        } else {
            Side::Local
        }
    }

    fn command(&self, endpoint: &Endpoint, args: &[&str]) -> tokio::process::Command {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.shell.command(endpoint, &self.binary, &args)
    }

    /// Create `name` on a local dataset, tagged with `owner_tag`
    pub async fn create_snapshot(
        &self,
        endpoint: &Endpoint,
        name: &str,
        owner_tag: Option<&str>,
    ) -> Result<()> {
        let full = format!("{}@{}", endpoint.dataset, name);
        let property = owner_tag.map(|tag| format!("{}={}", self.owner_property, tag));
        let mut args = vec!["snapshot"];
        if let Some(property) = &property {
            args.extend(["-o", property.as_str()]);
        }
        args.push(&full);
        command::run_checked(self.command(endpoint, &args), Self::side(endpoint), "zfs snapshot")
            .await?;
        info!("Created snapshot {}", full);
        Ok(())
    }

    /// Create the dataset and any missing parents; existing ones are left alone
    pub async fn ensure_dataset(&self, endpoint: &Endpoint) -> Result<()> {
        command::run_checked(
            self.command(endpoint, &["create", "-p", &endpoint.dataset]),
            Self::side(endpoint),
            "zfs create",
        )
        .await?;
        debug!("Ensured {} exists", endpoint);
        Ok(())
    }

    /// Mountpoint of a filesystem dataset
    pub async fn mountpoint(&self, endpoint: &Endpoint) -> Result<String> {
        let output = command::run_checked(
            self.command(endpoint, &["get", "-H", "-o", "value", "mountpoint", &endpoint.dataset]),
            Self::side(endpoint),
            "zfs get mountpoint",
        )
        .await?;
        let mountpoint = output.stdout.trim();
        if !mountpoint.starts_with('/') {
            return Err(SyncError::unreachable(
                Self::side(endpoint),
                format!("{} is not mounted ({:?})", endpoint, mountpoint),
            ));
        }
        Ok(mountpoint.to_string())
    }
}

/// Parse `zfs list -H -p -o name,creation,<owner>` for `dataset`
pub fn parse_snapshot_listing(dataset: &str, output: &str) -> std::result::Result<Vec<Snapshot>, String> {
    let mut snapshots = Vec::new();
    for (number, line) in output.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let columns: Vec<&str> = line.split('\t').collect();
        let [full_name, creation, owner] = columns.as_slice() else {
            return Err(format!(
                "line {}: expected 3 columns, got {}: {:?}",
                number + 1,
                columns.len(),
                line
            ));
        };
        let (owner_dataset, name) = full_name
            .split_once('@')
            .ok_or_else(|| format!("line {}: {:?} is not a snapshot", number + 1, full_name))?;
        if owner_dataset != dataset {
            return Err(format!(
                "line {}: snapshot {} does not belong to {}",
                number + 1,
                full_name,
                dataset
            ));
        }
        let seconds: i64 = creation
            .parse()
            .map_err(|_| format!("line {}: bad creation time {:?}", number + 1, creation))?;
        let created_at = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| format!("line {}: creation time {} out of range", number + 1, seconds))?;

        let mut snapshot = Snapshot::new(name, created_at);
        if *owner != "-" && !owner.is_empty() {
            snapshot = snapshot.with_owner(*owner);
        }
        snapshots.push(snapshot);
    }
    Ok(snapshots)
}

/// Parse `zfs list -H -o name -r` into datasets strictly below `root`
pub fn parse_children(root: &Endpoint, output: &str) -> std::result::Result<Vec<String>, String> {
    let mut children = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line == root.dataset {
            continue;
        }
        if line.contains('\t') || line.contains('@') || root.relative(line).is_none() {
            return Err(format!("unexpected dataset {:?} below {}", line, root));
        }
        children.push(line.to_string());
    }
    children.sort();
    Ok(children)
}

#[async_trait]
impl SnapshotStore for ZfsStore {
    async fn list_snapshots(&self, endpoint: &Endpoint) -> Result<Vec<Snapshot>> {
        let columns = format!("name,creation,{}", self.owner_property);
        let output = command::run(
            self.command(
                endpoint,
                &["list", "-H", "-p", "-t", "snapshot", "-d", "1", "-o", &columns, &endpoint.dataset],
            ),
            Self::side(endpoint),
            "zfs list",
        )
        .await?;

        if !output.success() {
            if output.stderr.contains(MISSING_DATASET) {
                debug!("{} does not exist yet", endpoint);
                return Ok(Vec::new());
            }
            return Err(SyncError::unreachable(
                Self::side(endpoint),
                format!("listing {}: {}", endpoint, output.summary()),
            ));
        }
        parse_snapshot_listing(&endpoint.dataset, &output.stdout).map_err(|detail| {
            SyncError::unreachable(
                Self::side(endpoint),
                format!("unparseable listing of {}: {}", endpoint, detail),
            )
        })
    }

    async fn list_children(&self, endpoint: &Endpoint) -> Result<Vec<String>> {
        let output = command::run_checked(
            self.command(
                endpoint,
                &["list", "-H", "-o", "name", "-r", "-t", "filesystem,volume", &endpoint.dataset],
            ),
            Self::side(endpoint),
            "zfs list children",
        )
        .await?;
        parse_children(endpoint, &output.stdout)
            .map_err(|detail| SyncError::unreachable(Self::side(endpoint), detail))
    }

    async fn destroy_snapshot(&self, endpoint: &Endpoint, name: &str) -> Result<()> {
        let full = format!("{}@{}", endpoint.dataset, name);
        command::run_checked(
            self.command(endpoint, &["destroy", &full]),
            Self::side(endpoint),
            "zfs destroy",
        )
        .await?;
        Ok(())
    }

    async fn rollback(&self, endpoint: &Endpoint, name: &str) -> Result<()> {
        let full = format!("{}@{}", endpoint.dataset, name);
        command::run_checked(
            self.command(endpoint, &["rollback", &full]),
            Self::side(endpoint),
            "zfs rollback",
        )
        .await?;
        Ok(())
    }
}
