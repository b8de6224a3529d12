//! Snapshot, dataset and endpoint value types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::SyncError;

/// Which copy of a dataset a query is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

/// A dataset, optionally reached through a remote shell
///
/// Parsed from `host:pool/dataset` or `pool/dataset`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    pub host: Option<String>,
    pub dataset: String,
}

impl Endpoint {
    pub fn local(dataset: impl Into<String>) -> Self {
        Self {
            host: None,
            dataset: dataset.into(),
        }
    }

    pub fn remote(host: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            dataset: dataset.into(),
        }
    }

    /// Endpoint of the child dataset `suffix` below this one
    pub fn child(&self, suffix: &str) -> Self {
        Self {
            host: self.host.clone(),
            dataset: format!("{}/{}", self.dataset, suffix),
        }
    }

    /// Path of `child` relative to this endpoint, if it lies below it
    pub fn relative<'a>(&self, child: &'a str) -> Option<&'a str> {
        child
            .strip_prefix(self.dataset.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}:{}", host, self.dataset),
            None => write!(f, "{}", self.dataset),
        }
    }
}

impl FromStr for Endpoint {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, dataset) = match s.split_once(':') {
            Some((host, dataset)) => (Some(host), dataset),
            None => (None, s),
        };
        let bad_dataset = dataset.is_empty()
            || dataset.starts_with('/')
            || dataset.ends_with('/')
            || dataset.contains('@')
            || dataset.contains("//")
            || dataset.chars().any(char::is_whitespace);
        if bad_dataset || host.map_or(false, |h| h.is_empty() || h.contains(char::is_whitespace)) {
            return Err(SyncError::Config(format!("invalid dataset locator: {:?}", s)));
        }
        Ok(Self {
            host: host.map(str::to_string),
            dataset: dataset.to_string(),
        })
    }
}

impl TryFrom<String> for Endpoint {
    type Error = SyncError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

/// A named, immutable point in a dataset's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub owner_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub size_bytes: Option<u64>,
}

impl Snapshot {
    pub fn new(name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            owner_tag: None,
            created_at,
            size_bytes: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner_tag = Some(owner.into());
        self
    }
}

/// One remote dataset and the local dataset it replicates into
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetPair {
    pub remote: Endpoint,
    pub local: Endpoint,
}

impl DatasetPair {
    pub fn new(remote: Endpoint, local: Endpoint) -> Self {
        Self { remote, local }
    }

    pub fn child(&self, suffix: &str) -> Self {
        Self {
            remote: self.remote.child(suffix),
            local: self.local.child(suffix),
        }
    }
}

impl fmt::Display for DatasetPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.remote, self.local)
    }
}
