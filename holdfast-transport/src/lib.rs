//! Concrete backends for the holdfast engine
//!
//! - [`ZfsStore`]: snapshot listing, destroy and rollback through `zfs`
//! - [`StreamTransport`]: `zfs send | zfs receive`, behind `ssh` or local
//! - [`ExecTransport`]: a configured external program per target
//! - [`ObjectTransport`] and [`ObjectRemoteStore`]: `rclone` bulk copy
//!   snapshotted locally

pub mod command;
pub mod exec;
pub mod object;
pub mod stream;
pub mod zfs;

use std::sync::Arc;

use holdfast_sync::{EngineConfig, Result, Target, TransportKind, TransportRegistry};

pub use command::{CommandOutput, RemoteShell};
pub use exec::ExecTransport;
pub use object::{ObjectRemoteStore, ObjectSource, ObjectTransport};
pub use stream::StreamTransport;
pub use zfs::ZfsStore;

/// Store for the local side and for remote hosts reached over `ssh`
pub fn zfs_store(engine: &EngineConfig) -> ZfsStore {
    ZfsStore::new(RemoteShell::default(), engine.owner_property.clone())
}

/// Every transport kind, configured for `targets`
pub fn registry(engine: &EngineConfig, targets: &[Target]) -> Result<TransportRegistry> {
    let store = zfs_store(engine);
    let stream = Arc::new(StreamTransport::new(store.clone()));

    let mut registry = TransportRegistry::new()
        .with(TransportKind::RemoteShell, stream.clone())
        .with(TransportKind::Native, stream)
        .with(
            TransportKind::Exec,
            Arc::new(ExecTransport::new(targets, store.clone())),
        );
    registry.register_with_remote_store(
        TransportKind::ObjectStorage,
        Arc::new(ObjectTransport::new(targets, store.clone())),
        Arc::new(ObjectRemoteStore::new(targets, store, engine.naming()?)),
    );
    Ok(registry)
}
