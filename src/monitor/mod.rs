//! Config directory hot-reload.
//!
//! Started only when the initial load produced no usable default network.
//! Each create or data-write event in the directory triggers a resync;
//! the task stops once a default network is resolvable, on a watcher-level
//! error, or when the manager is dropped.

use notify::event::{EventKind, ModifyKind};
use notify::{RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Weak;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::manager::PluginManager;

/// Renames, removals, and metadata changes never make a config usable, so
/// only creations and data writes trigger a resync.
fn is_config_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    )
}

/// Watch `conf_dir` until the manager has a resolvable default network.
/// Shares only the registry lock with foreground readers; callers observe
/// its effects through subsequent registry reads.
pub(crate) async fn monitor_conf_dir(plugin: Weak<PluginManager>, conf_dir: PathBuf) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = match notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        let _ = tx.send(event);
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            error!("could not create new watcher {}", e);
            return;
        }
    };
    if let Err(e) = watcher.watch(&conf_dir, RecursiveMode::NonRecursive) {
        error!("could not watch {}: {}", conf_dir.display(), e);
        return;
    }

    // Files created between manager construction and the watch
    // registration above produced no event; reconcile once before
    // draining events.
    match plugin.upgrade() {
        None => return,
        Some(plugin) => match plugin.resync().await {
            Ok(()) => {
                if plugin.default_network().await.is_some() {
                    info!("Found CNI default network; stop watching");
                    return;
                }
            }
            Err(e) => debug!("CNI config not yet usable: {}", e),
        },
    }

    while let Some(event) = rx.recv().await {
        match event {
            Ok(event) => {
                debug!("CNI monitoring event {:?}", event);
                if !is_config_event(&event.kind) {
                    continue;
                }
                let Some(plugin) = plugin.upgrade() else {
                    debug!("plugin manager dropped; stop watching");
                    return;
                };
                if let Err(e) = plugin.resync().await {
                    error!("CNI config loading failed, continue monitoring: {}", e);
                    continue;
                }
                if plugin.default_network().await.is_some() {
                    info!("Found CNI default network; stop watching");
                    return;
                }
            }
            Err(e) => {
                error!("CNI monitoring error {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};

    #[test]
    fn creations_and_writes_qualify() {
        assert!(is_config_event(&EventKind::Create(CreateKind::File)));
        assert!(is_config_event(&EventKind::Modify(ModifyKind::Data(
            DataChange::Any
        ))));
        assert!(is_config_event(&EventKind::Modify(ModifyKind::Any)));
    }

    #[test]
    fn renames_removals_and_metadata_are_ignored() {
        assert!(!is_config_event(&EventKind::Remove(RemoveKind::File)));
        assert!(!is_config_event(&EventKind::Modify(ModifyKind::Name(
            RenameMode::Any
        ))));
        assert!(!is_config_event(&EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Any
        ))));
        assert!(!is_config_event(&EventKind::Access(
            notify::event::AccessKind::Any
        )));
    }
}
