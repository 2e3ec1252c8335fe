//! Translation of raw notify events into per-path filesystem actions.
//!
//! Every watcher (partition trees and project config files) forwards its raw
//! events into the hub channel tagged with a [`WatchOrigin`]. The hub drains
//! whatever is queued as one batch, translates it with [`actions_from_event`]
//! and collapses consecutive duplicates with [`collapse_consecutive`].

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::SyncError;
use crate::hub::{HubMessage, HubSender};

pub type ProjectId = u64;
pub type PartitionId = u64;

/// Which watcher produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOrigin {
    Partition {
        project: ProjectId,
        partition: PartitionId,
    },
    Config {
        project: ProjectId,
    },
}

/// A raw notify event tagged with its origin.
#[derive(Debug)]
pub struct WatchEvent {
    pub origin: WatchOrigin,
    pub event: notify::Result<Event>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsActionKind {
    /// Created or modified; the path should be (re)read.
    Changed,
    Removed,
}

/// One (action, path) pair extracted from a notify event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsAction {
    pub kind: FsActionKind,
    pub path: PathBuf,
}

impl FsAction {
    pub fn changed(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsActionKind::Changed,
            path: path.into(),
        }
    }

    pub fn removed(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsActionKind::Removed,
            path: path.into(),
        }
    }
}

/// Split a notify event into actions.
///
/// Renames are decomposed into `Removed(old)` + `Changed(new)`. Backends that
/// report only one side of a rename (`RenameMode::Any`) are resolved by
/// checking whether the path still exists.
pub fn actions_from_event(event: &Event) -> Vec<FsAction> {
    match &event.kind {
        EventKind::Create(_) => event.paths.iter().map(FsAction::changed).collect(),
        EventKind::Remove(_) => event.paths.iter().map(FsAction::removed).collect(),
        // mtime/atime/chmod noise
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if event.paths.len() >= 2 => vec![
                FsAction::removed(&event.paths[0]),
                FsAction::changed(&event.paths[1]),
            ],
            RenameMode::From => event.paths.iter().map(FsAction::removed).collect(),
            RenameMode::To => event.paths.iter().map(FsAction::changed).collect(),
            _ => event.paths.iter().map(|path| by_existence(path)).collect(),
        },
        EventKind::Modify(_) => event.paths.iter().map(FsAction::changed).collect(),
        _ => Vec::new(),
    }
}

fn by_existence(path: &Path) -> FsAction {
    if path.exists() {
        FsAction::changed(path)
    } else {
        FsAction::removed(path)
    }
}

/// Drop consecutive duplicates; non-adjacent repeats are kept.
pub fn collapse_consecutive<T: PartialEq>(mut items: Vec<T>) -> Vec<T> {
    items.dedup();
    items
}

/// Install a watcher that forwards every event for `path` into the hub.
pub(crate) fn spawn_watcher(
    path: &Path,
    mode: RecursiveMode,
    origin: WatchOrigin,
    sink: &HubSender,
) -> Result<RecommendedWatcher, SyncError> {
    let sink = sink.clone();
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = sink.send(HubMessage::Watch(WatchEvent { origin, event }));
    })?;
    watcher.watch(path, mode)?;
    Ok(watcher)
}

/// Deliver `message` to the hub after `delay` without blocking the caller.
///
/// Uses the ambient tokio runtime when there is one (the daemon runs the hub
/// under `spawn_blocking`), otherwise a short-lived thread.
pub(crate) fn send_after(sink: &HubSender, delay: Duration, message: HubMessage) {
    let sink = sink.clone();
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = sink.send(message);
            });
        }
        Err(_) => {
            thread::spawn(move || {
                thread::sleep(delay);
                let _ = sink.send(message);
            });
        }
    }
}
