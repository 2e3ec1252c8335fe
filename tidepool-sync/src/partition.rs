//! A watched directory (or single file) mapped under a remote target prefix.

use std::collections::BTreeSet;
use std::fs;
use std::ops::Bound;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};

use tidepool_core::{AssetKind, AssetPath, LanguageRegistry, ProjectName, Update};

use crate::error::{io_err, SyncError};
use crate::hub::{HubMessage, HubSender, Reread};
use crate::watch::{
    send_after, spawn_watcher, FsAction, FsActionKind, PartitionId, ProjectId, WatchOrigin,
};

/// Base name of a file that stands for its containing directory node.
pub const INIT_NAME: &str = "init";

/// Reads made of a freshly written file that comes back empty. Later reads
/// are scheduled through the hub rather than slept on.
pub const EMPTY_READ_ATTEMPTS: usize = 3;
pub const EMPTY_READ_DELAY: Duration = Duration::from_millis(30);

/// The triple that decides whether a partition survives a config reload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionIdentity {
    pub name: String,
    /// Canonical path of the partition directory or file.
    pub directory: PathBuf,
    pub target: String,
}

pub struct Partition {
    id: PartitionId,
    project: ProjectId,
    project_name: ProjectName,
    identity: PartitionIdentity,
    prefix: AssetPath,
    single_file: bool,
    languages: Arc<LanguageRegistry>,
    sink: HubSender,
    watcher: Option<RecommendedWatcher>,
    /// Mapped files believed present, so removing a directory can remove
    /// what was under it.
    known: BTreeSet<PathBuf>,
}

impl Partition {
    pub fn new(
        id: PartitionId,
        project: ProjectId,
        project_name: ProjectName,
        identity: PartitionIdentity,
        languages: Arc<LanguageRegistry>,
        sink: HubSender,
    ) -> Self {
        let single_file = identity.directory.is_file();
        let prefix = AssetPath::from_target(&identity.target);
        Self {
            id,
            project,
            project_name,
            identity,
            prefix,
            single_file,
            languages,
            sink,
            watcher: None,
            known: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn identity(&self) -> &PartitionIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn directory(&self) -> &Path {
        &self.identity.directory
    }

    pub(crate) fn set_project_name(&mut self, name: ProjectName) {
        self.project_name = name;
    }

    pub fn is_single_file(&self) -> bool {
        self.single_file
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Install the filesystem watch. Calling it again while running is a no-op.
    ///
    /// A single-file partition watches its parent directory non-recursively and
    /// filters events down to the file.
    pub fn start(&mut self) -> Result<(), SyncError> {
        if self.watcher.is_some() {
            return Ok(());
        }
        let (path, mode) = if self.single_file {
            let parent = self
                .identity
                .directory
                .parent()
                .unwrap_or(&self.identity.directory);
            (parent.to_path_buf(), RecursiveMode::NonRecursive)
        } else {
            (self.identity.directory.clone(), RecursiveMode::Recursive)
        };
        let origin = WatchOrigin::Partition {
            project: self.project,
            partition: self.id,
        };
        self.watcher = Some(spawn_watcher(&path, mode, origin, &self.sink)?);
        self.known = match self.mapped_files() {
            Ok(files) => files.into_iter().collect(),
            Err(err) => {
                tracing::warn!(path = %self.identity.directory.display(), error = %err, "failed to index partition");
                BTreeSet::new()
            }
        };
        tracing::info!(
            project = %self.project_name,
            partition = %self.identity.name,
            path = %self.identity.directory.display(),
            "watching partition"
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        self.known.clear();
        if self.watcher.take().is_some() {
            tracing::info!(
                project = %self.project_name,
                partition = %self.identity.name,
                "stopped watching partition"
            );
        }
    }

    /// Map a file to its asset path and kind.
    ///
    /// Returns `None` for paths outside the partition and for ignored files.
    pub fn asset_for(&self, path: &Path) -> Option<(AssetPath, AssetKind)> {
        if self.languages.ignore(path) {
            return None;
        }
        let file_name = path.file_name()?.to_string_lossy();
        let (name, kind) = split_file_name(&file_name);

        let mut asset = self.prefix.clone();
        if self.single_file {
            return (path == self.identity.directory).then_some((asset, kind));
        }

        let relative = path.strip_prefix(&self.identity.directory).ok()?;
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        if let Some(parent) = relative.parent() {
            for component in parent.components() {
                asset.push(component.as_os_str().to_string_lossy());
            }
        }
        if name != INIT_NAME {
            asset.push(name);
        }
        Some((asset, kind))
    }

    /// One Change per non-ignored file currently present. No empty-read retry.
    pub fn snapshot(&self) -> Result<Vec<Update>, SyncError> {
        Ok(self
            .mapped_files()?
            .iter()
            .filter_map(|path| {
                let (asset, kind) = self.asset_for(path)?;
                Some(Update::change(asset, kind, self.load(path)))
            })
            .collect())
    }

    /// Mapped files currently believed present.
    pub fn known_files(&self) -> impl Iterator<Item = &Path> {
        self.known.iter().map(PathBuf::as_path)
    }

    /// Turn one live filesystem action into the updates it implies.
    ///
    /// Files that read back empty are not reported yet; they are re-read
    /// after [`EMPTY_READ_DELAY`] via a [`Reread`] message.
    pub fn updates_for_action(&mut self, action: &FsAction) -> Vec<Update> {
        if self.single_file && action.path != self.identity.directory {
            return Vec::new();
        }
        match action.kind {
            FsActionKind::Changed if action.path.is_dir() => self.changes_under(&action.path),
            FsActionKind::Changed if action.path.exists() => {
                let path = action.path.clone();
                self.read_changes(vec![path], 0)
            }
            // Gone before we got to it.
            FsActionKind::Changed | FsActionKind::Removed => self.removals(&action.path),
        }
    }

    /// Read again files that came back empty on attempt `attempt - 1`.
    pub fn reread(&mut self, paths: &[PathBuf], attempt: usize) -> Vec<Update> {
        // Anything deleted meanwhile was reported by its own removal.
        let present = paths.iter().filter(|p| p.is_file()).cloned().collect();
        self.read_changes(present, attempt)
    }

    fn changes_under(&mut self, dir: &Path) -> Vec<Update> {
        if !dir.starts_with(&self.identity.directory) {
            return Vec::new();
        }
        match walk_files(dir) {
            Ok(files) => self.read_changes(files, 0),
            Err(err) => {
                tracing::warn!(path = %dir.display(), error = %err, "failed to enumerate directory");
                Vec::new()
            }
        }
    }

    fn read_changes(&mut self, files: Vec<PathBuf>, attempt: usize) -> Vec<Update> {
        let mut updates = Vec::new();
        let mut empty = Vec::new();
        for path in files {
            let Some((asset, kind)) = self.asset_for(&path) else {
                continue;
            };
            let text = self.load(&path);
            self.known.insert(path.clone());
            if text.is_empty() && attempt + 1 < EMPTY_READ_ATTEMPTS {
                empty.push(path);
            } else {
                updates.push(Update::change(asset, kind, text));
            }
        }
        if !empty.is_empty() {
            let retry = Reread {
                project: self.project,
                partition: self.id,
                paths: empty,
                attempt: attempt + 1,
            };
            send_after(&self.sink, EMPTY_READ_DELAY, HubMessage::Reread(retry));
        }
        updates
    }

    /// Removals for `path` and, when it was a directory, every known file
    /// beneath it.
    fn removals(&mut self, path: &Path) -> Vec<Update> {
        let gone = self.known_under(path);
        if gone.is_empty() {
            return self
                .asset_for(path)
                .map(|(asset, kind)| Update::remove(asset, kind))
                .into_iter()
                .collect();
        }
        let mut updates = Vec::new();
        for file in gone {
            self.known.remove(&file);
            if let Some((asset, kind)) = self.asset_for(&file) {
                updates.push(Update::remove(asset, kind));
            }
        }
        updates
    }

    /// Known files equal to or beneath `path`. Paths order component-wise, so
    /// a directory's descendants sort directly after it.
    fn known_under(&self, path: &Path) -> Vec<PathBuf> {
        self.known
            .range::<Path, _>((Bound::Included(path), Bound::Unbounded))
            .take_while(|known| known.starts_with(path))
            .cloned()
            .collect()
    }

    fn mapped_files(&self) -> Result<Vec<PathBuf>, SyncError> {
        let files = if self.single_file {
            if self.identity.directory.is_file() {
                vec![self.identity.directory.clone()]
            } else {
                Vec::new()
            }
        } else {
            walk_files(&self.identity.directory)?
        };
        Ok(files
            .into_iter()
            .filter(|path| self.asset_for(path).is_some())
            .collect())
    }

    fn load(&self, path: &Path) -> String {
        match self.languages.load(path) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "loader failed; using empty source");
                String::new()
            }
        }
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("single_file", &self.single_file)
            .field("running", &self.is_running())
            .finish()
    }
}

/// `a.server.lua` → (`a`, ServerExecutable); `a.spec.lua` → (`a.spec`, Module).
fn split_file_name(file_name: &str) -> (&str, AssetKind) {
    let stem = match file_name.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => file_name,
    };
    if let Some((name, token)) = stem.rsplit_once('.') {
        if let Some(kind) = AssetKind::from_sub_extension(token) {
            return (name, kind);
        }
    }
    (stem, AssetKind::Module)
}

/// Every regular file beneath `root`, sorted. Symlinked directories are not
/// followed; directories that vanish mid-walk are skipped.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut dirs = vec![root.to_path_buf()];
    let mut files = Vec::new();
    let mut cursor = 0;
    while cursor < dirs.len() {
        let current = dirs[cursor].clone();
        cursor += 1;
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    continue;
                }
                return Err(io_err(&current, err));
            }
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&current, e))?;
            let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
            if ty.is_dir() {
                dirs.push(entry.path());
            } else if ty.is_file() || (ty.is_symlink() && entry.path().is_file()) {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}
