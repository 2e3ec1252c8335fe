//! A configured project root: its partitions, policy and config hot-reload.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode};

use tidepool_core::config::{self, config_path_at};
use tidepool_core::{
    AuthorizationPolicy, ConfigError, LanguageRegistry, PlaceId, ProjectConfig, ProjectName,
    Update,
};

use crate::client::Client;
use crate::error::{io_err, SyncError};
use crate::hub::HubSender;
use crate::inbound::RemoteEditHandler;
use crate::partition::{Partition, PartitionIdentity};
use crate::watch::{actions_from_event, spawn_watcher, FsAction, PartitionId, ProjectId, WatchOrigin};

/// The validated, non-partition half of a project's config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSettings {
    pub name: ProjectName,
    pub policy: AuthorizationPolicy,
}

/// Which clients need a full resync after a config change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resync {
    None,
    /// Every authorized client.
    All,
    /// Only clients attached to these (newly authorized) place ids.
    Only(BTreeSet<PlaceId>),
}

/// What applying a config revision did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOutcome {
    pub revision: u64,
    pub kept: usize,
    pub added: usize,
    pub removed: usize,
    pub resync: Resync,
}

/// How a project reacts to an event from its config watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEvent {
    Reload,
    RootRemoved,
    Ignore,
}

pub struct Project {
    id: ProjectId,
    root: PathBuf,
    config_path: PathBuf,
    settings: Option<ProjectSettings>,
    partitions: Vec<Partition>,
    running: bool,
    revision: u64,
    next_partition: PartitionId,
    config_watcher: Option<RecommendedWatcher>,
    languages: Arc<LanguageRegistry>,
    edits: Arc<dyn RemoteEditHandler>,
    sink: HubSender,
}

impl Project {
    /// Create an unconfigured project over `root`. The root must exist.
    pub fn new(
        id: ProjectId,
        root: &Path,
        languages: Arc<LanguageRegistry>,
        edits: Arc<dyn RemoteEditHandler>,
        sink: HubSender,
    ) -> Result<Self, SyncError> {
        let root = canonical_root(root)?;
        Ok(Self {
            id,
            config_path: config_path_at(&root),
            root,
            settings: None,
            partitions: Vec::new(),
            running: false,
            revision: 0,
            next_partition: 0,
            config_watcher: None,
            languages,
            edits,
            sink,
        })
    }

    pub fn id(&self) -> ProjectId {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `None` while the config is missing or invalid.
    pub fn settings(&self) -> Option<&ProjectSettings> {
        self.settings.as_ref()
    }

    pub fn name(&self) -> Option<&ProjectName> {
        self.settings.as_ref().map(|s| &s.name)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Watch the root (non-recursively) for config edits and root removal.
    pub fn watch_config(&mut self) -> Result<(), SyncError> {
        if self.config_watcher.is_none() {
            let origin = WatchOrigin::Config { project: self.id };
            self.config_watcher = Some(spawn_watcher(
                &self.root,
                RecursiveMode::NonRecursive,
                origin,
                &self.sink,
            )?);
        }
        Ok(())
    }

    pub fn unwatch_config(&mut self) {
        self.config_watcher = None;
    }

    /// Re-read `tidepool.json`. A missing or invalid file tears the project down.
    pub fn reload_config(&mut self) -> Result<ConfigOutcome, SyncError> {
        match config::load_at(&self.root) {
            Ok(config) => {
                for key in &config.ignored_keys {
                    tracing::warn!(path = %self.config_path.display(), key = %key, "unknown config key ignored");
                }
                Ok(self.apply_config(config))
            }
            Err(err) => {
                match &err {
                    ConfigError::NotFound { .. } => {
                        tracing::warn!(path = %self.config_path.display(), "config missing; project disabled")
                    }
                    other => {
                        tracing::warn!(path = %self.config_path.display(), error = %other, "config rejected; project disabled")
                    }
                }
                self.teardown();
                Err(err.into())
            }
        }
    }

    /// Diff the configured partitions against the live ones by identity.
    ///
    /// Unchanged partitions keep running untouched; changed ones are stopped
    /// and replaced. New partitions start if the project is running.
    pub fn apply_config(&mut self, config: ProjectConfig) -> ConfigOutcome {
        let mut wanted: Vec<PartitionIdentity> = Vec::new();
        for spec in &config.partitions {
            let path = spec.resolve(&self.root);
            match path.canonicalize() {
                Ok(directory) => wanted.push(PartitionIdentity {
                    name: spec.name.clone(),
                    directory,
                    target: spec.target.clone(),
                }),
                Err(_) => tracing::warn!(
                    project = %config.name,
                    partition = %spec.name,
                    path = %path.display(),
                    "partition path does not exist; skipping"
                ),
            }
        }

        let mut removed = 0;
        self.partitions.retain_mut(|partition| {
            let keep = wanted.contains(partition.identity());
            if !keep {
                partition.stop();
                removed += 1;
            }
            keep
        });
        let kept = self.partitions.len();
        for partition in &mut self.partitions {
            partition.set_project_name(config.name.clone());
        }

        let mut added = 0;
        for identity in wanted {
            if self.partitions.iter().any(|p| *p.identity() == identity) {
                continue;
            }
            let mut partition = Partition::new(
                self.next_partition,
                self.id,
                config.name.clone(),
                identity,
                Arc::clone(&self.languages),
                self.sink.clone(),
            );
            self.next_partition += 1;
            if self.running {
                if let Err(err) = partition.start() {
                    tracing::error!(project = %config.name, partition = %partition.name(), error = %err, "failed to watch partition");
                }
            }
            self.partitions.push(partition);
            added += 1;
        }

        let resync = match self.settings.take() {
            None => Resync::All,
            Some(previous) if previous.name != config.name || added > 0 || removed > 0 => {
                Resync::All
            }
            Some(previous) => policy_resync(&previous.policy, &config.policy),
        };

        self.revision += 1;
        tracing::info!(
            project = %config.name,
            revision = self.revision,
            kept,
            added,
            removed,
            policy = %config.policy,
            "applied config"
        );
        self.settings = Some(ProjectSettings {
            name: config.name,
            policy: config.policy,
        });

        ConfigOutcome {
            revision: self.revision,
            kept,
            added,
            removed,
            resync,
        }
    }

    /// Stop and drop every partition and forget the settings. The project stays
    /// registered so a corrected config can bring it back.
    pub fn teardown(&mut self) {
        for partition in &mut self.partitions {
            partition.stop();
        }
        self.partitions.clear();
        self.settings = None;
    }

    pub fn is_authorized(&self, place: PlaceId) -> bool {
        self.settings
            .as_ref()
            .map(|s| s.policy.is_authorized(place))
            .unwrap_or(false)
    }

    /// Start every partition watch. All partitions are attempted; the first
    /// failure is returned.
    pub fn start(&mut self) -> Result<(), SyncError> {
        self.running = true;
        let mut first_error = None;
        for partition in &mut self.partitions {
            if let Err(err) = partition.start() {
                tracing::error!(partition = %partition.name(), error = %err, "failed to watch partition");
                first_error.get_or_insert(err);
            }
        }
        if let Some(name) = self.name() {
            tracing::info!(project = %name, partitions = self.partitions.len(), "project started");
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn stop(&mut self) {
        self.running = false;
        for partition in &mut self.partitions {
            partition.stop();
        }
        if let Some(name) = self.name() {
            tracing::info!(project = %name, "project stopped");
        }
    }

    /// Changes for every file in every partition.
    pub fn snapshot(&self) -> Vec<Update> {
        let mut updates = Vec::new();
        for partition in &self.partitions {
            match partition.snapshot() {
                Ok(mut changes) => updates.append(&mut changes),
                Err(err) => {
                    tracing::warn!(partition = %partition.name(), error = %err, "snapshot failed")
                }
            }
        }
        updates
    }

    /// Queue the whole project for `client`, flagged as initial.
    pub fn full_sync(&self, client: &mut Client) {
        let Some(settings) = &self.settings else {
            return;
        };
        let updates = self.snapshot();
        tracing::info!(
            client = %client.id(),
            project = %settings.name,
            changes = updates.len(),
            "full sync"
        );
        client.enqueue_initial(&settings.name, updates);
    }

    /// Fan `updates` out to every authorized client. Returns how many got them.
    pub fn distribute<'a>(
        &self,
        updates: &[Update],
        clients: impl IntoIterator<Item = &'a mut Client>,
    ) -> usize {
        let Some(settings) = &self.settings else {
            return 0;
        };
        let mut delivered = 0;
        for client in clients {
            if settings.policy.is_authorized(client.place_id()) {
                client.enqueue(&settings.name, updates.iter().cloned());
                delivered += 1;
            }
        }
        delivered
    }

    /// Updates implied by a live action in one of this project's partitions.
    pub fn partition_updates(&mut self, partition: PartitionId, action: &FsAction) -> Vec<Update> {
        self.live_partition(partition)
            .map(|p| p.updates_for_action(action))
            .unwrap_or_default()
    }

    /// Updates from a scheduled re-read of files that came back empty.
    pub fn reread(&mut self, partition: PartitionId, paths: &[PathBuf], attempt: usize) -> Vec<Update> {
        self.live_partition(partition)
            .map(|p| p.reread(paths, attempt))
            .unwrap_or_default()
    }

    fn live_partition(&mut self, partition: PartitionId) -> Option<&mut Partition> {
        if !self.running || self.settings.is_none() {
            return None;
        }
        self.partitions
            .iter_mut()
            .find(|p| p.id() == partition && p.is_running())
    }

    /// Hand remote-originated edits to the inbound hook.
    pub fn receive_from_remote(&self, changes: &[Update]) {
        if let Some(name) = self.name() {
            self.edits.handle(name, &self.root, changes);
        }
    }

    /// Decide what an event from the root watch means for this project.
    pub fn classify_config_event(&self, event: &Event) -> ConfigEvent {
        let root_gone = matches!(event.kind, EventKind::Remove(_))
            && event.paths.iter().any(|p| p == &self.root);
        if root_gone || !self.root.exists() {
            return ConfigEvent::RootRemoved;
        }
        if actions_from_event(event)
            .iter()
            .any(|action| action.path == self.config_path)
        {
            ConfigEvent::Reload
        } else {
            ConfigEvent::Ignore
        }
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("settings", &self.settings)
            .field("partitions", &self.partitions)
            .field("running", &self.running)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

/// Resync needed when only the authorization policy changed.
pub fn policy_resync(previous: &AuthorizationPolicy, next: &AuthorizationPolicy) -> Resync {
    match (previous, next) {
        (AuthorizationPolicy::ExplicitIds(old), AuthorizationPolicy::ExplicitIds(new)) => {
            let granted: BTreeSet<PlaceId> = new.difference(old).copied().collect();
            if granted.is_empty() {
                Resync::None
            } else {
                Resync::Only(granted)
            }
        }
        (old, new) if old.same_kind(new) => Resync::None,
        _ => Resync::All,
    }
}

pub(crate) fn canonical_root(root: &Path) -> Result<PathBuf, SyncError> {
    root.canonicalize().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            SyncError::MissingRoot {
                path: root.to_path_buf(),
            }
        } else {
            io_err(root, err)
        }
    })
}
