//! The owning registry of projects and clients, and the loop that drives it.
//!
//! One [`Hub`] runs on a dedicated blocking thread. Filesystem watchers and
//! HTTP handlers never touch it directly: they send a [`HubMessage`] and,
//! for requests, await the reply on a oneshot channel. Everything queued when
//! the loop wakes up is handled as one batch, so consecutive duplicate watch
//! actions collapse to one.

use std::collections::BTreeMap;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use tidepool_core::{ClientId, LanguageRegistry, PlaceId, ProjectName, SubmitBody, Update};

use crate::client::{Client, ConnectionId, Responder};
use crate::error::SyncError;
use crate::inbound::RemoteEditHandler;
use crate::project::{canonical_root, ConfigEvent, Project, Resync};
use crate::watch::{
    actions_from_event, collapse_consecutive, FsAction, PartitionId, ProjectId, WatchEvent,
    WatchOrigin,
};

pub type HubSender = mpsc::UnboundedSender<HubMessage>;
pub type HubReceiver = mpsc::UnboundedReceiver<HubMessage>;
pub type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

/// The hub's input channel.
pub fn channel() -> (HubSender, HubReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug)]
pub enum HubMessage {
    Watch(WatchEvent),
    Command(HubCommand),
    /// Scheduled by a partition whose files read back empty.
    Reread(Reread),
}

/// Files to read again, and which read this will be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reread {
    pub project: ProjectId,
    pub partition: PartitionId,
    pub paths: Vec<PathBuf>,
    pub attempt: usize,
}

#[derive(Debug)]
pub enum HubCommand {
    /// Register a long-poll response for a client, creating the client if new.
    Connect {
        client: ClientId,
        place: PlaceId,
        responder: Responder,
        reply: Reply<()>,
    },
    /// The HTTP side of a long-poll went away.
    Disconnect {
        client: ClientId,
        connection: ConnectionId,
    },
    Submit {
        client: ClientId,
        place: PlaceId,
        body: SubmitBody,
        reply: Reply<usize>,
    },
    ListProjects {
        place: PlaceId,
        reply: Reply<Vec<ProjectName>>,
    },
    AddProject {
        root: PathBuf,
        reply: Reply<ProjectId>,
    },
    RemoveProject {
        root: PathBuf,
        reply: Reply<bool>,
    },
    Start,
    Stop,
    Shutdown,
}

/// Whether the loop keeps going after a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// One translated watch step; adjacent equal steps are collapsed.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Fs {
        project: ProjectId,
        partition: PartitionId,
        action: FsAction,
    },
    Config {
        project: ProjectId,
        event: ConfigEvent,
    },
    Reread(Reread),
}

pub struct Hub {
    languages: Arc<LanguageRegistry>,
    edits: Arc<dyn RemoteEditHandler>,
    projects: Vec<Project>,
    clients: BTreeMap<ClientId, Client>,
    running: bool,
    next_project: ProjectId,
    sink: HubSender,
}

impl Hub {
    /// A stopped hub with no projects. `sink` must feed the loop that owns it.
    pub fn new(
        languages: LanguageRegistry,
        edits: Arc<dyn RemoteEditHandler>,
        sink: HubSender,
    ) -> Self {
        Self {
            languages: Arc::new(languages),
            edits,
            projects: Vec::new(),
            clients: BTreeMap::new(),
            running: false,
            next_project: 0,
            sink,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn client(&self, id: &ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register a project root. Adding a root twice returns the existing id.
    ///
    /// An invalid or missing config does not fail the call: the project stays
    /// registered and comes alive once its config is fixed.
    pub fn add_project(&mut self, root: &Path) -> Result<ProjectId, SyncError> {
        let root = canonical_root(root)?;
        if let Some(existing) = self.projects.iter().find(|p| p.root() == root) {
            return Ok(existing.id());
        }

        let mut project = Project::new(
            self.next_project,
            &root,
            Arc::clone(&self.languages),
            Arc::clone(&self.edits),
            self.sink.clone(),
        )?;
        self.next_project += 1;
        project.watch_config()?;
        // Failures are logged by reload_config.
        let _ = project.reload_config();

        let id = project.id();
        tracing::info!(root = %root.display(), project = ?project.name().map(ToString::to_string), "added project");
        self.projects.push(project);
        if self.running {
            self.start_project(self.projects.len() - 1);
        }
        Ok(id)
    }

    /// Stop and forget a project root. Returns whether it was registered.
    pub fn remove_project(&mut self, root: &Path) -> bool {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let Some(index) = self.projects.iter().position(|p| p.root() == root) else {
            return false;
        };
        let mut project = self.projects.remove(index);
        project.stop();
        project.unwatch_config();
        if let Some(name) = project.name() {
            for client in self.clients.values_mut() {
                client.forget_project(name);
            }
        }
        tracing::info!(root = %root.display(), "removed project");
        true
    }

    /// Start serving and start every project.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        for index in 0..self.projects.len() {
            self.start_project(index);
        }
        tracing::info!(projects = self.projects.len(), "hub started");
    }

    /// Stop every project and drop every client, ending held responses.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        for project in &mut self.projects {
            project.stop();
        }
        self.clients.clear();
        tracing::info!("hub stopped");
    }

    fn start_project(&mut self, index: usize) {
        let project = &mut self.projects[index];
        if let Err(err) = project.start() {
            tracing::error!(root = %project.root().display(), error = %err, "project failed to start cleanly");
        }
        self.resync(index, &Resync::All);
    }

    fn resync(&mut self, index: usize, resync: &Resync) {
        let project = &self.projects[index];
        if !project.is_running() {
            return;
        }
        for client in self.clients.values_mut() {
            let place = client.place_id();
            let wanted = match resync {
                Resync::None => false,
                Resync::All => true,
                Resync::Only(places) => places.contains(&place),
            };
            if wanted && project.is_authorized(place) {
                project.full_sync(client);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Client requests
    // -----------------------------------------------------------------------

    /// Attach a long-poll response to `id`, creating or re-targeting the client.
    pub fn connect(
        &mut self,
        id: &ClientId,
        place: PlaceId,
        responder: Responder,
    ) -> Result<(), SyncError> {
        self.check_request(place)?;
        let resync = self.ensure_client(id, place);
        if let Some(client) = self.clients.get_mut(id) {
            client.set_connection(responder);
        }
        // After attaching, so the initial payload lands on the new response.
        if resync {
            self.sync_client(id);
        }
        Ok(())
    }

    pub fn disconnect(&mut self, id: &ClientId, connection: ConnectionId) {
        if let Some(client) = self.clients.get_mut(id) {
            if client.disconnect(Some(connection)) {
                tracing::debug!(client = %id, connection, "long-poll released");
            }
        }
    }

    /// Route remote edits to the named project if `place` may touch it.
    pub fn receive_from_remote(
        &mut self,
        id: &ClientId,
        place: PlaceId,
        body: SubmitBody,
    ) -> Result<usize, SyncError> {
        self.check_request(place)?;
        if self.ensure_client(id, place) {
            self.sync_client(id);
        }
        let project = self
            .projects
            .iter()
            .find(|p| p.name() == Some(&body.project_name))
            .ok_or_else(|| SyncError::UnknownProject(body.project_name.clone()))?;
        if !project.is_authorized(place) {
            return Err(SyncError::Unauthorized {
                project: body.project_name,
                place,
            });
        }
        project.receive_from_remote(&body.changes);
        Ok(body.changes.len())
    }

    /// Names of the configured projects `place` is authorized for.
    pub fn list_projects(&self, place: PlaceId) -> Result<Vec<ProjectName>, SyncError> {
        self.check_request(place)?;
        Ok(self
            .projects
            .iter()
            .filter(|p| p.is_authorized(place))
            .filter_map(|p| p.name().cloned())
            .collect())
    }

    fn check_request(&self, place: PlaceId) -> Result<(), SyncError> {
        if !self.running {
            return Err(SyncError::NotRunning);
        }
        if place.0 == 0 {
            return Err(SyncError::InvalidPlaceId(place));
        }
        Ok(())
    }

    /// Create the client or move it to `place`. Returns true when the client
    /// is new or changed place and so is due a full sync.
    fn ensure_client(&mut self, id: &ClientId, place: PlaceId) -> bool {
        match self.clients.get_mut(id) {
            Some(client) if client.place_id() == place => false,
            Some(client) => {
                tracing::info!(client = %id, from = %client.place_id(), to = %place, "client changed place");
                client.set_place_id(place);
                for project in &self.projects {
                    if let Some(name) = project.name() {
                        if !project.is_authorized(place) {
                            client.forget_project(name);
                        }
                    }
                }
                true
            }
            None => {
                tracing::info!(client = %id, place = %place, "new client");
                self.clients
                    .insert(id.clone(), Client::new(id.clone(), place));
                true
            }
        }
    }

    /// Full sync of every running project the client is authorized for.
    fn sync_client(&mut self, id: &ClientId) {
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        let place = client.place_id();
        for project in &self.projects {
            if project.is_running() && project.is_authorized(place) {
                project.full_sync(client);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Handle everything drained in one wake-up, in arrival order.
    pub fn handle_batch(&mut self, batch: Vec<HubMessage>) -> Flow {
        let mut steps = Vec::new();
        for message in batch {
            match message {
                HubMessage::Watch(event) => self.translate(event, &mut steps),
                HubMessage::Reread(reread) => steps.push(Step::Reread(reread)),
                HubMessage::Command(command) => {
                    self.apply_steps(mem::take(&mut steps));
                    if self.handle_command(command) == Flow::Exit {
                        return Flow::Exit;
                    }
                }
            }
        }
        self.apply_steps(steps);
        Flow::Continue
    }

    fn translate(&self, watch: WatchEvent, steps: &mut Vec<Step>) {
        let event = match watch.event {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "watcher event error");
                return;
            }
        };
        match watch.origin {
            WatchOrigin::Partition { project, partition } => {
                steps.extend(actions_from_event(&event).into_iter().map(|action| Step::Fs {
                    project,
                    partition,
                    action,
                }));
            }
            WatchOrigin::Config { project } => {
                if let Some(found) = self.projects.iter().find(|p| p.id() == project) {
                    let event = found.classify_config_event(&event);
                    if event != ConfigEvent::Ignore {
                        steps.push(Step::Config { project, event });
                    }
                }
            }
        }
    }

    fn apply_steps(&mut self, steps: Vec<Step>) {
        for step in collapse_consecutive(steps) {
            match step {
                Step::Fs {
                    project,
                    partition,
                    action,
                } => {
                    let Some(index) = self.project_index(project) else {
                        continue;
                    };
                    let updates = self.projects[index].partition_updates(partition, &action);
                    self.distribute(index, &updates);
                }
                Step::Reread(reread) => {
                    let Some(index) = self.project_index(reread.project) else {
                        continue;
                    };
                    let updates =
                        self.projects[index].reread(reread.partition, &reread.paths, reread.attempt);
                    self.distribute(index, &updates);
                }
                Step::Config { project, event } => {
                    let Some(index) = self.project_index(project) else {
                        continue;
                    };
                    let previous = self.projects[index].name().cloned();
                    match event {
                        ConfigEvent::Reload => {
                            let reloaded = self.projects[index].reload_config();
                            self.drop_stale_queues(index, previous.as_ref());
                            if let Ok(outcome) = reloaded {
                                self.resync(index, &outcome.resync);
                            }
                        }
                        ConfigEvent::RootRemoved => {
                            let project = &mut self.projects[index];
                            tracing::warn!(root = %project.root().display(), "project root removed; project disabled");
                            project.teardown();
                            self.drop_stale_queues(index, previous.as_ref());
                        }
                        ConfigEvent::Ignore => {}
                    }
                }
            }
        }
    }

    fn distribute(&mut self, index: usize, updates: &[Update]) {
        if !updates.is_empty() {
            self.projects[index].distribute(updates, self.clients.values_mut());
        }
    }

    /// After a config change, drop queued updates a client may no longer
    /// receive: the project was renamed or torn down, or the client's place
    /// lost access.
    fn drop_stale_queues(&mut self, index: usize, previous: Option<&ProjectName>) {
        let Some(previous) = previous else {
            return;
        };
        let project = &self.projects[index];
        let renamed = project.name() != Some(previous);
        for client in self.clients.values_mut() {
            if renamed || !project.is_authorized(client.place_id()) {
                client.forget_project(previous);
            }
        }
    }

    fn project_index(&self, id: ProjectId) -> Option<usize> {
        self.projects.iter().position(|p| p.id() == id)
    }

    fn handle_command(&mut self, command: HubCommand) -> Flow {
        match command {
            HubCommand::Connect {
                client,
                place,
                responder,
                reply,
            } => {
                let _ = reply.send(self.connect(&client, place, responder));
            }
            HubCommand::Disconnect { client, connection } => self.disconnect(&client, connection),
            HubCommand::Submit {
                client,
                place,
                body,
                reply,
            } => {
                let _ = reply.send(self.receive_from_remote(&client, place, body));
            }
            HubCommand::ListProjects { place, reply } => {
                let _ = reply.send(self.list_projects(place));
            }
            HubCommand::AddProject { root, reply } => {
                let _ = reply.send(self.add_project(&root));
            }
            HubCommand::RemoveProject { root, reply } => {
                let _ = reply.send(Ok(self.remove_project(&root)));
            }
            HubCommand::Start => self.start(),
            HubCommand::Stop => self.stop(),
            HubCommand::Shutdown => return Flow::Exit,
        }
        Flow::Continue
    }
}

/// Drive `hub` until a shutdown command arrives or every sender is gone.
pub fn run_loop(mut hub: Hub, mut rx: HubReceiver) {
    while let Some(first) = rx.blocking_recv() {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }
        if hub.handle_batch(batch) == Flow::Exit {
            break;
        }
    }
    hub.stop();
    tracing::debug!("hub loop exited");
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable async front end for a hub running in [`run_loop`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: HubSender,
}

impl HubHandle {
    pub fn new(tx: HubSender) -> Self {
        Self { tx }
    }

    pub fn sender(&self) -> &HubSender {
        &self.tx
    }

    fn send(&self, command: HubCommand) -> Result<(), SyncError> {
        self.tx
            .send(HubMessage::Command(command))
            .map_err(|_| SyncError::HubClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> HubCommand,
    ) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| SyncError::HubClosed)?
    }

    pub async fn connect(
        &self,
        client: ClientId,
        place: PlaceId,
        responder: Responder,
    ) -> Result<(), SyncError> {
        self.request(|reply| HubCommand::Connect {
            client,
            place,
            responder,
            reply,
        })
        .await
    }

    /// Fire-and-forget; safe to call from `Drop`.
    pub fn disconnect(&self, client: ClientId, connection: ConnectionId) {
        let _ = self.send(HubCommand::Disconnect { client, connection });
    }

    pub async fn submit(
        &self,
        client: ClientId,
        place: PlaceId,
        body: SubmitBody,
    ) -> Result<usize, SyncError> {
        self.request(|reply| HubCommand::Submit {
            client,
            place,
            body,
            reply,
        })
        .await
    }

    pub async fn list_projects(&self, place: PlaceId) -> Result<Vec<ProjectName>, SyncError> {
        self.request(|reply| HubCommand::ListProjects { place, reply })
            .await
    }

    pub async fn add_project(&self, root: PathBuf) -> Result<ProjectId, SyncError> {
        self.request(|reply| HubCommand::AddProject { root, reply })
            .await
    }

    pub async fn remove_project(&self, root: PathBuf) -> Result<bool, SyncError> {
        self.request(|reply| HubCommand::RemoveProject { root, reply })
            .await
    }

    pub fn start(&self) -> Result<(), SyncError> {
        self.send(HubCommand::Start)
    }

    pub fn stop(&self) -> Result<(), SyncError> {
        self.send(HubCommand::Stop)
    }

    pub fn shutdown(&self) -> Result<(), SyncError> {
        self.send(HubCommand::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::LogRemoteEdits;
    use notify::event::{CreateKind, DataChange, ModifyKind};
    use notify::{Event, EventKind};
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tidepool_core::{AssetKind, AssetPath, ProjectPayload, Update};
    use tokio::sync::oneshot::error::TryRecvError;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        hub: Hub,
        rx: HubReceiver,
    }

    fn fixture(config: &str) -> Fixture {
        let dir = TempDir::new().expect("dir");
        let root = dir.path().canonicalize().expect("canon");
        fs::create_dir_all(root.join("src")).expect("mkdir");
        fs::write(root.join("tidepool.json"), config).expect("config");
        let (tx, rx) = channel();
        let hub = Hub::new(LanguageRegistry::with_defaults(), Arc::new(LogRemoteEdits), tx);
        Fixture {
            _dir: dir,
            root,
            hub,
            rx,
        }
    }

    fn connect(hub: &mut Hub, id: &str, place: u64, conn: ConnectionId) -> oneshot::Receiver<Vec<ProjectPayload>> {
        let (responder, rx) = Responder::channel(conn);
        hub.connect(&ClientId::from(id), PlaceId(place), responder)
            .expect("connect");
        rx
    }

    fn partition_event(hub: &Hub, kind: EventKind, path: &Path) -> HubMessage {
        let project = &hub.projects()[0];
        HubMessage::Watch(WatchEvent {
            origin: WatchOrigin::Partition {
                project: project.id(),
                partition: project.partitions()[0].id(),
            },
            event: Ok(Event::new(kind).add_path(path.to_path_buf())),
        })
    }

    fn config_event(hub: &Hub, path: &Path) -> HubMessage {
        HubMessage::Watch(WatchEvent {
            origin: WatchOrigin::Config {
                project: hub.projects()[0].id(),
            },
            event: Ok(Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
                .add_path(path.to_path_buf())),
        })
    }

    #[test]
    fn requests_while_stopped_are_rejected() {
        let mut fx = fixture(r#"{ "name": "p", "allowAnyPlaceId": true }"#);
        let (responder, _rx) = Responder::channel(1);
        let err = fx
            .hub
            .connect(&ClientId::from("c"), PlaceId(1), responder)
            .unwrap_err();
        assert!(matches!(err, SyncError::NotRunning));
        assert!(matches!(fx.hub.list_projects(PlaceId(1)), Err(SyncError::NotRunning)));
    }

    #[test]
    fn place_id_zero_is_rejected() {
        let mut fx = fixture(r#"{ "name": "p", "allowAnyPlaceId": true }"#);
        fx.hub.start();
        let (responder, _rx) = Responder::channel(1);
        let err = fx
            .hub
            .connect(&ClientId::from("c"), PlaceId(0), responder)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPlaceId(PlaceId(0))));
    }

    #[test]
    fn adding_the_same_root_twice_is_a_noop() {
        let mut fx = fixture(r#"{ "name": "p", "allowAnyPlaceId": true }"#);
        let first = fx.hub.add_project(&fx.root).expect("add");
        let second = fx.hub.add_project(&fx.root).expect("add again");
        assert_eq!(first, second);
        assert_eq!(fx.hub.projects().len(), 1);
        assert!(fx.hub.remove_project(&fx.root));
        assert!(fx.hub.projects().is_empty());
    }

    #[test]
    fn new_client_gets_initial_sync() {
        let mut fx = fixture(r#"{ "name": "p", "allowAnyPlaceId": true }"#);
        fs::write(fx.root.join("src/a.server.lua"), "a").expect("write");
        fx.hub.add_project(&fx.root).expect("add");
        fx.hub.start();

        let mut rx = connect(&mut fx.hub, "c", 5, 1);
        let payload = rx.try_recv().expect("payload");
        assert_eq!(payload.len(), 1);
        assert!(payload[0].initial);
        assert_eq!(
            payload[0].changes,
            vec![Update::change(AssetPath::from_iter(["a"]), AssetKind::ServerExecutable, "a")]
        );

        // Nothing pending on the next poll.
        let mut second = connect(&mut fx.hub, "c", 5, 2);
        assert!(matches!(second.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn live_change_completes_waiting_poll() {
        let mut fx = fixture(r#"{ "name": "p", "allowAnyPlaceId": true }"#);
        fx.hub.add_project(&fx.root).expect("add");
        fx.hub.start();

        let mut first = connect(&mut fx.hub, "c", 5, 1);
        assert!(first.try_recv().expect("initial")[0].initial);
        let mut rx = connect(&mut fx.hub, "c", 5, 2);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let file = fx.root.join("src/new.lua");
        fs::write(&file, "hello").expect("write");
        let event = partition_event(&fx.hub, EventKind::Create(CreateKind::File), &file);
        assert_eq!(fx.hub.handle_batch(vec![event]), Flow::Continue);

        let payload = rx.try_recv().expect("payload");
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0].project_name, ProjectName::from("p"));
        assert!(!payload[0].initial);
        assert_eq!(
            payload[0].changes,
            vec![Update::change(AssetPath::from_iter(["new"]), AssetKind::Module, "hello")]
        );
    }

    #[test]
    fn overwrites_before_registration_coalesce() {
        let mut fx = fixture(r#"{ "name": "p", "allowAnyPlaceId": true }"#);
        fx.hub.add_project(&fx.root).expect("add");
        fx.hub.start();
        let mut first = connect(&mut fx.hub, "c", 5, 1);
        first.try_recv().expect("initial");

        let file = fx.root.join("src/a.lua");
        let modify = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        fs::write(&file, "first").expect("write");
        let one = partition_event(&fx.hub, modify, &file);
        fx.hub.handle_batch(vec![one]);
        fs::write(&file, "second").expect("write");
        let two = partition_event(&fx.hub, modify, &file);
        fx.hub.handle_batch(vec![two]);

        let queue = fx
            .hub
            .client(&ClientId::from("c"))
            .and_then(|c| c.queue(&ProjectName::from("p")))
            .expect("queue");
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.get("a/Module").and_then(|u| u.source.as_deref()),
            Some("second")
        );
    }

    #[test]
    fn revoked_place_stops_receiving_updates() {
        let mut fx = fixture(r#"{ "name": "p", "placeIds": [1, 2] }"#);
        fx.hub.add_project(&fx.root).expect("add");
        fx.hub.start();
        connect(&mut fx.hub, "one", 1, 1).try_recv().expect("initial");
        connect(&mut fx.hub, "two", 2, 2).try_recv().expect("initial");

        fs::write(fx.root.join("tidepool.json"), r#"{ "name": "p", "placeIds": [1] }"#)
            .expect("rewrite");
        let reload = config_event(&fx.hub, &fx.root.join("tidepool.json"));
        fx.hub.handle_batch(vec![reload]);

        let file = fx.root.join("src/a.lua");
        fs::write(&file, "x").expect("write");
        let event = partition_event(&fx.hub, EventKind::Create(CreateKind::File), &file);
        fx.hub.handle_batch(vec![event]);

        let name = ProjectName::from("p");
        let one = fx.hub.client(&ClientId::from("one")).expect("one");
        let two = fx.hub.client(&ClientId::from("two")).expect("two");
        assert_eq!(one.queue(&name).map(|q| q.len()), Some(1));
        assert!(two.queue(&name).is_none());
    }

    #[test]
    fn revocation_drops_updates_already_queued() {
        let mut fx = fixture(r#"{ "name": "p", "placeIds": [1, 2] }"#);
        fx.hub.add_project(&fx.root).expect("add");
        fx.hub.start();
        connect(&mut fx.hub, "two", 2, 1).try_recv().expect("initial");

        // Queued while no poll is attached.
        let file = fx.root.join("src/secret.lua");
        fs::write(&file, "secret").expect("write");
        let event = partition_event(&fx.hub, EventKind::Create(CreateKind::File), &file);
        fx.hub.handle_batch(vec![event]);
        let name = ProjectName::from("p");
        let two = fx.hub.client(&ClientId::from("two")).expect("two");
        assert!(two.queue(&name).expect("queue").is_pending());

        fs::write(fx.root.join("tidepool.json"), r#"{ "name": "p", "placeIds": [1] }"#)
            .expect("rewrite");
        let reload = config_event(&fx.hub, &fx.root.join("tidepool.json"));
        fx.hub.handle_batch(vec![reload]);

        let mut next = connect(&mut fx.hub, "two", 2, 2);
        assert!(matches!(next.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn moving_to_an_unauthorized_place_drops_queued_updates() {
        let mut fx = fixture(r#"{ "name": "p", "placeIds": [1] }"#);
        fx.hub.add_project(&fx.root).expect("add");
        fx.hub.start();
        connect(&mut fx.hub, "c", 1, 1).try_recv().expect("initial");

        let file = fx.root.join("src/secret.lua");
        fs::write(&file, "secret").expect("write");
        let event = partition_event(&fx.hub, EventKind::Create(CreateKind::File), &file);
        fx.hub.handle_batch(vec![event]);

        let mut moved = connect(&mut fx.hub, "c", 3, 2);
        assert!(matches!(moved.try_recv(), Err(TryRecvError::Empty)));
        let client = fx.hub.client(&ClientId::from("c")).expect("client");
        assert!(client.queue(&ProjectName::from("p")).is_none());
    }

    #[test]
    fn renamed_project_drops_queue_under_old_name() {
        let mut fx = fixture(r#"{ "name": "p", "allowAnyPlaceId": true }"#);
        fx.hub.add_project(&fx.root).expect("add");
        fx.hub.start();
        connect(&mut fx.hub, "c", 1, 1).try_recv().expect("initial");

        let file = fx.root.join("src/a.lua");
        fs::write(&file, "a").expect("write");
        let event = partition_event(&fx.hub, EventKind::Create(CreateKind::File), &file);
        fx.hub.handle_batch(vec![event]);

        fs::write(fx.root.join("tidepool.json"), r#"{ "name": "q", "allowAnyPlaceId": true }"#)
            .expect("rewrite");
        let reload = config_event(&fx.hub, &fx.root.join("tidepool.json"));
        fx.hub.handle_batch(vec![reload]);

        let payload = connect(&mut fx.hub, "c", 1, 2).try_recv().expect("payload");
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0].project_name, ProjectName::from("q"));
        assert!(payload[0].initial);
    }

    #[test]
    fn empty_file_is_reported_after_reread() {
        let mut fx = fixture(r#"{ "name": "p", "allowAnyPlaceId": true }"#);
        fx.hub.add_project(&fx.root).expect("add");
        fx.hub.start();
        connect(&mut fx.hub, "c", 1, 1).try_recv().expect("initial");
        let mut waiting = connect(&mut fx.hub, "c", 1, 2);

        let file = fx.root.join("src/late.lua");
        fs::write(&file, "").expect("write");
        let event = partition_event(&fx.hub, EventKind::Create(CreateKind::File), &file);
        fx.hub.handle_batch(vec![event]);
        assert!(matches!(waiting.try_recv(), Err(TryRecvError::Empty)));

        fs::write(&file, "late").expect("fill");
        let reread = loop {
            match fx.rx.blocking_recv() {
                Some(HubMessage::Reread(reread)) => break reread,
                Some(_) => continue,
                None => panic!("hub channel closed"),
            }
        };
        fx.hub.handle_batch(vec![HubMessage::Reread(reread)]);

        let payload = waiting.try_recv().expect("payload");
        assert!(payload[0]
            .changes
            .contains(&Update::change(AssetPath::from_iter(["late"]), AssetKind::Module, "late")));
    }

    #[test]
    fn granted_place_gets_full_sync() {
        let mut fx = fixture(r#"{ "name": "p", "placeIds": [1] }"#);
        fs::write(fx.root.join("src/a.lua"), "a").expect("write");
        fx.hub.add_project(&fx.root).expect("add");
        fx.hub.start();
        connect(&mut fx.hub, "one", 1, 1).try_recv().expect("initial");
        let mut waiting = connect(&mut fx.hub, "two", 2, 2);
        assert!(matches!(waiting.try_recv(), Err(TryRecvError::Empty)));

        fs::write(fx.root.join("tidepool.json"), r#"{ "name": "p", "placeIds": [1, 2] }"#)
            .expect("rewrite");
        let reload = config_event(&fx.hub, &fx.root.join("tidepool.json"));
        fx.hub.handle_batch(vec![reload]);

        let payload = waiting.try_recv().expect("payload");
        assert!(payload[0].initial);
        assert_eq!(payload[0].changes.len(), 1);
        // The already-authorized client is not resynced.
        let one = fx.hub.client(&ClientId::from("one")).expect("one");
        assert!(!one.queue(&ProjectName::from("p")).expect("queue").is_pending());
    }

    #[test]
    fn client_changing_place_is_resynced() {
        let mut fx = fixture(r#"{ "name": "p", "placeIds": [2] }"#);
        fx.hub.add_project(&fx.root).expect("add");
        fx.hub.start();
        let mut rx = connect(&mut fx.hub, "c", 1, 1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let mut moved = connect(&mut fx.hub, "c", 2, 2);
        let payload = moved.try_recv().expect("payload");
        assert!(payload[0].initial);
        assert_eq!(fx.hub.client(&ClientId::from("c")).map(Client::place_id), Some(PlaceId(2)));
    }

    #[test]
    fn submission_checks_project_and_authorization() {
        struct Recorder(Mutex<Vec<usize>>);
        impl RemoteEditHandler for Recorder {
            fn handle(&self, _: &ProjectName, _: &Path, changes: &[Update]) {
                if let Ok(mut seen) = self.0.lock() {
                    seen.push(changes.len());
                }
            }
        }

        let fx = fixture(r#"{ "name": "p", "placeIds": [1] }"#);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let (tx, _rx) = channel();
        let mut hub = Hub::new(LanguageRegistry::with_defaults(), recorder.clone(), tx);
        hub.add_project(&fx.root).expect("add");
        hub.start();

        let body = |name: &str| SubmitBody {
            project_name: ProjectName::from(name),
            changes: vec![Update::remove(AssetPath::from_iter(["a"]), AssetKind::Module)],
        };
        let client = ClientId::from("c");
        assert_eq!(hub.receive_from_remote(&client, PlaceId(1), body("p")).expect("submit"), 1);
        assert!(matches!(
            hub.receive_from_remote(&client, PlaceId(1), body("q")),
            Err(SyncError::UnknownProject(_))
        ));
        assert!(matches!(
            hub.receive_from_remote(&ClientId::from("d"), PlaceId(3), body("p")),
            Err(SyncError::Unauthorized { .. })
        ));
        assert_eq!(*recorder.0.lock().expect("lock"), vec![1]);
    }

    #[test]
    fn invalid_config_removes_project_until_fixed() {
        let mut fx = fixture(r#"{ "name": "p", "allowAnyPlaceId": true }"#);
        fx.hub.add_project(&fx.root).expect("add");
        fx.hub.start();
        assert_eq!(fx.hub.list_projects(PlaceId(1)).expect("list"), vec![ProjectName::from("p")]);

        let config = fx.root.join("tidepool.json");
        fs::write(&config, "{ not json").expect("break");
        let event = config_event(&fx.hub, &config);
        fx.hub.handle_batch(vec![event]);
        assert!(fx.hub.list_projects(PlaceId(1)).expect("list").is_empty());

        fs::write(&config, r#"{ "name": "p2", "allowAnyPlaceId": true }"#).expect("fix");
        let event = config_event(&fx.hub, &config);
        fx.hub.handle_batch(vec![event]);
        assert_eq!(fx.hub.list_projects(PlaceId(1)).expect("list"), vec![ProjectName::from("p2")]);
    }

    #[test]
    fn stop_drops_clients_and_ends_polls() {
        let mut fx = fixture(r#"{ "name": "p", "allowAnyPlaceId": true }"#);
        fx.hub.add_project(&fx.root).expect("add");
        fx.hub.start();
        connect(&mut fx.hub, "c", 1, 1).try_recv().expect("initial");
        let mut waiting = connect(&mut fx.hub, "c", 1, 2);

        assert_eq!(fx.hub.handle_batch(vec![HubMessage::Command(HubCommand::Stop)]), Flow::Continue);
        assert!(matches!(waiting.try_recv(), Err(TryRecvError::Closed)));
        assert!(fx.hub.client(&ClientId::from("c")).is_none());
        assert_eq!(
            fx.hub.handle_batch(vec![HubMessage::Command(HubCommand::Shutdown)]),
            Flow::Exit
        );
    }
}
