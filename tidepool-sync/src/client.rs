//! Per-connection outbound queues and the held long-poll response.

use std::collections::BTreeMap;

use tokio::sync::oneshot;

use tidepool_core::{ClientId, PlaceId, ProjectName, ProjectPayload, Update};

/// Identifies one HTTP request holding a long-poll slot.
pub type ConnectionId = u64;

/// The write half of a held long-poll request.
///
/// Sending consumes the responder: a served response cannot be reused.
/// Dropping it ends the request with no body.
#[derive(Debug)]
pub struct Responder {
    id: ConnectionId,
    tx: oneshot::Sender<Vec<ProjectPayload>>,
}

impl Responder {
    pub fn new(id: ConnectionId, tx: oneshot::Sender<Vec<ProjectPayload>>) -> Self {
        Self { id, tx }
    }

    /// A responder plus the receiving end the HTTP handler awaits.
    pub fn channel(id: ConnectionId) -> (Self, oneshot::Receiver<Vec<ProjectPayload>>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(id, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// True once the peer has stopped waiting.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(self, payload: Vec<ProjectPayload>) -> Result<(), Vec<ProjectPayload>> {
        self.tx.send(payload)
    }
}

/// Pending updates for one project, keyed by coalescing key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProjectQueue {
    changes: BTreeMap<String, Update>,
    initial: bool,
}

impl ProjectQueue {
    /// Last write wins per coalescing key.
    pub fn insert(&mut self, update: Update) {
        self.changes.insert(update.coalescing_key(), update);
    }

    pub fn mark_initial(&mut self) {
        self.initial = true;
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn is_initial(&self) -> bool {
        self.initial
    }

    pub fn get(&self, key: &str) -> Option<&Update> {
        self.changes.get(key)
    }

    /// Something to deliver: changes, or a bare initial marker.
    pub fn is_pending(&self) -> bool {
        self.initial || !self.changes.is_empty()
    }

    pub fn drain(&mut self) -> (Vec<Update>, bool) {
        let changes = std::mem::take(&mut self.changes).into_values().collect();
        (changes, std::mem::take(&mut self.initial))
    }

    /// Put back updates that could not be delivered. Entries queued since the
    /// drain are newer and win.
    pub fn restore(&mut self, changes: Vec<Update>, initial: bool) {
        for update in changes {
            self.changes.entry(update.coalescing_key()).or_insert(update);
        }
        self.initial |= initial;
    }
}

/// One remote identity and everything queued for it.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    place: PlaceId,
    queues: BTreeMap<ProjectName, ProjectQueue>,
    response: Option<Responder>,
}

impl Client {
    pub fn new(id: ClientId, place: PlaceId) -> Self {
        Self {
            id,
            place,
            queues: BTreeMap::new(),
            response: None,
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn place_id(&self) -> PlaceId {
        self.place
    }

    pub fn set_place_id(&mut self, place: PlaceId) {
        self.place = place;
    }

    pub fn has_connection(&self) -> bool {
        self.response.is_some()
    }

    pub fn queue(&self, project: &ProjectName) -> Option<&ProjectQueue> {
        self.queues.get(project)
    }

    /// Coalesce `updates` into the project's queue, then try to deliver.
    pub fn enqueue(&mut self, project: &ProjectName, updates: impl IntoIterator<Item = Update>) {
        let queue = self.queues.entry(project.clone()).or_default();
        for update in updates {
            queue.insert(update);
        }
        self.flush();
    }

    /// Like [`Client::enqueue`], but the delivered entry carries `initial: true`.
    pub fn enqueue_initial(
        &mut self,
        project: &ProjectName,
        updates: impl IntoIterator<Item = Update>,
    ) {
        self.queues.entry(project.clone()).or_default().mark_initial();
        self.enqueue(project, updates);
    }

    /// Drop everything queued for a project that no longer exists.
    pub fn forget_project(&mut self, project: &ProjectName) {
        self.queues.remove(project);
    }

    /// Deliver every pending queue on the held response, if there is one.
    ///
    /// Returns true when a payload was handed to the peer.
    pub fn flush(&mut self) -> bool {
        let Some(responder) = self.response.take() else {
            return false;
        };
        if responder.is_closed() {
            tracing::debug!(client = %self.id, "long-poll peer went away");
            return false;
        }

        let payload: Vec<ProjectPayload> = self
            .queues
            .iter_mut()
            .filter(|(_, queue)| queue.is_pending())
            .map(|(name, queue)| {
                let (changes, initial) = queue.drain();
                ProjectPayload {
                    project_name: name.clone(),
                    changes,
                    initial,
                }
            })
            .collect();
        if payload.is_empty() {
            self.response = Some(responder);
            return false;
        }

        match responder.send(payload) {
            Ok(()) => true,
            Err(undelivered) => {
                tracing::debug!(client = %self.id, "response lost; requeueing");
                for entry in undelivered {
                    self.queues
                        .entry(entry.project_name)
                        .or_default()
                        .restore(entry.changes, entry.initial);
                }
                false
            }
        }
    }

    /// Hold `responder` as the pending long-poll, ending any previous one.
    pub fn set_connection(&mut self, responder: Responder) {
        self.response = Some(responder);
        self.flush();
    }

    /// End the held response if it is `connection` (or unconditionally for
    /// `None`). Returns whether a response was released.
    pub fn disconnect(&mut self, connection: Option<ConnectionId>) -> bool {
        let matches = match (&self.response, connection) {
            (Some(held), Some(id)) => held.id() == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            self.response = None;
        }
        matches
    }
}
