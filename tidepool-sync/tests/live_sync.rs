//! End-to-end: a hub on its own thread, real filesystem watches, and the
//! async handle used by the HTTP layer.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tidepool_core::{
    AssetKind, AssetPath, ClientId, LanguageRegistry, PlaceId, ProjectName, ProjectPayload, Update,
};
use tidepool_sync::{hub, run_loop, Hub, HubHandle, LogRemoteEdits, Responder, SyncError};
use tokio::sync::oneshot;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

struct Running {
    _dir: TempDir,
    root: PathBuf,
    handle: HubHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        let _ = self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn running_hub(config: &str) -> Running {
    let dir = TempDir::new().expect("dir");
    let root = dir.path().canonicalize().expect("canon");
    fs::create_dir_all(root.join("src/sub")).expect("mkdir");
    fs::write(root.join("src/a.server.lua"), "print('a')").expect("write");
    fs::write(root.join("src/sub/b.lua"), "return {}").expect("write");
    fs::write(root.join("tidepool.json"), config).expect("config");

    let (tx, rx) = hub::channel();
    let hub = Hub::new(LanguageRegistry::with_defaults(), Arc::new(LogRemoteEdits), tx.clone());
    let thread = thread::spawn(move || run_loop(hub, rx));
    let handle = HubHandle::new(tx);
    handle.add_project(root.clone()).await.expect("add project");
    handle.start().expect("start");

    Running {
        _dir: dir,
        root,
        handle,
        thread: Some(thread),
    }
}

async fn poll(
    handle: &HubHandle,
    client: &str,
    place: u64,
    connection: u64,
) -> oneshot::Receiver<Vec<ProjectPayload>> {
    let (responder, rx) = Responder::channel(connection);
    handle
        .connect(ClientId::from(client), PlaceId(place), responder)
        .await
        .expect("connect");
    rx
}

#[tokio::test]
async fn full_sync_then_live_change() {
    let hub = running_hub(r#"{ "name": "p", "allowAnyPlaceId": true }"#).await;

    let initial = timeout(WAIT, poll(&hub.handle, "c", 42, 1).await)
        .await
        .expect("initial in time")
        .expect("initial payload");
    assert_eq!(initial.len(), 1);
    assert!(initial[0].initial);
    let mut changes = initial[0].changes.clone();
    changes.sort_by_key(Update::coalescing_key);
    assert_eq!(
        changes,
        vec![
            Update::change(AssetPath::from_iter(["a"]), AssetKind::ServerExecutable, "print('a')"),
            Update::change(AssetPath::from_iter(["sub", "b"]), AssetKind::Module, "return {}"),
        ]
    );

    let waiting = poll(&hub.handle, "c", 42, 2).await;

    // Move a finished file in so the first event already sees its content.
    let staged = hub.root.join("staged.tmp");
    fs::write(&staged, "return 42").expect("stage");
    fs::rename(&staged, hub.root.join("src/new.lua")).expect("move in");

    let payload = timeout(WAIT, waiting)
        .await
        .expect("live change in time")
        .expect("live payload");
    assert_eq!(payload.len(), 1);
    assert_eq!(payload[0].project_name, ProjectName::from("p"));
    assert!(!payload[0].initial);
    assert!(payload[0]
        .changes
        .contains(&Update::change(AssetPath::from_iter(["new"]), AssetKind::Module, "return 42")));
}

#[tokio::test]
async fn listing_respects_authorization() {
    let hub = running_hub(r#"{ "name": "p", "placeIds": [7] }"#).await;
    assert_eq!(
        hub.handle.list_projects(PlaceId(7)).await.expect("list"),
        vec![ProjectName::from("p")]
    );
    assert!(hub.handle.list_projects(PlaceId(8)).await.expect("list").is_empty());
    assert!(matches!(
        hub.handle.list_projects(PlaceId(0)).await,
        Err(SyncError::InvalidPlaceId(_))
    ));
}

#[tokio::test]
async fn missing_root_is_reported() {
    let hub = running_hub(r#"{ "name": "p", "allowAnyPlaceId": true }"#).await;
    let err = hub
        .handle
        .add_project(hub.root.join("does-not-exist"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::MissingRoot { .. }), "got: {err}");
}

/// Poll until every update in `expected` has been delivered.
async fn collect_until(hub: &Running, first_connection: u64, expected: &[Update]) -> Vec<Update> {
    let mut seen: Vec<Update> = Vec::new();
    let mut connection = first_connection;
    while !expected.iter().all(|update| seen.contains(update)) {
        let payload = timeout(WAIT, poll(&hub.handle, "c", 42, connection).await)
            .await
            .expect("updates in time")
            .expect("payload");
        seen.extend(payload.into_iter().flat_map(|entry| entry.changes));
        connection += 1;
    }
    seen
}

#[tokio::test]
async fn renamed_directory_removes_old_assets() {
    let hub = running_hub(r#"{ "name": "p", "allowAnyPlaceId": true }"#).await;
    timeout(WAIT, poll(&hub.handle, "c", 42, 1).await)
        .await
        .expect("initial in time")
        .expect("initial payload");

    fs::rename(hub.root.join("src/sub"), hub.root.join("src/sub2")).expect("rename");

    let removed = Update::remove(AssetPath::from_iter(["sub", "b"]), AssetKind::Module);
    let added = Update::change(AssetPath::from_iter(["sub2", "b"]), AssetKind::Module, "return {}");
    let seen = collect_until(&hub, 2, &[removed.clone(), added]).await;
    assert!(seen.contains(&removed));
}

#[tokio::test]
async fn directory_moved_out_of_the_tree_is_removed() {
    let hub = running_hub(r#"{ "name": "p", "allowAnyPlaceId": true }"#).await;
    timeout(WAIT, poll(&hub.handle, "c", 42, 1).await)
        .await
        .expect("initial in time")
        .expect("initial payload");

    fs::rename(hub.root.join("src/sub"), hub.root.join("outside")).expect("move out");

    collect_until(
        &hub,
        2,
        &[Update::remove(AssetPath::from_iter(["sub", "b"]), AssetKind::Module)],
    )
    .await;
}
