//! # tidepool-sync
//!
//! The synchronization engine: partitions watch local trees and turn file
//! events into asset updates, projects own partitions and hot-apply their
//! config, clients coalesce outbound updates behind a long-poll, and the
//! [`Hub`] owns all of it on a single event loop.

pub mod client;
pub mod error;
pub mod hub;
pub mod inbound;
pub mod partition;
pub mod project;
pub mod watch;

pub use client::{Client, ConnectionId, ProjectQueue, Responder};
pub use error::SyncError;
pub use hub::{run_loop, Hub, HubCommand, HubHandle, HubMessage, HubReceiver, HubSender, Reread};
pub use inbound::{LogRemoteEdits, RemoteEditHandler};
pub use partition::{walk_files, Partition, PartitionIdentity};
pub use project::{ConfigOutcome, Project, ProjectSettings, Resync};
pub use watch::{FsAction, FsActionKind, WatchEvent, WatchOrigin};
