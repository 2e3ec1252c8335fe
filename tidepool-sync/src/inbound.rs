//! Hook for edits pushed from a remote client back toward a project.

use std::path::Path;

use tidepool_core::{ProjectName, Update};

/// Receives remote-originated edits after authorization has been checked.
pub trait RemoteEditHandler: Send + Sync {
    fn handle(&self, project: &ProjectName, root: &Path, changes: &[Update]);
}

/// Records the edits and leaves the local tree untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRemoteEdits;

impl RemoteEditHandler for LogRemoteEdits {
    fn handle(&self, project: &ProjectName, root: &Path, changes: &[Update]) {
        let removals = changes.iter().filter(|u| u.is_removal()).count();
        tracing::info!(
            project = %project,
            root = %root.display(),
            received = changes.len(),
            removals,
            "received remote edits; write-back is disabled"
        );
    }
}
