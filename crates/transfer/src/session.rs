use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::split::ChunkRange;

/// Per-file transfer state machine.
///
/// ```text
/// Waiting -> Checking -> FastSuccess                  (terminal)
/// Checking -> Uploading -> Merging -> Success         (terminal)
/// {Checking|Uploading|Merging} -> Error               (terminal)
/// {Checking|Uploading|Merging} -> Cancelled           (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Waiting,
    Checking,
    Uploading,
    Merging,
    /// Artifact already existed; no chunk was transferred.
    FastSuccess,
    Success,
    Error,
    Cancelled,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadState::FastSuccess
                | UploadState::Success
                | UploadState::Error
                | UploadState::Cancelled
        )
    }
}

/// Tracks one file's transfer attempt (thread-safe).
///
/// Ephemeral: lives for the duration of a single upload and is discarded on
/// a terminal state. Terminal states are sticky — once reached, further
/// transitions are ignored so a late chunk confirmation cannot resurrect a
/// cancelled session.
pub struct UploadSession {
    inner: RwLock<SessionInner>,
}

struct SessionInner {
    id: String,
    file_path: PathBuf,
    artifact_name: String,
    fingerprint: String,
    ranges: Vec<ChunkRange>,
    confirmed: HashSet<u32>,
    state: UploadState,
    location: Option<String>,
    error: String,
}

impl UploadSession {
    /// Creates a new session in the `Waiting` state.
    pub fn new(id: String, file_path: PathBuf, artifact_name: String) -> Self {
        Self {
            inner: RwLock::new(SessionInner {
                id,
                file_path,
                artifact_name,
                fingerprint: String::new(),
                ranges: Vec::new(),
                confirmed: HashSet::new(),
                state: UploadState::Waiting,
                location: None,
                error: String::new(),
            }),
        }
    }

    /// Enters `Checking` with the computed content fingerprint.
    pub fn begin_check(&self, fingerprint: String) {
        let mut s = self.inner.write().unwrap();
        if s.state.is_terminal() {
            return;
        }
        s.fingerprint = fingerprint;
        s.state = UploadState::Checking;
    }

    /// Records the chunk plan and which indices the server already holds,
    /// then enters `Uploading`.
    pub fn begin_upload(&self, ranges: Vec<ChunkRange>, already_stored: &HashSet<u32>) {
        let mut s = self.inner.write().unwrap();
        if s.state.is_terminal() {
            return;
        }
        s.confirmed = ranges
            .iter()
            .map(|r| r.index)
            .filter(|i| already_stored.contains(i))
            .collect();
        s.ranges = ranges;
        s.state = UploadState::Uploading;
    }

    /// Marks one chunk as confirmed stored by the server.
    pub fn confirm_chunk(&self, index: u32) {
        let mut s = self.inner.write().unwrap();
        if s.state.is_terminal() {
            return;
        }
        s.confirmed.insert(index);
    }

    pub fn begin_merge(&self) {
        let mut s = self.inner.write().unwrap();
        if s.state.is_terminal() {
            return;
        }
        s.state = UploadState::Merging;
    }

    /// Terminal: artifact already existed, nothing was transferred.
    pub fn fast_complete(&self, location: String) {
        let mut s = self.inner.write().unwrap();
        if s.state.is_terminal() {
            return;
        }
        s.location = Some(location);
        s.state = UploadState::FastSuccess;
    }

    /// Terminal: merge finished, artifact is visible.
    pub fn complete(&self, location: String) {
        let mut s = self.inner.write().unwrap();
        if s.state.is_terminal() {
            return;
        }
        s.location = Some(location);
        s.state = UploadState::Success;
    }

    /// Terminal: unrecoverable failure.
    pub fn fail(&self, err: &str) {
        let mut s = self.inner.write().unwrap();
        if s.state.is_terminal() {
            return;
        }
        s.error = err.to_string();
        s.state = UploadState::Error;
    }

    /// Terminal: cancelled cooperatively.
    pub fn cancel(&self) {
        let mut s = self.inner.write().unwrap();
        if s.state.is_terminal() {
            return;
        }
        s.state = UploadState::Cancelled;
    }

    /// Overall percentage, weighted by chunk count.
    pub fn progress(&self) -> f64 {
        let s = self.inner.read().unwrap();
        match s.state {
            UploadState::Waiting | UploadState::Checking => 0.0,
            UploadState::FastSuccess | UploadState::Success => 100.0,
            _ => {
                if s.ranges.is_empty() {
                    // Zero-chunk (empty) file: merging is all there is.
                    if s.state == UploadState::Merging { 100.0 } else { 0.0 }
                } else {
                    s.confirmed.len() as f64 / s.ranges.len() as f64 * 100.0
                }
            }
        }
    }

    /// Ranges not yet confirmed stored, in index order.
    pub fn pending_ranges(&self) -> Vec<ChunkRange> {
        let s = self.inner.read().unwrap();
        s.ranges
            .iter()
            .filter(|r| !s.confirmed.contains(&r.index))
            .copied()
            .collect()
    }

    pub fn state(&self) -> UploadState {
        self.inner.read().unwrap().state
    }

    pub fn id(&self) -> String {
        self.inner.read().unwrap().id.clone()
    }

    pub fn file_path(&self) -> PathBuf {
        self.inner.read().unwrap().file_path.clone()
    }

    pub fn artifact_name(&self) -> String {
        self.inner.read().unwrap().artifact_name.clone()
    }

    pub fn fingerprint(&self) -> String {
        self.inner.read().unwrap().fingerprint.clone()
    }

    pub fn total_chunks(&self) -> u32 {
        self.inner.read().unwrap().ranges.len() as u32
    }

    pub fn confirmed_count(&self) -> u32 {
        self.inner.read().unwrap().confirmed.len() as u32
    }

    pub fn location(&self) -> Option<String> {
        self.inner.read().unwrap().location.clone()
    }

    pub fn error(&self) -> String {
        self.inner.read().unwrap().error.clone()
    }
}
