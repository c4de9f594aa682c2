//! In-memory object store for tests
//!
//! Behaves like S3 multipart uploads: parts stay invisible until `complete`,
//! which checks part order and tags. Clones share state, so a test can hand
//! one handle to a session and inspect the bucket through another.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{ObjectStore, Part, UploadSession};
use crate::error::{StoreError, StoreResult};

/// Store operations, used to target injected faults and count calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Begin,
    UploadChunk,
    Complete,
    Abort,
    List,
}

#[derive(Debug, Default)]
struct OpenUpload {
    key: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct State {
    uploads: HashMap<String, OpenUpload>,
    objects: BTreeMap<String, Vec<u8>>,
    committed_parts: HashMap<String, Vec<Vec<u8>>>,
    aborted: Vec<String>,
    faults: VecDeque<(Operation, StoreError)>,
    calls: HashMap<Operation, usize>,
}

impl State {
    /// Count the call and pop the first fault queued for it
    fn enter(&mut self, operation: Operation) -> StoreResult<()> {
        *self.calls.entry(operation).or_default() += 1;

        match self.faults.iter().position(|(op, _)| *op == operation) {
            Some(idx) => match self.faults.remove(idx) {
                Some((_, err)) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    bucket: String,
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call to `operation` fail with `error`
    pub fn fail_next(&self, operation: Operation, error: StoreError) {
        self.state().faults.push_back((operation, error));
    }

    /// Number of times `operation` was called, failed attempts included
    pub fn calls(&self, operation: Operation) -> usize {
        self.state().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Body of a committed object
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state().objects.get(key).cloned()
    }

    pub fn object_keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    /// Bodies of the parts a committed object was assembled from, in order
    pub fn committed_parts(&self, key: &str) -> Vec<Vec<u8>> {
        self.state().committed_parts.get(key).cloned().unwrap_or_default()
    }

    /// Number of parts uploaded so far to open sessions for `key`
    pub fn pending_part_count(&self, key: &str) -> usize {
        self.state()
            .uploads
            .values()
            .filter(|upload| upload.key == key)
            .map(|upload| upload.parts.len())
            .sum()
    }

    pub fn open_upload_count(&self) -> usize {
        self.state().uploads.len()
    }

    /// Keys whose uploads were aborted, in abort order
    pub fn aborted_keys(&self) -> Vec<String> {
        self.state().aborted.clone()
    }
}

fn integrity_tag(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn begin_chunked_upload(&self, key: &str) -> StoreResult<UploadSession> {
        let mut state = self.state();
        state.enter(Operation::Begin)?;

        let upload_id = Uuid::new_v4().to_string();
        state.uploads.insert(
            upload_id.clone(),
            OpenUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );

        Ok(UploadSession {
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_chunk(&self, session: &UploadSession, part_number: u32, data: &[u8]) -> StoreResult<String> {
        let mut state = self.state();
        state.enter(Operation::UploadChunk)?;

        if part_number == 0 {
            return Err(StoreError::permanent("upload_part", "part numbers start at 1"));
        }

        let upload = state
            .uploads
            .get_mut(&session.upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload(session.upload_id.clone()))?;

        let tag = integrity_tag(data);
        upload.parts.insert(part_number, (tag.clone(), data.to_vec()));
        Ok(tag)
    }

    async fn complete(&self, session: &UploadSession, parts: &[Part]) -> StoreResult<()> {
        let mut state = self.state();
        state.enter(Operation::Complete)?;

        if parts.is_empty() {
            return Err(StoreError::permanent("complete_multipart_upload", "no parts given"));
        }
        if parts.windows(2).any(|pair| pair[0].number >= pair[1].number) {
            return Err(StoreError::permanent(
                "complete_multipart_upload",
                "parts must be listed in ascending order",
            ));
        }

        let upload = state
            .uploads
            .remove(&session.upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload(session.upload_id.clone()))?;

        let mismatch = parts.iter().find(|part| {
            upload
                .parts
                .get(&part.number)
                .map_or(true, |(tag, _)| *tag != part.tag)
        });
        if let Some(part) = mismatch {
            let message = format!("part {} is missing or its tag does not match", part.number);
            // The session stays open so the caller can still abort it
            state.uploads.insert(session.upload_id.clone(), upload);
            return Err(StoreError::permanent("complete_multipart_upload", message));
        }

        let bodies: Vec<Vec<u8>> = parts
            .iter()
            .filter_map(|part| upload.parts.get(&part.number).map(|(_, data)| data.clone()))
            .collect();
        let body = bodies.concat();

        state.objects.insert(upload.key.clone(), body);
        state.committed_parts.insert(upload.key, bodies);
        Ok(())
    }

    async fn abort(&self, session: &UploadSession) -> StoreResult<()> {
        let mut state = self.state();
        state.enter(Operation::Abort)?;

        let upload = state
            .uploads
            .remove(&session.upload_id)
            .ok_or_else(|| StoreError::NoSuchUpload(session.upload_id.clone()))?;
        state.aborted.push(upload.key);
        Ok(())
    }

    async fn list_open_uploads(&self, prefix: &str) -> StoreResult<Vec<UploadSession>> {
        let mut state = self.state();
        state.enter(Operation::List)?;

        let mut sessions: Vec<_> = state
            .uploads
            .iter()
            .filter(|(_, upload)| upload.key.starts_with(prefix))
            .map(|(upload_id, upload)| UploadSession {
                key: upload.key.clone(),
                upload_id: upload_id.clone(),
            })
            .collect();
        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(sessions)
    }
}
