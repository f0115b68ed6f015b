#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use page_intake::config::IntakeConfig;
use page_intake::error::IntakeError;
use page_intake::models::{ChunkAck, FileDeclaration, LimitOverrides, SessionId};
use page_intake::services::authorizer::{AllowAllAuthorizer, CollectionAuthorizer};
use page_intake::services::chunk_store::ChunkUpload;
use page_intake::services::intake::{FileAssembled, IntakeService};
use page_intake::services::storage::{BlobStore, MemoryBlobStore};
use page_intake::services::verdict_sink::{VerdictEvent, VerdictSink};
use page_intake::utils::hash::calculate_hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;

/// Keeps every published verdict for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<VerdictEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<VerdictEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn for_file(&self, file_id: &str) -> Vec<VerdictEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.file_id == file_id)
            .collect()
    }
}

#[async_trait]
impl VerdictSink for RecordingSink {
    async fn publish(&self, event: VerdictEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Refuses one collection, allows the rest.
pub struct ReadOnlyCollection(pub &'static str);

#[async_trait]
impl CollectionAuthorizer for ReadOnlyCollection {
    async fn can_write(&self, _owner_id: &str, collection_ref: &str) -> anyhow::Result<bool> {
        Ok(collection_ref != self.0)
    }
}

/// Holds writes of keys ending in `suffix` until released, so a test can act
/// while the pipeline is in the middle of storing a file.
pub struct GatedBlobStore {
    inner: Arc<MemoryBlobStore>,
    suffix: &'static str,
    armed: AtomicBool,
    entered: Notify,
    released: Notify,
}

impl GatedBlobStore {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Resolves once a gated write is being held.
    pub async fn held(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.released.notify_one();
    }
}

#[async_trait]
impl BlobStore for GatedBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> anyhow::Result<()> {
        if self.armed.load(Ordering::SeqCst) && key.ends_with(self.suffix) {
            self.entered.notify_one();
            self.released.notified().await;
        }
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.inner.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<usize> {
        self.inner.delete_prefix(prefix).await
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        self.inner.health_check().await
    }
}

pub struct Harness {
    pub intake: Arc<IntakeService>,
    pub blobs: Arc<MemoryBlobStore>,
    pub sink: Arc<RecordingSink>,
    pub assembled: UnboundedReceiver<FileAssembled>,
}

pub fn harness() -> Harness {
    harness_with(IntakeConfig::development(), Arc::new(AllowAllAuthorizer))
}

pub fn harness_with(config: IntakeConfig, authorizer: Arc<dyn CollectionAuthorizer>) -> Harness {
    let blobs = Arc::new(MemoryBlobStore::new());
    let sink = Arc::new(RecordingSink::default());
    let (intake, assembled) = IntakeService::new(config, blobs.clone(), authorizer, sink.clone());
    Harness {
        intake: Arc::new(intake),
        blobs,
        sink,
        assembled,
    }
}

/// A harness whose writes of assembled payloads can be held.
pub fn gated_harness() -> (Harness, Arc<GatedBlobStore>) {
    let blobs = Arc::new(MemoryBlobStore::new());
    let gate = Arc::new(GatedBlobStore {
        inner: blobs.clone(),
        suffix: "/assembled",
        armed: AtomicBool::new(false),
        entered: Notify::new(),
        released: Notify::new(),
    });
    let sink = Arc::new(RecordingSink::default());
    let (intake, assembled) = IntakeService::new(
        IntakeConfig::development(),
        gate.clone(),
        Arc::new(AllowAllAuthorizer),
        sink.clone(),
    );
    let harness = Harness {
        intake: Arc::new(intake),
        blobs,
        sink,
        assembled,
    };
    (harness, gate)
}

impl Harness {
    pub async fn open(&self, collection_ref: &str) -> SessionId {
        self.open_with(collection_ref, LimitOverrides::default())
            .await
    }

    pub async fn open_with(&self, collection_ref: &str, limits: LimitOverrides) -> SessionId {
        self.intake
            .create_session("scanner-7", collection_ref, limits)
            .await
            .unwrap()
            .session_id
    }

    pub fn blobs_of(&self, session_id: SessionId) -> Vec<String> {
        self.blobs
            .keys_with_prefix(&format!("sessions/{}/", session_id))
    }

    /// Waits for the background purge of an abandoned session.
    pub async fn wait_for_purge(&self, session_id: SessionId) {
        for _ in 0..100 {
            if self.blobs_of(session_id).is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

/// Splits `data` into `parts` pieces of near-equal size.
pub fn split(data: &[u8], parts: u32) -> Vec<Bytes> {
    let size = data.len().div_ceil(parts as usize);
    data.chunks(size).map(Bytes::copy_from_slice).collect()
}

pub fn png_declaration(file_id: &str, data: &[u8]) -> FileDeclaration {
    FileDeclaration {
        name: Some(format!("{}.png", file_id)),
        mime_type: Some("image/png".to_string()),
        total_size: Some(data.len() as u64),
        ..Default::default()
    }
}

pub fn chunk(
    session_id: SessionId,
    file_id: &str,
    index: u32,
    total_chunks: u32,
    payload: Bytes,
    declaration: Option<FileDeclaration>,
) -> ChunkUpload {
    ChunkUpload {
        session_id,
        file_id: file_id.to_string(),
        index,
        total_chunks,
        checksum: calculate_hash(&payload),
        payload,
        declaration,
    }
}

/// Sends the listed chunks of a PNG split into `parts`. The declaration
/// travels with the first chunk sent.
pub async fn send_chunks(
    intake: &IntakeService,
    session_id: SessionId,
    file_id: &str,
    data: &[u8],
    parts: u32,
    indices: &[u32],
) -> Result<ChunkAck, IntakeError> {
    let pieces = split(data, parts);
    let total = pieces.len() as u32;
    let mut last = None;
    for (n, index) in indices.iter().enumerate() {
        let declaration = (n == 0).then(|| png_declaration(file_id, data));
        let upload = chunk(
            session_id,
            file_id,
            *index,
            total,
            pieces[*index as usize].clone(),
            declaration,
        );
        last = Some(intake.put_chunk(upload).await?);
    }
    last.ok_or_else(|| IntakeError::InvalidRequest("no chunks sent".to_string()))
}

pub async fn upload_png(
    intake: &IntakeService,
    session_id: SessionId,
    file_id: &str,
    data: &[u8],
    parts: u32,
) -> Result<ChunkAck, IntakeError> {
    let all: Vec<u32> = (0..parts).collect();
    send_chunks(intake, session_id, file_id, data, parts, &all).await
}
