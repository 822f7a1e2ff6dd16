//! In-memory object store used by the integration suites
//!
//! One type plays every cloud backend: the scheme it is created with picks
//! the capabilities it exposes (multipart copy for `s3`, rewrite for `gs`,
//! asynchronous copy for `az`). Calls are counted per operation, and faults
//! can be injected into uploads and server-side copies.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use nb_core::{
    AsyncCopy, ByteStream, Checksum, ChecksumAlgorithm, CopyHandle, CopyProgress, CopyState,
    Digests, Error, ListOptions, ListPage, MultipartCopy, ObjectDescriptor, ObjectStore, PartInfo,
    PutOptions, ResourceUri, Result, RewriteCopy, RewriteStatus, Scheme, UploadSession,
};
use tokio::sync::Notify;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

const READ_CHUNK: usize = MIB as usize;
const REWRITE_STEP: u64 = GIB;

#[derive(Debug, Clone)]
enum Body {
    Bytes(Bytes),
    /// Size-only content for objects too large to hold in memory
    Synthetic(u64),
}

impl Body {
    fn len(&self) -> u64 {
        match self {
            Body::Bytes(b) => b.len() as u64,
            Body::Synthetic(size) => *size,
        }
    }
}

#[derive(Debug, Clone)]
struct Object {
    body: Body,
    etag: String,
}

#[derive(Debug)]
struct PendingCopy {
    src: String,
    dest: String,
    polls_left: u32,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, Object>,
    sessions: HashMap<String, Vec<u8>>,
    multiparts: HashMap<String, BTreeMap<u32, PartInfo>>,
    copies: HashMap<String, PendingCopy>,
    calls: HashMap<&'static str, usize>,
    bytes_received: u64,
    next_id: u64,
    etag_counter: u64,
    disconnect_at: Option<u64>,
    hold_at: Option<u64>,
    part_delay: Option<Duration>,
    corrupt_uploads: bool,
    touch_source_on_poll: bool,
    touch_source_after_copy: bool,
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn etag(&mut self) -> String {
        self.etag_counter += 1;
        format!("\"etag-{}\"", self.etag_counter)
    }

    fn count(&mut self, op: &'static str) {
        *self.calls.entry(op).or_default() += 1;
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    reached: Notify,
    release: Notify,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    scheme: Scheme,
    shared: Arc<Shared>,
}

fn key(uri: &ResourceUri) -> String {
    uri.to_string()
}

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

impl MemoryStore {
    pub fn new(scheme: Scheme) -> Self {
        Self {
            scheme,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn insert(&self, uri: &ResourceUri, data: impl Into<Bytes>) {
        let mut state = self.shared.lock();
        let etag = state.etag();
        state.objects.insert(
            key(uri),
            Object {
                body: Body::Bytes(data.into()),
                etag,
            },
        );
    }

    pub fn insert_sized(&self, uri: &ResourceUri, size: u64) {
        let mut state = self.shared.lock();
        let etag = state.etag();
        state.objects.insert(
            key(uri),
            Object {
                body: Body::Synthetic(size),
                etag,
            },
        );
    }

    /// Rewrite an object in place so its ETag changes
    pub fn touch(&self, uri: &ResourceUri) {
        let mut state = self.shared.lock();
        let etag = state.etag();
        if let Some(object) = state.objects.get_mut(&key(uri)) {
            object.etag = etag;
        }
    }

    pub fn contents(&self, uri: &ResourceUri) -> Option<Bytes> {
        match self.shared.lock().objects.get(&key(uri)) {
            Some(Object {
                body: Body::Bytes(b),
                ..
            }) => Some(b.clone()),
            _ => None,
        }
    }

    pub fn size_of(&self, uri: &ResourceUri) -> Option<u64> {
        self.shared.lock().objects.get(&key(uri)).map(|o| o.body.len())
    }

    pub fn calls(&self, op: &str) -> usize {
        self.shared.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn bytes_received(&self) -> u64 {
        self.shared.lock().bytes_received
    }

    pub fn open_sessions(&self) -> usize {
        self.shared.lock().sessions.len()
    }

    pub fn open_multiparts(&self) -> usize {
        self.shared.lock().multiparts.len()
    }

    /// Fail the first write that would cross `offset`
    pub fn disconnect_at(&self, offset: u64) {
        self.shared.lock().disconnect_at = Some(offset);
    }

    /// Block the first write that reaches `offset` until `release`
    pub fn hold_at(&self, offset: u64) {
        self.shared.lock().hold_at = Some(offset);
    }

    /// Make every `copy_part` take `delay` to complete
    pub fn part_delay(&self, delay: Duration) {
        self.shared.lock().part_delay = Some(delay);
    }

    /// Flip the first byte of every finished upload
    pub fn corrupt_uploads(&self) {
        self.shared.lock().corrupt_uploads = true;
    }

    /// Rewrite the source of a pending asynchronous copy on its next poll
    pub fn touch_source_on_poll(&self) {
        self.shared.lock().touch_source_on_poll = true;
    }

    /// Rewrite the source right after an asynchronous copy reports success
    pub fn touch_source_after_copy(&self) {
        self.shared.lock().touch_source_after_copy = true;
    }

    /// Drop every open multipart upload, as the backend does on completion
    /// or expiry; with `size` the destination is left as the completed object
    pub fn end_multiparts(&self, dest: &ResourceUri, size: Option<u64>) {
        self.shared.lock().multiparts.clear();
        if let Some(size) = size {
            self.store_object(dest, Body::Synthetic(size));
        }
    }

    pub async fn reached(&self) {
        self.shared.reached.notified().await;
    }

    pub fn release(&self) {
        self.shared.release.notify_one();
    }

    fn descriptor(&self, uri: &ResourceUri, object: &Object) -> ObjectDescriptor {
        let checksum = match &object.body {
            Body::Bytes(b) => Some(Checksum::new(ChecksumAlgorithm::Md5, md5_hex(b))),
            Body::Synthetic(_) => None,
        };
        ObjectDescriptor::object(uri.clone(), object.body.len())
            .with_etag(Some(object.etag.clone()))
            .with_checksum(checksum)
    }

    fn lookup(&self, uri: &ResourceUri) -> Result<Object> {
        self.shared
            .lock()
            .objects
            .get(&key(uri))
            .cloned()
            .ok_or_else(|| Error::NotFound(uri.to_string()))
    }

    fn store_object(&self, uri: &ResourceUri, body: Body) -> ObjectDescriptor {
        let mut state = self.shared.lock();
        let etag = state.etag();
        let object = Object { body, etag };
        state.objects.insert(key(uri), object.clone());
        drop(state);
        self.descriptor(uri, &object)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn scheme(&self) -> Scheme {
        self.scheme
    }

    fn native_checksum(&self) -> Option<ChecksumAlgorithm> {
        Some(ChecksumAlgorithm::Md5)
    }

    async fn list(&self, uri: &ResourceUri, options: &ListOptions) -> Result<ListPage> {
        let dir = key(&uri.as_dir());
        let state = self.shared.lock();
        let mut items = Vec::new();
        let mut seen_dirs = Vec::new();
        for (k, object) in state.objects.range(dir.clone()..) {
            let Some(rest) = k.strip_prefix(&dir) else {
                break;
            };
            match rest.split_once('/') {
                Some((child, _)) if !options.recursive => {
                    if !seen_dirs.iter().any(|d| d == child) {
                        seen_dirs.push(child.to_string());
                        let child_uri = uri.as_dir().join(child)?;
                        items.push(ObjectDescriptor::directory(child_uri));
                    }
                }
                _ => {
                    let child_uri = ResourceUri::parse(k)?;
                    items.push(self.descriptor(&child_uri, object));
                }
            }
        }
        Ok(ListPage {
            items,
            next_page_token: None,
        })
    }

    async fn stat(&self, uri: &ResourceUri) -> Result<ObjectDescriptor> {
        self.shared.lock().count("stat");
        if uri.is_dir() {
            return Ok(ObjectDescriptor::directory(uri.clone()));
        }
        let object = self.lookup(uri)?;
        Ok(self.descriptor(uri, &object))
    }

    async fn open_read(&self, uri: &ResourceUri, offset: u64) -> Result<ByteStream> {
        self.shared.lock().count("open_read");
        let data = match self.lookup(uri)?.body {
            Body::Bytes(b) => b,
            Body::Synthetic(_) => {
                return Err(Error::NotSupported(format!("{uri} has no content")));
            }
        };
        let start = (offset as usize).min(data.len());
        let chunks: Vec<Result<Bytes>> = (start..data.len())
            .step_by(READ_CHUNK)
            .map(|at| Ok(data.slice(at..(at + READ_CHUNK).min(data.len()))))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn begin_upload(
        &self,
        dest: &ResourceUri,
        _options: &PutOptions,
    ) -> Result<Box<dyn UploadSession>> {
        let mut state = self.shared.lock();
        state.count("begin_upload");
        let id = state.id("session");
        state.sessions.insert(id.clone(), Vec::new());
        Ok(Box::new(MemorySession {
            store: self.clone(),
            dest: dest.clone(),
            id,
            committed: 0,
        }))
    }

    fn resumable_uploads(&self) -> bool {
        self.scheme != Scheme::Azure
    }

    async fn resume_upload(
        &self,
        dest: &ResourceUri,
        token: &str,
    ) -> Result<Box<dyn UploadSession>> {
        let mut state = self.shared.lock();
        state.count("resume_upload");
        let committed = state
            .sessions
            .get(token)
            .map(|data| data.len() as u64)
            .ok_or_else(|| Error::NotFound(format!("upload session {token}")))?;
        Ok(Box::new(MemorySession {
            store: self.clone(),
            dest: dest.clone(),
            id: token.to_string(),
            committed,
        }))
    }

    async fn delete(&self, uri: &ResourceUri, recursive: bool) -> Result<()> {
        let mut state = self.shared.lock();
        state.count("delete");
        if uri.is_dir() {
            let dir = key(uri);
            let children: Vec<String> = state
                .objects
                .keys()
                .filter(|k| k.starts_with(&dir))
                .cloned()
                .collect();
            if !children.is_empty() && !recursive {
                return Err(Error::DirectoryNotEmpty(uri.to_string()));
            }
            for k in children {
                state.objects.remove(&k);
            }
            return Ok(());
        }
        state
            .objects
            .remove(&key(uri))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(uri.to_string()))
    }

    async fn copy(&self, src: &ResourceUri, dest: &ResourceUri) -> Result<ObjectDescriptor> {
        self.shared.lock().count("copy");
        let object = self.lookup(src)?;
        Ok(self.store_object(dest, object.body))
    }

    async fn mkdir(&self, _uri: &ResourceUri) -> Result<()> {
        Ok(())
    }

    fn multipart_copy(&self) -> Option<&dyn MultipartCopy> {
        if self.scheme == Scheme::S3 {
            Some(self)
        } else {
            None
        }
    }

    fn rewrite_copy(&self) -> Option<&dyn RewriteCopy> {
        if self.scheme == Scheme::Gcs {
            Some(self)
        } else {
            None
        }
    }

    fn async_copy(&self) -> Option<&dyn AsyncCopy> {
        if self.scheme == Scheme::Azure {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl MultipartCopy for MemoryStore {
    async fn create_multipart(&self, _dest: &ResourceUri) -> Result<String> {
        let mut state = self.shared.lock();
        state.count("create_multipart");
        let id = state.id("upload");
        state.multiparts.insert(id.clone(), BTreeMap::new());
        Ok(id)
    }

    async fn copy_part(
        &self,
        src: &ResourceUri,
        _dest: &ResourceUri,
        upload_id: &str,
        part_number: u32,
        range: Range<u64>,
    ) -> Result<PartInfo> {
        let delay = {
            let mut state = self.shared.lock();
            state.count("copy_part_started");
            state.part_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let size = self.lookup(src)?.body.len();
        if range.end > size {
            return Err(Error::General(format!("range {range:?} past end of {src}")));
        }
        let mut state = self.shared.lock();
        state.count("copy_part");
        let part = PartInfo {
            part_number,
            etag: format!("\"part-{part_number}\""),
            size: range.end - range.start,
        };
        state
            .multiparts
            .get_mut(upload_id)
            .ok_or_else(|| Error::NotFound(format!("upload {upload_id}")))?
            .insert(part_number, part.clone());
        Ok(part)
    }

    async fn list_parts(&self, _dest: &ResourceUri, upload_id: &str) -> Result<Vec<PartInfo>> {
        let state = self.shared.lock();
        state
            .multiparts
            .get(upload_id)
            .map(|parts| parts.values().cloned().collect())
            .ok_or_else(|| Error::NotFound(format!("upload {upload_id}")))
    }

    async fn complete_multipart(
        &self,
        dest: &ResourceUri,
        upload_id: &str,
        parts: Vec<PartInfo>,
    ) -> Result<ObjectDescriptor> {
        let mut state = self.shared.lock();
        state.count("complete_multipart");
        state
            .multiparts
            .remove(upload_id)
            .ok_or_else(|| Error::NotFound(format!("upload {upload_id}")))?;
        drop(state);
        let size = parts.iter().map(|p| p.size).sum();
        Ok(self.store_object(dest, Body::Synthetic(size)))
    }

    async fn abort_multipart(&self, _dest: &ResourceUri, upload_id: &str) -> Result<()> {
        let mut state = self.shared.lock();
        state.count("abort_multipart");
        state.multiparts.remove(upload_id);
        Ok(())
    }
}

#[async_trait]
impl RewriteCopy for MemoryStore {
    async fn rewrite(
        &self,
        src: &ResourceUri,
        dest: &ResourceUri,
        token: Option<String>,
    ) -> Result<RewriteStatus> {
        self.shared.lock().count("rewrite");
        let object = self.lookup(src)?;
        let total = object.body.len();
        let done_before: u64 = match token {
            Some(t) => t
                .parse()
                .map_err(|_| Error::General(format!("bad rewrite token {t}")))?,
            None => 0,
        };
        let rewritten = (done_before + REWRITE_STEP).min(total);
        if rewritten < total {
            return Ok(RewriteStatus {
                done: false,
                token: Some(rewritten.to_string()),
                bytes_rewritten: rewritten,
                total,
                descriptor: None,
            });
        }
        let descriptor = self.store_object(dest, object.body);
        Ok(RewriteStatus {
            done: true,
            token: None,
            bytes_rewritten: total,
            total,
            descriptor: Some(descriptor),
        })
    }
}

#[async_trait]
impl AsyncCopy for MemoryStore {
    async fn start_copy(&self, src: &ResourceUri, dest: &ResourceUri) -> Result<CopyHandle> {
        let object = self.lookup(src)?;
        let mut state = self.shared.lock();
        state.count("start_copy");
        let copy_id = state.id("copy");
        state.copies.insert(
            copy_id.clone(),
            PendingCopy {
                src: key(src),
                dest: key(dest),
                polls_left: 2,
            },
        );
        Ok(CopyHandle {
            copy_id,
            source_etag: Some(object.etag),
        })
    }

    async fn copy_status(&self, _dest: &ResourceUri, copy_id: &str) -> Result<CopyProgress> {
        let mut state = self.shared.lock();
        state.count("copy_status");
        let copy = state
            .copies
            .get_mut(copy_id)
            .ok_or_else(|| Error::NotFound(format!("copy {copy_id}")))?;
        copy.polls_left = copy.polls_left.saturating_sub(1);
        let finished = copy.polls_left == 0;
        let (src, dest) = (copy.src.clone(), copy.dest.clone());

        if !finished && state.touch_source_on_poll {
            state.touch_source_on_poll = false;
            let etag = state.etag();
            if let Some(object) = state.objects.get_mut(&src) {
                object.etag = etag;
            }
        }
        let source = state
            .objects
            .get(&src)
            .cloned()
            .ok_or_else(|| Error::NotFound(src.clone()))?;
        let total = source.body.len();
        if finished {
            let etag_now = state.etag();
            state.objects.insert(
                dest,
                Object {
                    body: source.body.clone(),
                    etag: etag_now,
                },
            );
            if state.touch_source_after_copy {
                state.touch_source_after_copy = false;
                let etag = state.etag();
                if let Some(object) = state.objects.get_mut(&src) {
                    object.etag = etag;
                }
            }
        }
        Ok(CopyProgress {
            state: if finished {
                CopyState::Success
            } else {
                CopyState::Pending
            },
            bytes_copied: if finished { total } else { total / 2 },
            total: Some(total),
            description: None,
            source_etag: Some(source.etag),
        })
    }

    async fn abort_copy(&self, _dest: &ResourceUri, copy_id: &str) -> Result<()> {
        let mut state = self.shared.lock();
        state.count("abort_copy");
        state.copies.remove(copy_id);
        Ok(())
    }
}

struct MemorySession {
    store: MemoryStore,
    dest: ResourceUri,
    id: String,
    committed: u64,
}

#[async_trait]
impl UploadSession for MemorySession {
    fn chunk_size(&self) -> u64 {
        256 * 1024
    }

    fn committed(&self) -> u64 {
        self.committed
    }

    fn resume_token(&self) -> Option<String> {
        Some(self.id.clone())
    }

    async fn write_chunk(&mut self, data: Bytes) -> Result<u64> {
        let hold = {
            let mut state = self.store.shared.lock();
            state.count("write_chunk");
            let end = self.committed + data.len() as u64;
            if let Some(at) = state.disconnect_at
                && end > at
            {
                state.disconnect_at = None;
                return Err(Error::TransientNetwork("connection reset".to_string()));
            }
            let session = state
                .sessions
                .get_mut(&self.id)
                .ok_or_else(|| Error::NotFound(format!("upload session {}", self.id)))?;
            session.extend_from_slice(&data);
            self.committed = session.len() as u64;
            state.bytes_received += data.len() as u64;

            let hold = state.hold_at.is_some_and(|at| self.committed >= at);
            if hold {
                state.hold_at = None;
            }
            hold
        };

        if hold {
            self.store.shared.reached.notify_one();
            self.store.shared.release.notified().await;
        }
        Ok(self.committed)
    }

    async fn query_committed(&mut self) -> Result<u64> {
        let mut state = self.store.shared.lock();
        state.count("query_committed");
        self.committed = state
            .sessions
            .get(&self.id)
            .map(|data| data.len() as u64)
            .ok_or_else(|| Error::NotFound(format!("upload session {}", self.id)))?;
        Ok(self.committed)
    }

    async fn finish(self: Box<Self>, _digests: &Digests) -> Result<ObjectDescriptor> {
        let (mut data, corrupt) = {
            let mut state = self.store.shared.lock();
            let data = state
                .sessions
                .remove(&self.id)
                .ok_or_else(|| Error::NotFound(format!("upload session {}", self.id)))?;
            (data, state.corrupt_uploads)
        };
        if corrupt && let Some(first) = data.first_mut() {
            *first ^= 0xff;
        }
        Ok(self.store.store_object(&self.dest, Body::Bytes(Bytes::from(data))))
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let mut state = self.store.shared.lock();
        state.count("abort_upload");
        state.sessions.remove(&self.id);
        Ok(())
    }
}

/// Deterministic test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
