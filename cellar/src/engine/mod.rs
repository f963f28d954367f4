// Copyright 2026 cellar Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Storage engines and the machinery shared between them.
//!
//! The disk engines serialize every operation through one worker task bound to the backend
//! instance; this module holds the submission protocol, the channel client, the worker-backed
//! entry handle, id generation, the on-disk format preamble, and the directory lock.

use std::{
    fmt::Debug,
    fs::{File, OpenOptions},
    io::Read as _,
    path::Path,
    sync::atomic::{AtomicU8, Ordering},
};

use bytes::{Buf, BufMut, Bytes};
use fs2::FileExt;
use futures_util::FutureExt;
use tokio::sync::oneshot;

use crate::{
    entry::{Entry, EntryId, EntryOps, EntryStat, SparseRead},
    error::{Error, Result},
};

pub mod block;
pub mod mem;
pub mod object;

/// Name of the index/control file inside a cache directory.
pub(crate) const INDEX_FILE: &str = "index";
/// Name of the advisory lock file inside a cache directory.
pub(crate) const LOCK_FILE: &str = "lock";

pub(crate) const FORMAT_MAGIC: u32 = 0x434C_5231; // "CLR1"
pub(crate) const FORMAT_VERSION: u32 = 1;

/// Persisted layout kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    /// Block-log layout: shared append-only block files plus an index snapshot.
    Block = 1,
    /// Object layout: one file per entry.
    Object = 2,
}

impl TryFrom<u8> for LayoutKind {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::Block),
            2 => Ok(Self::Object),
            _ => Err(Error::corruption(format!("unknown layout kind: {v}"))),
        }
    }
}

/// The fixed-size head of the index file: format marker, layout kind, dirty flag.
///
/// | magic 4B | version 4B | kind 1B | dirty 1B | pad 2B |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Preamble {
    pub kind: LayoutKind,
    pub dirty: bool,
}

impl Preamble {
    pub const LEN: usize = 12;

    pub fn write(&self, mut buf: impl BufMut) {
        buf.put_u32(FORMAT_MAGIC);
        buf.put_u32(FORMAT_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.dirty as u8);
        buf.put_u16(0);
    }

    pub fn read(mut buf: impl Buf) -> Result<Self> {
        if buf.remaining() < Self::LEN {
            return Err(Error::corruption("index preamble truncated"));
        }
        let magic = buf.get_u32();
        if magic != FORMAT_MAGIC {
            return Err(Error::corruption(format!(
                "index magic mismatch, expected: {FORMAT_MAGIC:#x}, got: {magic:#x}"
            )));
        }
        let version = buf.get_u32();
        if version != FORMAT_VERSION {
            return Err(Error::corruption(format!(
                "index version mismatch, expected: {FORMAT_VERSION}, got: {version}"
            )));
        }
        let kind = LayoutKind::try_from(buf.get_u8())?;
        let dirty = buf.get_u8() != 0;
        buf.get_u16();
        Ok(Self { kind, dirty })
    }

    /// Read the preamble of the index file in `dir`. `None` when no index file exists.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(INDEX_FILE);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut buf = [0u8; Self::LEN];
        file.read_exact(&mut buf)
            .map_err(|_| Error::corruption("index preamble truncated"))?;
        Ok(Some(Self::read(&buf[..])?))
    }
}

/// Advisory exclusive lock on a cache directory.
///
/// One live backend instance owns a directory; a second open over the same path fails instead of
/// being silently tolerated. The lock releases on drop.
#[derive(Debug)]
pub(crate) struct DirLock {
    file: File,
}

impl DirLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(Error::Misuse("cache directory is locked by another instance"));
        }
        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Entry id generation.
///
/// The deterministic mode assigns sequential ids for reproducible tests; the default mode draws
/// random ids. Either way the worker retries on collision with a live slot.
#[derive(Debug)]
pub(crate) enum IdGenerator {
    Sequential { next: u64 },
    Random,
}

impl IdGenerator {
    pub fn new(deterministic: bool) -> Self {
        if deterministic {
            Self::Sequential { next: 1 }
        } else {
            Self::Random
        }
    }

    /// Resume sequential generation after the highest recovered id.
    pub fn resume(&mut self, highest: u64) {
        if let Self::Sequential { next } = self {
            *next = (*next).max(highest + 1);
        }
    }

    pub fn next(&mut self) -> EntryId {
        match self {
            Self::Sequential { next } => {
                let id = *next;
                *next += 1;
                id
            }
            Self::Random => rand::random(),
        }
    }

    /// The id the sequential mode would assign next; 1 for random ids.
    pub fn peek_next(&self) -> u64 {
        match self {
            Self::Sequential { next } => *next,
            Self::Random => 1,
        }
    }
}

/// Backend lifecycle states enforcing the init-once contract.
#[derive(Debug)]
pub(crate) struct Lifecycle(AtomicU8);

const STATE_NEW: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_CLOSED: u8 = 3;

impl Lifecycle {
    pub fn new() -> Self {
        Self(AtomicU8::new(STATE_NEW))
    }

    /// Claim the one allowed init. Fails with `Misuse` when already initializing or ready.
    pub fn start_init(&self) -> Result<()> {
        match self
            .0
            .compare_exchange(STATE_NEW, STATE_INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(STATE_CLOSED) => Err(Error::Closed),
            Err(_) => Err(Error::Misuse("backend is already initialized")),
        }
    }

    pub fn finish_init(&self) {
        self.0.store(STATE_READY, Ordering::Release);
    }

    /// A failed init reverts to `New` so it can be retried.
    pub fn fail_init(&self) {
        self.0.store(STATE_NEW, Ordering::Release);
    }

    pub fn close(&self) {
        self.0.store(STATE_CLOSED, Ordering::Release);
    }

    /// Check that the backend is ready to serve operations.
    pub fn guard(&self) -> Result<()> {
        match self.0.load(Ordering::Acquire) {
            STATE_READY => Ok(()),
            STATE_CLOSED => Err(Error::Closed),
            _ => Err(Error::Misuse("backend is not initialized")),
        }
    }
}

/// Operations against one entry, executed by the worker.
pub(crate) enum EntryOp {
    Read {
        stream: usize,
        offset: u64,
        len: usize,
        tx: oneshot::Sender<Result<Bytes>>,
    },
    Write {
        stream: usize,
        offset: u64,
        buf: Bytes,
        truncate: bool,
        tx: oneshot::Sender<Result<()>>,
    },
    ReadSparse {
        offset: u64,
        len: usize,
        tx: oneshot::Sender<Result<SparseRead>>,
    },
    WriteSparse {
        offset: u64,
        buf: Bytes,
        tx: oneshot::Sender<Result<()>>,
    },
    Stat {
        tx: oneshot::Sender<Result<EntryStat>>,
    },
    Doom {
        tx: oneshot::Sender<Result<()>>,
    },
    /// One handle dropped. Fire-and-forget.
    Release,
}

/// Submissions serialized through a disk engine's worker.
pub(crate) enum Submission {
    Open {
        key: Bytes,
        tx: oneshot::Sender<Result<Option<Entry>>>,
    },
    Create {
        key: Bytes,
        tx: oneshot::Sender<Result<Entry>>,
    },
    DoomKey {
        key: Bytes,
        tx: oneshot::Sender<Result<()>>,
    },
    DoomRange {
        begin: u64,
        end: u64,
        tx: oneshot::Sender<Result<()>>,
    },
    List {
        tx: oneshot::Sender<Result<Vec<EntryId>>>,
    },
    OpenId {
        id: EntryId,
        tx: oneshot::Sender<Result<Option<Entry>>>,
    },
    SetMaxSize {
        bytes: u64,
        tx: oneshot::Sender<Result<()>>,
    },
    Count {
        tx: oneshot::Sender<Result<usize>>,
    },
    Size {
        tx: oneshot::Sender<Result<u64>>,
    },
    Entry {
        id: EntryId,
        op: EntryOp,
    },
    Wait {
        tx: oneshot::Sender<()>,
    },
    Close {
        tx: oneshot::Sender<Result<()>>,
    },
}

/// The serialized operations a disk-engine worker implements.
///
/// [`run_worker`] drains a submission queue through these in strict FIFO order; implementations
/// are single-threaded and free of internal locking.
pub(crate) trait WorkerOps {
    fn open_key(&mut self, key: &Bytes) -> Result<Option<Entry>>;
    fn create(&mut self, key: Bytes) -> Result<Entry>;
    fn doom_key(&mut self, key: &Bytes) -> Result<()>;
    fn doom_range(&mut self, begin: u64, end: u64) -> Result<()>;
    fn list(&mut self) -> Result<Vec<EntryId>>;
    fn open_id(&mut self, id: EntryId) -> Result<Option<Entry>>;
    fn set_max_size(&mut self, bytes: u64) -> Result<()>;
    fn count(&mut self) -> Result<usize>;
    fn size(&mut self) -> Result<u64>;
    fn entry_read(&mut self, id: EntryId, stream: usize, offset: u64, len: usize) -> Result<Bytes>;
    fn entry_write(&mut self, id: EntryId, stream: usize, offset: u64, buf: Bytes, truncate: bool) -> Result<()>;
    fn entry_read_sparse(&mut self, id: EntryId, offset: u64, len: usize) -> Result<SparseRead>;
    fn entry_write_sparse(&mut self, id: EntryId, offset: u64, buf: Bytes) -> Result<()>;
    fn entry_stat(&mut self, id: EntryId) -> Result<EntryStat>;
    fn entry_doom(&mut self, id: EntryId) -> Result<()>;
    fn release(&mut self, id: EntryId);
    fn close(&mut self) -> Result<()>;
}

/// Drain submissions until close. Completions are sent exactly once per submission.
pub(crate) async fn run_worker<W: WorkerOps>(mut worker: W, rx: flume::Receiver<Submission>) {
    while let Ok(submission) = rx.recv_async().await {
        match submission {
            Submission::Open { key, tx } => {
                let _ = tx.send(worker.open_key(&key));
            }
            Submission::Create { key, tx } => {
                let _ = tx.send(worker.create(key));
            }
            Submission::DoomKey { key, tx } => {
                let _ = tx.send(worker.doom_key(&key));
            }
            Submission::DoomRange { begin, end, tx } => {
                let _ = tx.send(worker.doom_range(begin, end));
            }
            Submission::List { tx } => {
                let _ = tx.send(worker.list());
            }
            Submission::OpenId { id, tx } => {
                let _ = tx.send(worker.open_id(id));
            }
            Submission::SetMaxSize { bytes, tx } => {
                let _ = tx.send(worker.set_max_size(bytes));
            }
            Submission::Count { tx } => {
                let _ = tx.send(worker.count());
            }
            Submission::Size { tx } => {
                let _ = tx.send(worker.size());
            }
            Submission::Entry { id, op } => match op {
                EntryOp::Read {
                    stream,
                    offset,
                    len,
                    tx,
                } => {
                    let _ = tx.send(worker.entry_read(id, stream, offset, len));
                }
                EntryOp::Write {
                    stream,
                    offset,
                    buf,
                    truncate,
                    tx,
                } => {
                    let _ = tx.send(worker.entry_write(id, stream, offset, buf, truncate));
                }
                EntryOp::ReadSparse { offset, len, tx } => {
                    let _ = tx.send(worker.entry_read_sparse(id, offset, len));
                }
                EntryOp::WriteSparse { offset, buf, tx } => {
                    let _ = tx.send(worker.entry_write_sparse(id, offset, buf));
                }
                EntryOp::Stat { tx } => {
                    let _ = tx.send(worker.entry_stat(id));
                }
                EntryOp::Doom { tx } => {
                    let _ = tx.send(worker.entry_doom(id));
                }
                EntryOp::Release => worker.release(id),
            },
            Submission::Wait { tx } => {
                let _ = tx.send(());
            }
            Submission::Close { tx } => {
                let _ = tx.send(worker.close());
                break;
            }
        }
    }
    tracing::debug!("worker exited");
}

/// Cloneable submission-side handle to a worker.
///
/// A closed channel means the worker has exited (backend closed); every pending or later request
/// resolves with [`Error::Closed`].
#[derive(Debug, Clone)]
pub(crate) struct WorkerClient {
    tx: flume::Sender<Submission>,
}

impl WorkerClient {
    pub fn unbounded() -> (Self, flume::Receiver<Submission>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    pub fn submit(&self, submission: Submission) {
        let _ = self.tx.send(submission);
    }

    pub async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Submission) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn wait(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Submission::Wait { tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Opens a disk engine's worker inside the worker execution context.
pub(crate) trait WorkerFactory: Send + Sync + 'static + Debug + Clone {
    type Worker: WorkerOps + Send + 'static;

    fn open(&self, client: WorkerClient) -> Result<Self::Worker>;
}

/// A disk-backed engine: one worker task per backend instance, everything serialized through it.
///
/// Both disk layouts share this shell; they differ only in the worker a factory opens.
#[derive(Debug)]
pub(crate) struct DiskEngine<F: WorkerFactory> {
    inner: std::sync::Arc<DiskEngineInner<F>>,
}

impl<F: WorkerFactory> Clone for DiskEngine<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct DiskEngineInner<F> {
    factory: F,
    lifecycle: Lifecycle,
    runtime: crate::runtime::Runtime,
    client: parking_lot::Mutex<Option<WorkerClient>>,
}

impl<F: WorkerFactory> DiskEngine<F> {
    pub fn new(factory: F, runtime: crate::runtime::Runtime) -> Self {
        Self {
            inner: std::sync::Arc::new(DiskEngineInner {
                factory,
                lifecycle: Lifecycle::new(),
                runtime,
                client: parking_lot::Mutex::new(None),
            }),
        }
    }

    fn client(&self) -> Result<WorkerClient> {
        self.inner.lifecycle.guard()?;
        self.inner
            .client
            .lock()
            .clone()
            .ok_or(Error::Misuse("backend is not initialized"))
    }
}

impl<F: WorkerFactory> crate::backend::Backend for DiskEngine<F> {
    fn init(&self) -> futures_core::future::BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move {
            this.inner.lifecycle.start_init()?;

            let (client, rx) = WorkerClient::unbounded();
            let factory = this.inner.factory.clone();
            let worker_client = client.clone();
            let (ready_tx, ready_rx) = oneshot::channel();
            this.inner.runtime.worker().spawn(async move {
                match factory.open(worker_client) {
                    Ok(worker) => {
                        let _ = ready_tx.send(Ok(()));
                        run_worker(worker, rx).await;
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            });

            match ready_rx.await.map_err(|_| Error::Closed).and_then(|res| res) {
                Ok(()) => {
                    *this.inner.client.lock() = Some(client);
                    this.inner.lifecycle.finish_init();
                    Ok(())
                }
                Err(e) => {
                    // Init is retryable after failure; a fresh attempt gets a fresh channel.
                    this.inner.lifecycle.fail_init();
                    Err(e)
                }
            }
        }
        .boxed()
    }

    fn open_entry(&self, key: Bytes) -> futures_core::future::BoxFuture<'static, Result<Option<Entry>>> {
        let this = self.clone();
        async move { this.client()?.request(|tx| Submission::Open { key, tx }).await }.boxed()
    }

    fn create_entry(&self, key: Bytes) -> futures_core::future::BoxFuture<'static, Result<Entry>> {
        let this = self.clone();
        async move { this.client()?.request(|tx| Submission::Create { key, tx }).await }.boxed()
    }

    fn doom_entry(&self, key: Bytes) -> futures_core::future::BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move { this.client()?.request(|tx| Submission::DoomKey { key, tx }).await }.boxed()
    }

    fn doom_entries_between(
        &self,
        begin: std::time::SystemTime,
        end: std::time::SystemTime,
    ) -> futures_core::future::BoxFuture<'static, Result<()>> {
        let this = self.clone();
        let begin = crate::clock::to_nanos(begin);
        let end = crate::clock::to_nanos(end);
        async move {
            this.client()?
                .request(|tx| Submission::DoomRange { begin, end, tx })
                .await
        }
        .boxed()
    }

    fn list_entries(&self) -> futures_core::future::BoxFuture<'static, Result<Vec<EntryId>>> {
        let this = self.clone();
        async move { this.client()?.request(|tx| Submission::List { tx }).await }.boxed()
    }

    fn open_entry_by_id(&self, id: EntryId) -> futures_core::future::BoxFuture<'static, Result<Option<Entry>>> {
        let this = self.clone();
        async move { this.client()?.request(|tx| Submission::OpenId { id, tx }).await }.boxed()
    }

    fn set_max_size(&self, bytes: u64) -> futures_core::future::BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move {
            this.client()?
                .request(|tx| Submission::SetMaxSize { bytes, tx })
                .await
        }
        .boxed()
    }

    fn entry_count(&self) -> futures_core::future::BoxFuture<'static, Result<usize>> {
        let this = self.clone();
        async move { this.client()?.request(|tx| Submission::Count { tx }).await }.boxed()
    }

    fn current_size(&self) -> futures_core::future::BoxFuture<'static, Result<u64>> {
        let this = self.clone();
        async move { this.client()?.request(|tx| Submission::Size { tx }).await }.boxed()
    }

    fn wait(&self) -> futures_core::future::BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            if let Ok(client) = this.client() {
                client.wait().await;
            }
        }
        .boxed()
    }

    fn close(&self) -> futures_core::future::BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move {
            let client = this.client()?;
            let res = client.request(|tx| Submission::Close { tx }).await;
            this.inner.lifecycle.close();
            this.inner.client.lock().take();
            res
        }
        .boxed()
    }
}

/// Entry handle backed by a worker channel, shared by both disk engines.
///
/// Dropping the last clone submits a release so the worker can reclaim doomed storage.
#[derive(Debug)]
pub(crate) struct WorkerEntry {
    id: EntryId,
    key: Bytes,
    client: WorkerClient,
}

impl WorkerEntry {
    /// Wrap into a public handle. The worker has already accounted the open handle.
    pub fn entry(id: EntryId, key: Bytes, client: WorkerClient) -> Entry {
        Entry::new(std::sync::Arc::new(Self { id, key, client }))
    }
}

impl Drop for WorkerEntry {
    fn drop(&mut self) {
        self.client.submit(Submission::Entry {
            id: self.id,
            op: EntryOp::Release,
        });
    }
}

impl EntryOps for WorkerEntry {
    fn id(&self) -> EntryId {
        self.id
    }

    fn key(&self) -> &Bytes {
        &self.key
    }

    fn read(&self, stream: usize, offset: u64, len: usize) -> futures_core::future::BoxFuture<'static, Result<Bytes>> {
        let client = self.client.clone();
        let id = self.id;
        async move {
            client
                .request(|tx| Submission::Entry {
                    id,
                    op: EntryOp::Read {
                        stream,
                        offset,
                        len,
                        tx,
                    },
                })
                .await
        }
        .boxed()
    }

    fn write(
        &self,
        stream: usize,
        offset: u64,
        buf: Bytes,
        truncate: bool,
    ) -> futures_core::future::BoxFuture<'static, Result<()>> {
        let client = self.client.clone();
        let id = self.id;
        async move {
            client
                .request(|tx| Submission::Entry {
                    id,
                    op: EntryOp::Write {
                        stream,
                        offset,
                        buf,
                        truncate,
                        tx,
                    },
                })
                .await
        }
        .boxed()
    }

    fn read_sparse(&self, offset: u64, len: usize) -> futures_core::future::BoxFuture<'static, Result<SparseRead>> {
        let client = self.client.clone();
        let id = self.id;
        async move {
            client
                .request(|tx| Submission::Entry {
                    id,
                    op: EntryOp::ReadSparse { offset, len, tx },
                })
                .await
        }
        .boxed()
    }

    fn write_sparse(&self, offset: u64, buf: Bytes) -> futures_core::future::BoxFuture<'static, Result<()>> {
        let client = self.client.clone();
        let id = self.id;
        async move {
            client
                .request(|tx| Submission::Entry {
                    id,
                    op: EntryOp::WriteSparse { offset, buf, tx },
                })
                .await
        }
        .boxed()
    }

    fn stat(&self) -> futures_core::future::BoxFuture<'static, Result<EntryStat>> {
        let client = self.client.clone();
        let id = self.id;
        async move {
            client
                .request(|tx| Submission::Entry {
                    id,
                    op: EntryOp::Stat { tx },
                })
                .await
        }
        .boxed()
    }

    fn doom(&self) -> futures_core::future::BoxFuture<'static, Result<()>> {
        let client = self.client.clone();
        let id = self.id;
        async move {
            client
                .request(|tx| Submission::Entry {
                    id,
                    op: EntryOp::Doom { tx },
                })
                .await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preamble_round_trip() {
        let preamble = Preamble {
            kind: LayoutKind::Block,
            dirty: true,
        };
        let mut buf = Vec::new();
        preamble.write(&mut buf);
        assert_eq!(buf.len(), Preamble::LEN);
        assert_eq!(Preamble::read(&buf[..]).unwrap(), preamble);
    }

    #[test]
    fn test_preamble_rejects_bad_magic() {
        let mut buf = Vec::new();
        Preamble {
            kind: LayoutKind::Object,
            dirty: false,
        }
        .write(&mut buf);
        buf[0] ^= 0xff;
        assert!(Preamble::read(&buf[..]).unwrap_err().is_corruption());
    }

    #[test]
    fn test_dir_lock_excludes_second_owner() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DirLock::acquire(dir.path()).unwrap();
        assert!(DirLock::acquire(dir.path()).is_err());
        assert!(dir.path().join(LOCK_FILE).exists());
        drop(lock);
        let _relock = DirLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn test_id_generator() {
        let mut seq = IdGenerator::new(true);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        seq.resume(10);
        assert_eq!(seq.next(), 11);

        let mut rng = IdGenerator::new(false);
        rng.resume(10); // no-op for random ids
        let _ = rng.next();
    }

    #[test]
    fn test_lifecycle() {
        let lifecycle = Lifecycle::new();
        assert!(matches!(lifecycle.guard(), Err(Error::Misuse(_))));
        lifecycle.start_init().unwrap();
        assert!(matches!(lifecycle.start_init(), Err(Error::Misuse(_))));
        lifecycle.finish_init();
        lifecycle.guard().unwrap();
        assert!(matches!(lifecycle.start_init(), Err(Error::Misuse(_))));
        lifecycle.close();
        assert!(matches!(lifecycle.guard(), Err(Error::Closed)));
    }
}
