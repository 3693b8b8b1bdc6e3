//! Queues and executes file storage operations (writes, reads, deletes)
//! behind a bounded worker pool, enforcing the configured maximum file size
//! and chunking large writes out to an external disk-I/O manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::conf::StorageServiceConf;
use crate::error::{Error, Result, ServiceError};
use crate::service::{HealthCheck, Service, ServiceHealth};

/// Kind of storage operation queued for a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Write,
    Read,
    Delete,
}

/// A unit of work submitted to the storage service's operation queue.
pub struct StorageOperation {
    pub kind: OperationKind,
    pub file_path: String,
    pub size: u64,
    pub data: Option<Vec<u8>>,
}

/// The external block writer this service delegates actual bytes to. Mirrors
/// the crate's `PexBus`/NAT-client seam pattern: the service holds only a
/// trait object and never owns the disk.
pub trait DiskWriter: Send + Sync {
    fn write_chunk(&self, file_path: &str, offset: u64, data: &[u8]) -> BoxFuture<'_, Result<()>>;
    fn read_chunk(&self, file_path: &str, offset: u64, len: u64) -> BoxFuture<'_, Result<Vec<u8>>>;
    fn delete(&self, file_path: &str) -> BoxFuture<'_, Result<()>>;
}

/// Bookkeeping for a file the service has written to or read from.
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub created_at: Instant,
    pub modified_at: Instant,
    pub pieces_complete: u32,
    pub pieces_total: u32,
}

impl FileInfo {
    pub fn is_complete(&self) -> bool {
        self.pieces_total > 0 && self.pieces_complete >= self.pieces_total
    }
}

#[derive(Default)]
struct Stats {
    total_operations: u64,
    successful_operations: u64,
    failed_operations: u64,
    total_bytes_written: u64,
    total_bytes_read: u64,
}

struct Shared {
    files: RwLock<HashMap<String, FileInfo>>,
    stats: Mutex<Stats>,
    active_operations: Mutex<usize>,
}

/// Splits `data` into `chunk_len`-sized pieces (the last possibly shorter)
/// and writes them through `disk`, starting at byte `offset`. All chunk
/// futures must complete before the write as a whole is considered successful.
async fn write_chunked(
    disk: &dyn DiskWriter,
    file_path: &str,
    data: &[u8],
    chunk_len: usize,
) -> Result<()> {
    for (i, chunk) in data.chunks(chunk_len.max(1)).enumerate() {
        let offset = (i * chunk_len) as u64;
        disk.write_chunk(file_path, offset, chunk).await?;
    }
    Ok(())
}

async fn execute_operation(
    shared: &Shared,
    disk: &dyn DiskWriter,
    op: StorageOperation,
    write_buffer_bytes: usize,
) -> Result<()> {
    {
        let mut active = shared.active_operations.lock().await;
        *active += 1;
    }

    let result: Result<()> = match op.kind {
        OperationKind::Write => {
            let data = op.data.as_deref().unwrap_or(&[]);
            write_chunked(disk, &op.file_path, data, write_buffer_bytes).await
        }
        OperationKind::Read => disk
            .read_chunk(&op.file_path, 0, op.size)
            .await
            .map(|_| ()),
        OperationKind::Delete => disk.delete(&op.file_path).await,
    };

    {
        let mut active = shared.active_operations.lock().await;
        *active = active.saturating_sub(1);
    }

    let mut stats = shared.stats.lock().await;
    stats.total_operations += 1;
    match &result {
        Ok(()) => {
            stats.successful_operations += 1;
            match op.kind {
                OperationKind::Write => stats.total_bytes_written += op.size,
                OperationKind::Read => stats.total_bytes_read += op.size,
                OperationKind::Delete => {}
            }
        }
        Err(_) => stats.failed_operations += 1,
    }
    drop(stats);

    if result.is_ok() {
        match op.kind {
            OperationKind::Write => {
                let mut files = shared.files.write().await;
                let now = Instant::now();
                let entry = files.entry(op.file_path.clone()).or_insert_with(|| FileInfo {
                    path: op.file_path.clone(),
                    size: 0,
                    created_at: now,
                    modified_at: now,
                    pieces_complete: 0,
                    pieces_total: 0,
                });
                entry.size = entry.size.max(op.size);
                entry.modified_at = now;
            }
            OperationKind::Delete => {
                shared.files.write().await.remove(&op.file_path);
            }
            OperationKind::Read => {}
        }
    }
    result
}

/// Service for managing file storage operations.
pub struct StorageService {
    conf: StorageServiceConf,
    health: Arc<ServiceHealth>,
    shared: Arc<Shared>,
    disk: Arc<dyn DiskWriter>,
    queue_tx: mpsc::UnboundedSender<StorageOperation>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<StorageOperation>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StorageService {
    pub fn new(
        conf: StorageServiceConf,
        health: Arc<ServiceHealth>,
        disk: Arc<dyn DiskWriter>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            conf,
            health,
            disk,
            shared: Arc::new(Shared {
                files: RwLock::new(HashMap::new()),
                stats: Mutex::new(Stats::default()),
                active_operations: Mutex::new(0),
            }),
            queue_tx: tx,
            queue_rx: Mutex::new(Some(rx)),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Queues a write, rejecting it up front if it exceeds the configured
    /// maximum file size. Rejection counts as a completed operation (both
    /// `total_operations` and `failed_operations` increment) without
    /// enqueueing or creating a file.
    pub async fn submit_write(&self, file_path: String, data: Vec<u8>) -> Result<()> {
        let size = data.len() as u64;
        if size > self.conf.max_file_size {
            let mut stats = self.shared.stats.lock().await;
            stats.total_operations += 1;
            stats.failed_operations += 1;
            return Err(ServiceError::Failed {
                name: "storage_service".to_string(),
                message: format!(
                    "write of {} bytes exceeds max file size {} bytes",
                    size, self.conf.max_file_size
                ),
            }
            .into());
        }
        self.queue_tx
            .send(StorageOperation {
                kind: OperationKind::Write,
                file_path,
                size,
                data: Some(data),
            })
            .map_err(Error::from)
    }

    pub fn submit_read(&self, file_path: String, size: u64) -> Result<()> {
        self.queue_tx
            .send(StorageOperation {
                kind: OperationKind::Read,
                file_path,
                size,
                data: None,
            })
            .map_err(Error::from)
    }

    pub fn submit_delete(&self, file_path: String) -> Result<()> {
        self.queue_tx
            .send(StorageOperation {
                kind: OperationKind::Delete,
                file_path,
                size: 0,
                data: None,
            })
            .map_err(Error::from)
    }

    pub async fn file_info(&self, path: &str) -> Option<FileInfo> {
        self.shared.files.read().await.get(path).cloned()
    }

    pub async fn list_files(&self) -> Vec<FileInfo> {
        self.shared.files.read().await.values().cloned().collect()
    }
}

fn spawn_worker(
    shared: Arc<Shared>,
    disk: Arc<dyn DiskWriter>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<StorageOperation>>>,
    write_buffer_bytes: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let op = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            match op {
                Some(op) => {
                    if let Err(e) =
                        execute_operation(&shared, disk.as_ref(), op, write_buffer_bytes).await
                    {
                        log::warn!("storage operation failed: {}", e);
                    }
                }
                None => break,
            }
        }
    })
}

impl Service for StorageService {
    fn name(&self) -> &str {
        "storage_service"
    }

    fn health(&self) -> &Arc<ServiceHealth> {
        &self.health
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            log::info!("starting storage service");
            let rx = self
                .queue_rx
                .lock()
                .await
                .take()
                .ok_or_else(|| ServiceError::Failed {
                    name: self.name().to_string(),
                    message: "operation queue already consumed".to_string(),
                })?;
            let rx = Arc::new(Mutex::new(rx));
            let write_buffer_bytes = (self.conf.write_buffer_kib as usize) * 1024;
            let mut workers = self.workers.lock().await;
            for _ in 0..self.conf.max_concurrent_operations {
                workers.push(spawn_worker(
                    self.shared.clone(),
                    self.disk.clone(),
                    rx.clone(),
                    write_buffer_bytes,
                ));
            }
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            log::info!("stopping storage service");
            let mut workers = self.workers.lock().await;
            for worker in workers.drain(..) {
                worker.abort();
            }
            self.shared.files.write().await.clear();
            Ok(())
        })
    }

    fn health_check(&self) -> BoxFuture<'_, HealthCheck> {
        Box::pin(async move {
            let start = Instant::now();
            let active = *self.shared.active_operations.lock().await as f64;
            let stats = self.shared.stats.lock().await;
            let healthy = active <= self.conf.max_concurrent_operations as f64
                && (stats.failed_operations as f64) < stats.total_operations as f64 * 0.1;
            let score = if stats.total_operations == 0 {
                1.0
            } else {
                stats.successful_operations as f64 / stats.total_operations as f64
            };
            HealthCheck {
                service_name: self.name().to_string(),
                healthy,
                score,
                message: format!(
                    "operations: {}/{}, success: {}/{}",
                    active as u64,
                    self.conf.max_concurrent_operations,
                    stats.successful_operations,
                    stats.total_operations
                ),
                timestamp: Instant::now(),
                response_time: start.elapsed(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn conf() -> StorageServiceConf {
        StorageServiceConf {
            max_concurrent_operations: 2,
            max_file_size: 1024,
            write_buffer_kib: 1,
        }
    }

    struct InMemoryDisk {
        files: Mutex<HashMap<String, Vec<u8>>>,
        chunk_writes: AtomicU64,
    }

    impl InMemoryDisk {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                files: Mutex::new(HashMap::new()),
                chunk_writes: AtomicU64::new(0),
            })
        }
    }

    impl DiskWriter for InMemoryDisk {
        fn write_chunk(
            &self,
            file_path: &str,
            offset: u64,
            data: &[u8],
        ) -> BoxFuture<'_, Result<()>> {
            let file_path = file_path.to_string();
            let data = data.to_vec();
            Box::pin(async move {
                self.chunk_writes.fetch_add(1, Ordering::SeqCst);
                let mut files = self.files.lock().await;
                let buf = files.entry(file_path).or_default();
                let end = offset as usize + data.len();
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[offset as usize..end].copy_from_slice(&data);
                Ok(())
            })
        }

        fn read_chunk(
            &self,
            file_path: &str,
            offset: u64,
            len: u64,
        ) -> BoxFuture<'_, Result<Vec<u8>>> {
            let file_path = file_path.to_string();
            Box::pin(async move {
                let files = self.files.lock().await;
                let buf = files.get(&file_path).cloned().unwrap_or_default();
                let start = offset as usize;
                let end = (start + len as usize).min(buf.len());
                Ok(buf.get(start..end).map(|s| s.to_vec()).unwrap_or_default())
            })
        }

        fn delete(&self, file_path: &str) -> BoxFuture<'_, Result<()>> {
            let file_path = file_path.to_string();
            Box::pin(async move {
                self.files.lock().await.remove(&file_path);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn submit_write_over_limit_is_rejected() {
        let svc = StorageService::new(
            conf(),
            ServiceHealth::new(5, Duration::from_secs(60)),
            InMemoryDisk::new(),
        );
        let data = vec![0u8; 2048];
        assert!(svc.submit_write("a.bin".to_string(), data).await.is_err());
        let check = svc.health_check().await;
        assert!(check.message.contains("success: 0/1"));
    }

    #[tokio::test]
    async fn submit_write_within_limit_eventually_registers_file() {
        let svc = StorageService::new(
            conf(),
            ServiceHealth::new(5, Duration::from_secs(60)),
            InMemoryDisk::new(),
        );
        svc.start().await.unwrap();
        svc.submit_write("a.bin".to_string(), vec![1, 2, 3])
            .await
            .unwrap();
        for _ in 0..50 {
            if svc.file_info("a.bin").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let info = svc.file_info("a.bin").await.unwrap();
        assert_eq!(info.size, 3);
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn large_write_is_split_into_chunks() {
        let disk = InMemoryDisk::new();
        let svc = StorageService::new(
            conf(),
            ServiceHealth::new(5, Duration::from_secs(60)),
            disk.clone(),
        );
        svc.start().await.unwrap();
        svc.submit_write("b.bin".to_string(), vec![7u8; 3000])
            .await
            .unwrap();
        for _ in 0..50 {
            if svc.file_info("b.bin").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(disk.chunk_writes.load(Ordering::SeqCst) >= 3);
        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn health_check_reports_full_score_with_no_operations() {
        let svc = StorageService::new(
            conf(),
            ServiceHealth::new(5, Duration::from_secs(60)),
            InMemoryDisk::new(),
        );
        let check = svc.health_check().await;
        assert_eq!(check.score, 1.0);
        assert!(check.healthy);
    }
}
