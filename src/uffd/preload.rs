//! Snapshot preloading.
//!
//! Opening, mapping and hinting the snapshot happens synchronously when the
//! handler is built. Extent scanning and page cache warming run on a blocking
//! task so their I/O overlaps Firecracker's own startup (~150ms), and the file
//! is mostly cached by the time UFFDIO_COPY starts.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::SetupError;
use super::extents::{scan_data_extents, ScanError};
use super::mapping::SnapshotMapping;
use super::types::{DataExtent, FileExtents};

/// Read buffer used while warming the page cache.
pub const DEFAULT_WARM_CHUNK_SIZE: usize = 1024 * 1024;

/// Default number of parallel readers for [`warm_snapshot_file`].
pub const DEFAULT_WARM_READERS: usize = 4;

/// Handle to a snapshot being preloaded in the background.
pub struct Preloader {
    mapping: Arc<SnapshotMapping>,
    extents_rx: Option<oneshot::Receiver<FileExtents>>,
    extents: Option<FileExtents>,
    warm_rx: Option<oneshot::Receiver<()>>,
    task: Option<JoinHandle<()>>,
}

impl Preloader {
    /// Map `path` and start scanning and warming it in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        path: &Path,
        warm_chunk_size: usize,
        cancel: CancellationToken,
    ) -> Result<Self, SetupError> {
        let mapping = Arc::new(SnapshotMapping::open(path)?);
        mapping.advise();

        info!(
            target: "uffd",
            mem_file = %mapping.path().display(),
            mem_size_mb = mapping.len() / (1024 * 1024),
            "mapped snapshot memory file"
        );

        let (extents_tx, extents_rx) = oneshot::channel();
        let (warm_tx, warm_rx) = oneshot::channel();
        let background = Arc::clone(&mapping);
        let task = tokio::task::spawn_blocking(move || {
            let extents = compute_extents(&background);
            let _ = extents_tx.send(extents.clone());
            let start = Instant::now();
            let warmed = warm(&background, &extents, warm_chunk_size.max(1), &cancel);
            debug!(
                target: "uffd",
                warmed_mb = warmed / (1024 * 1024),
                elapsed_ms = start.elapsed().as_millis() as u64,
                cancelled = cancel.is_cancelled(),
                "page cache warming finished"
            );
            let _ = warm_tx.send(());
        });

        Ok(Self {
            mapping,
            extents_rx: Some(extents_rx),
            extents: None,
            warm_rx: Some(warm_rx),
            task: Some(task),
        })
    }

    pub fn mapping(&self) -> &Arc<SnapshotMapping> {
        &self.mapping
    }

    /// Whole-file extent map. If the background task died the file is
    /// treated as fully dense.
    pub async fn extents(&mut self) -> FileExtents {
        if let Some(rx) = self.extents_rx.take() {
            self.extents = Some(rx.await.unwrap_or(FileExtents::Unsupported));
        }
        self.extents.clone().unwrap_or(FileExtents::Unsupported)
    }

    /// Resolves once page cache warming has finished (or was abandoned).
    pub async fn warmed(&mut self) {
        if let Some(rx) = self.warm_rx.take() {
            let _ = rx.await;
        }
    }

    /// Wait for the background task to exit and drop its hold on the
    /// mapping. Cancel first to cut warming short.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(target: "uffd", error = %e, "preload task failed");
            }
        }
    }
}

fn compute_extents(mapping: &SnapshotMapping) -> FileExtents {
    let start = Instant::now();
    match scan_data_extents(mapping.file(), 0, mapping.len()) {
        Ok(extents) => {
            let data: u64 = extents.iter().map(|e| e.len).sum();
            info!(
                target: "uffd",
                extents = extents.len(),
                data_mb = data / (1024 * 1024),
                file_mb = mapping.len() / (1024 * 1024),
                elapsed_us = start.elapsed().as_micros() as u64,
                "scanned snapshot data extents"
            );
            FileExtents::Sparse(extents.into())
        }
        Err(e) => {
            info!(
                target: "uffd",
                error = %e,
                "sparse scan unavailable, treating snapshot as fully dense"
            );
            FileExtents::Unsupported
        }
    }
}

/// Read the data extents (or the whole file) sequentially to pull them into
/// the page cache. Returns the number of bytes read.
fn warm(
    mapping: &SnapshotMapping,
    extents: &FileExtents,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> u64 {
    let whole_file = [DataExtent::new(0, mapping.len())];
    let ranges: &[DataExtent] = match extents {
        FileExtents::Sparse(extents) => &extents[..],
        FileExtents::Unsupported => &whole_file,
    };
    let mut buf = vec![0u8; chunk_size];
    read_ranges(mapping.file(), ranges, &mut buf, cancel)
}

fn read_ranges(
    file: &File,
    ranges: &[DataExtent],
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> u64 {
    let mut total = 0u64;
    for ext in ranges {
        let mut off = ext.offset.raw();
        while off < ext.end() {
            if cancel.is_cancelled() {
                return total;
            }
            let len = (ext.end() - off).min(buf.len() as u64) as usize;
            match file.read_at(&mut buf[..len], off) {
                Ok(0) => break,
                Ok(n) => {
                    total += n as u64;
                    off += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(target: "uffd", offset = off, error = %e, "warm read failed");
                    break;
                }
            }
        }
    }
    total
}

fn fadvise(file: &File, offset: u64, len: u64, advice: libc::c_int) {
    let ret = unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            offset as libc::off_t,
            len as libc::off_t,
            advice,
        )
    };
    if ret != 0 {
        debug!(target: "uffd", errno = ret, offset, len, "posix_fadvise failed");
    }
}

/// Split `extents` into at most `readers` groups of roughly equal byte count.
fn split_by_bytes(extents: &[DataExtent], readers: usize) -> Vec<Vec<DataExtent>> {
    let readers = readers.max(1);
    let total: u64 = extents.iter().map(|e| e.len).sum();
    let per_reader = total / readers as u64;

    let mut groups = Vec::new();
    let mut iter = extents.iter().peekable();
    for r in 0..readers {
        if iter.peek().is_none() {
            break;
        }
        let mut group = Vec::new();
        let mut bytes = 0u64;
        for ext in iter.by_ref() {
            group.push(*ext);
            bytes += ext.len;
            if r < readers - 1 && bytes >= per_reader {
                break;
            }
        }
        groups.push(group);
    }
    groups
}

/// Pull a snapshot's data extents into the page cache ahead of a restore.
///
/// Issues WILLNEED for every extent, then reads them with `readers` parallel
/// readers, each on its own file handle so the block layer can queue them
/// independently. On filesystems without hole detection only a whole-file
/// WILLNEED hint is issued. Returns the number of bytes read.
pub fn warm_snapshot_file(path: &Path, readers: usize) -> io::Result<u64> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    if size == 0 {
        return Ok(0);
    }

    fadvise(&file, 0, size, libc::POSIX_FADV_SEQUENTIAL);

    let extents = match scan_data_extents(&file, 0, size) {
        Ok(extents) => extents,
        Err(ScanError::Unsupported(_)) => {
            fadvise(&file, 0, size, libc::POSIX_FADV_WILLNEED);
            return Ok(0);
        }
        Err(e) => return Err(io::Error::other(e)),
    };
    for ext in &extents {
        fadvise(&file, ext.offset.raw(), ext.len, libc::POSIX_FADV_WILLNEED);
    }

    let groups = split_by_bytes(&extents, readers);
    let never = CancellationToken::new();
    std::thread::scope(|scope| {
        let handles: Vec<_> = groups
            .iter()
            .map(|group| {
                let never = &never;
                scope.spawn(move || -> io::Result<u64> {
                    let reader = File::open(path)?;
                    let mut buf = vec![0u8; DEFAULT_WARM_CHUNK_SIZE];
                    Ok(read_ranges(&reader, group, &mut buf, never))
                })
            })
            .collect();

        let mut total = 0u64;
        for handle in handles {
            match handle.join() {
                Ok(Ok(n)) => total += n,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(io::Error::other("warm reader panicked")),
            }
        }
        Ok(total)
    })
}
