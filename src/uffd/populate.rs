//! Eager population: turn regions × data extents into bounded copy jobs and
//! resolve them with UFFDIO_COPY across a fixed pool of worker threads.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::error::PopulateError;
use super::extents::{clip_to_region, page_align};
use super::mapping::SnapshotMapping;
use super::resolver::{zero_pages, PageResolver};
use super::types::{DataExtent, FileExtents, FileOffset, HostAddr, MemoryRegion};

/// Size of each UFFDIO_COPY request. 128MB chunks balance ioctl count against
/// memory bandwidth across the copy workers.
pub const DEFAULT_COPY_CHUNK_SIZE: u64 = 128 * 1024 * 1024;

/// Number of parallel copy workers.
pub const DEFAULT_COPY_WORKERS: usize = 4;

/// A region paired with the data extents (absolute file offsets) it must copy.
#[derive(Debug, Clone)]
pub struct RegionPlan {
    pub region: MemoryRegion,
    pub extents: Vec<DataExtent>,
    /// Page-aligned part of the region past the end of the snapshot file,
    /// zero-filled eagerly when no lazy server will run.
    pub unbacked: Option<DataExtent>,
}

/// Where a job's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSource {
    Snapshot,
    Zero,
}

/// One bounded unit of eager-copy work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyJob {
    /// Submission order; used to pick the reported error.
    pub index: usize,
    pub dst: HostAddr,
    pub src: FileOffset,
    pub len: u64,
    pub page_size: u64,
    pub source: JobSource,
}

/// Summary of a successful eager phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PopulateReport {
    pub jobs: usize,
    pub workers: usize,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Pair each region with its data extents.
///
/// With a sparse scan the whole-file extents are clipped to each region and
/// anything else is left to the lazy server. Otherwise every region is one
/// extent bounded by the file length, and whatever lies past the end of the
/// file is marked for eager zero-filling.
pub fn plan_regions(
    regions: &[MemoryRegion],
    extents: &FileExtents,
    file_len: u64,
) -> Vec<RegionPlan> {
    regions
        .iter()
        .map(|region| {
            let mut unbacked = None;
            let extents = match extents {
                FileExtents::Sparse(all) => clip_to_region(all, region.file_offset, region.size),
                FileExtents::Unsupported => {
                    let start = region.file_offset.raw();
                    let end = region.file_end().min(file_len);
                    let backed = if end > start {
                        vec![DataExtent::new(start, end - start)]
                    } else {
                        Vec::new()
                    };
                    if end < region.file_end() {
                        warn!(
                            target: "uffd",
                            base = %region.base,
                            region_end = region.file_end(),
                            file_len,
                            "region extends past the snapshot file, zero-filling the unbacked part"
                        );
                        let page_size = region.page_size;
                        let backed_end =
                            start + end.saturating_sub(start).div_ceil(page_size) * page_size;
                        unbacked = (backed_end < region.file_end())
                            .then(|| DataExtent::new(backed_end, region.file_end() - backed_end));
                    }
                    backed
                }
            };
            RegionPlan {
                region: *region,
                extents,
                unbacked,
            }
        })
        .collect()
}

/// Slice every plan's page-aligned extents, then its unbacked tail, into jobs
/// of at most `chunk_size` bytes (rounded down to a page multiple).
pub fn build_jobs(plans: &[RegionPlan], chunk_size: u64) -> Vec<CopyJob> {
    let mut jobs = Vec::new();
    for plan in plans {
        let region = &plan.region;
        let page_size = region.page_size;
        let chunk = (chunk_size / page_size * page_size).max(page_size);
        let aligned = page_align(&plan.extents, page_size, region.file_offset, region.file_end());

        let ranges = aligned
            .into_iter()
            .map(|ext| (ext, JobSource::Snapshot))
            .chain(plan.unbacked.map(|ext| (ext, JobSource::Zero)));
        for (ext, source) in ranges {
            let mut off = ext.offset.raw();
            while off < ext.end() {
                let len = chunk.min(ext.end() - off);
                jobs.push(CopyJob {
                    index: jobs.len(),
                    dst: region.host_addr_of(FileOffset(off)),
                    src: FileOffset(off),
                    len,
                    page_size,
                    source,
                });
                off += len;
            }
        }
    }
    jobs
}

fn resolve_job<R: PageResolver>(
    job: &CopyJob,
    mapping: &SnapshotMapping,
    resolver: &R,
) -> Result<u64, PopulateError> {
    let copy_error = |source| PopulateError::Copy {
        index: job.index,
        dst: job.dst,
        src: job.src,
        len: job.len,
        source,
    };
    if job.source == JobSource::Zero {
        return zero_pages(resolver, job.dst, job.len, job.page_size).map_err(copy_error);
    }

    let out_of_bounds = || PopulateError::OutOfBounds {
        index: job.index,
        src: job.src,
        len: job.len,
    };
    // Whole pages come straight from the mapping. A last page cut short by
    // the end of the file is copied from a zero-padded buffer.
    let available = mapping.len().saturating_sub(job.src.raw()).min(job.len);
    let direct = if available == job.len {
        job.len
    } else {
        available / job.page_size * job.page_size
    };
    let tail = job.len - direct;
    if tail > job.page_size {
        return Err(out_of_bounds());
    }

    let mut done = 0u64;
    if direct > 0 {
        let src = mapping.slice(job.src, direct).ok_or_else(out_of_bounds)?;
        done += copy_all(job, resolver, 0, src)?;
    }
    if tail > 0 {
        let page = mapping
            .padded(FileOffset(job.src.raw() + direct), tail)
            .ok_or_else(out_of_bounds)?;
        done += copy_all(job, resolver, direct, &page)?;
    }
    Ok(done)
}

/// Copy `src` to `job.dst + offset`, continuing after short copies.
fn copy_all<R: PageResolver>(
    job: &CopyJob,
    resolver: &R,
    offset: u64,
    src: &[u8],
) -> Result<u64, PopulateError> {
    let mut done = 0usize;
    while done < src.len() {
        let dst = HostAddr(job.dst.raw() + offset + done as u64);
        let copied = resolver
            .copy(dst, &src[done..])
            .map_err(|source| PopulateError::Copy {
                index: job.index,
                dst: job.dst,
                src: job.src,
                len: job.len,
                source,
            })?;
        if copied == 0 {
            return Err(PopulateError::NoProgress {
                index: job.index,
                dst: job.dst,
                copied: offset + done as u64,
            });
        }
        done += copied;
    }
    Ok(done as u64)
}

/// Resolve `jobs` on `min(workers, jobs.len())` threads.
///
/// Workers take jobs in submission order. The first failure stops further
/// dispatch; of the failures seen, the one with the lowest job index is
/// returned. Pages injected before a failure stay injected.
pub fn populate<R: PageResolver>(
    jobs: &[CopyJob],
    workers: usize,
    mapping: &SnapshotMapping,
    resolver: &R,
    cancel: &CancellationToken,
) -> Result<PopulateReport, PopulateError> {
    let start = Instant::now();
    if jobs.is_empty() {
        return Ok(PopulateReport::default());
    }
    let workers = workers.clamp(1, jobs.len());

    let next = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);
    let bytes = AtomicU64::new(0);
    let first_error: Mutex<Option<PopulateError>> = Mutex::new(None);

    let record = |err: PopulateError| {
        failed.store(true, Ordering::SeqCst);
        let mut slot = first_error.lock().unwrap_or_else(|e| e.into_inner());
        if slot
            .as_ref()
            .map_or(true, |current| job_index(&err) < job_index(current))
        {
            *slot = Some(err);
        }
    };

    let panicked = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(|| loop {
                    if failed.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        return;
                    }
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    let Some(job) = jobs.get(i) else {
                        return;
                    };
                    match resolve_job(job, mapping, resolver) {
                        Ok(n) => {
                            bytes.fetch_add(n, Ordering::Relaxed);
                        }
                        Err(e) => record(e),
                    }
                })
            })
            .collect();
        handles.into_iter().any(|h| h.join().is_err())
    });

    if let Some(err) = first_error.into_inner().unwrap_or_else(|e| e.into_inner()) {
        return Err(err);
    }
    if panicked {
        return Err(PopulateError::WorkerPanicked);
    }
    if next.load(Ordering::SeqCst) < jobs.len() && cancel.is_cancelled() {
        return Err(PopulateError::Cancelled);
    }

    Ok(PopulateReport {
        jobs: jobs.len(),
        workers,
        bytes: bytes.into_inner(),
        elapsed: start.elapsed(),
    })
}

fn job_index(err: &PopulateError) -> usize {
    match err {
        PopulateError::Copy { index, .. }
        | PopulateError::NoProgress { index, .. }
        | PopulateError::OutOfBounds { index, .. } => *index,
        _ => usize::MAX,
    }
}
