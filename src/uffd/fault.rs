//! Lazy fault serving after eager population.
//!
//! Every data page was copied during the eager phase, so the faults that
//! still arrive are on holes and are answered with zero pages.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::extents::is_in_data_extent;
use super::mapping::SnapshotMapping;
use super::populate::RegionPlan;
use super::resolver::{set_nonblocking, zero_pages, PageResolver};
use super::types::{HostAddr, DEFAULT_PAGE_SIZE};

/// Size of `struct uffd_msg`.
pub const FAULT_RECORD_SIZE: usize = 32;

/// UFFD_EVENT_PAGEFAULT
pub const EVENT_PAGEFAULT: u8 = 0x12;
/// UFFD_EVENT_REMOVE (balloon deflation)
pub const EVENT_REMOVE: u8 = 0x15;

/// Records read per `read(2)`.
const MAX_BATCH: usize = 16;

/// A decoded fault-notification record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultRecord {
    PageFault { addr: HostAddr },
    Remove,
    Unknown(u8),
}

impl FaultRecord {
    /// Decode one record: byte 0 is the event type, bytes 16..24 the
    /// faulting address in native byte order.
    pub fn parse(record: &[u8; FAULT_RECORD_SIZE]) -> Self {
        match record[0] {
            EVENT_PAGEFAULT => {
                let mut addr = [0u8; 8];
                addr.copy_from_slice(&record[16..24]);
                FaultRecord::PageFault {
                    addr: HostAddr(u64::from_ne_bytes(addr)),
                }
            }
            EVENT_REMOVE => FaultRecord::Remove,
            other => FaultRecord::Unknown(other),
        }
    }
}

/// Decode every whole record in `buf`; a trailing partial record is dropped.
pub fn parse_records(buf: &[u8]) -> impl Iterator<Item = FaultRecord> + '_ {
    buf.chunks_exact(FAULT_RECORD_SIZE).map(|chunk| {
        let mut record = [0u8; FAULT_RECORD_SIZE];
        record.copy_from_slice(chunk);
        FaultRecord::parse(&record)
    })
}

/// Counters reported when the lazy loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LazyStats {
    pub faults: u64,
    pub zero_filled: u64,
    pub copied: u64,
    pub removes: u64,
    pub ignored: u64,
}

/// Borrowed descriptor registered with the tokio reactor. The resolver that
/// owns it outlives the server.
struct FaultFd(RawFd);

impl AsRawFd for FaultFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

fn read_records(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Serves faults on pages the eager phase did not populate.
pub struct LazyFaultServer<R> {
    resolver: Arc<R>,
    plans: Arc<[RegionPlan]>,
    mapping: Arc<SnapshotMapping>,
}

impl<R: PageResolver> LazyFaultServer<R> {
    pub fn new(resolver: Arc<R>, plans: Arc<[RegionPlan]>, mapping: Arc<SnapshotMapping>) -> Self {
        Self {
            resolver,
            plans,
            mapping,
        }
    }

    /// Serve faults until `cancel` fires or the descriptor goes away (the
    /// guest was destroyed). Neither is an error.
    pub async fn run(self, cancel: CancellationToken) -> LazyStats {
        let mut stats = LazyStats::default();
        let start = Instant::now();
        let fd = self.resolver.as_raw_fd();

        if let Err(e) = set_nonblocking(fd) {
            debug!(target: "uffd", error = %e, "fault descriptor unusable, lazy handler not started");
            return stats;
        }
        let async_fd = match AsyncFd::with_interest(FaultFd(fd), Interest::READABLE) {
            Ok(afd) => afd,
            Err(e) => {
                debug!(target: "uffd", error = %e, "registering fault descriptor failed");
                return stats;
            }
        };

        info!(target: "uffd", regions = self.plans.len(), "lazy fault handler started");
        let mut buf = [0u8; FAULT_RECORD_SIZE * MAX_BATCH];

        loop {
            let mut guard = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                ready = async_fd.readable() => match ready {
                    Ok(guard) => guard,
                    Err(e) => {
                        debug!(target: "uffd", error = %e, "waiting for fault descriptor failed");
                        break;
                    }
                },
            };

            let n = match guard.try_io(|inner| read_records(inner.get_ref().0, &mut buf)) {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => {
                    debug!(target: "uffd", error = %e, "fault descriptor read failed");
                    break;
                }
                Err(_would_block) => continue,
            };

            for record in parse_records(&buf[..n]) {
                self.handle(record, &mut stats);
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            stats.faults as f64 / elapsed
        } else {
            0.0
        };
        info!(
            target: "uffd",
            faults = stats.faults,
            zero_filled = stats.zero_filled,
            copied = stats.copied,
            removes = stats.removes,
            elapsed_secs = format!("{:.1}", elapsed),
            pages_per_sec = format!("{:.0}", rate),
            "lazy fault handler exited"
        );
        stats
    }

    fn handle(&self, record: FaultRecord, stats: &mut LazyStats) {
        match record {
            FaultRecord::PageFault { addr } => {
                stats.faults += 1;
                self.resolve_fault(addr, stats);
            }
            // Balloon deflation: no action needed
            FaultRecord::Remove => stats.removes += 1,
            FaultRecord::Unknown(event) => {
                stats.ignored += 1;
                debug!(target: "uffd", event, "ignoring unknown UFFD event");
            }
        }
    }

    fn resolve_fault(&self, addr: HostAddr, stats: &mut LazyStats) {
        let Some(plan) = self.plans.iter().find(|p| p.region.contains(addr)) else {
            // Not in any region; unblock the vCPU with a zero page.
            warn!(target: "uffd", fault_addr = %addr, "page fault outside all regions");
            self.zero_fill(addr.align_down(DEFAULT_PAGE_SIZE), DEFAULT_PAGE_SIZE, stats);
            return;
        };

        let page_size = plan.region.page_size;
        let page = addr.align_down(page_size).max(plan.region.base);
        let file_offset = plan.region.file_offset_of(page);

        if is_in_data_extent(file_offset, &plan.extents) {
            // Eager population should have covered this page.
            warn!(
                target: "uffd",
                fault_addr = %addr,
                file_offset = file_offset.raw(),
                "page fault on a data page, copying from snapshot"
            );
            if let Some(src) = self.mapping.padded(file_offset, page_size) {
                match self.resolver.copy(page, &src) {
                    Ok(_) => stats.copied += 1,
                    Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                        debug!(target: "uffd", fault_addr = %addr, "page already filled (EEXIST)");
                    }
                    Err(e) => {
                        warn!(target: "uffd", fault_addr = %addr, error = %e, "UFFD copy failed");
                    }
                }
                return;
            }
        }

        self.zero_fill(page, page_size, stats);
    }

    fn zero_fill(&self, page: HostAddr, page_size: u64, stats: &mut LazyStats) {
        match zero_pages(&*self.resolver, page, page_size, page_size) {
            Ok(_) => stats.zero_filled += 1,
            // EEXIST: another fault on the same page won the race
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                debug!(target: "uffd", page = %page, "zero page skipped - page already filled (EEXIST)");
            }
            Err(e) => {
                warn!(target: "uffd", page = %page, error = %e, "UFFD zeropage failed");
            }
        }
    }
}
