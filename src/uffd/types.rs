use std::fmt;

use serde::Deserialize;

/// Page size assumed when Firecracker does not send one.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// An address in the hypervisor's address space, as reported by the kernel in
/// fault records and by Firecracker in `base_host_virt_addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostAddr(pub u64);

impl HostAddr {
    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, len: u64) -> Option<HostAddr> {
        self.0.checked_add(len).map(HostAddr)
    }

    /// Round down to a multiple of `page_size` (a power of two).
    pub fn align_down(self, page_size: u64) -> HostAddr {
        HostAddr(self.0 & !(page_size - 1))
    }

    pub fn as_mut_ptr(self) -> *mut std::ffi::c_void {
        self.0 as usize as *mut std::ffi::c_void
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A byte offset into the snapshot memory file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileOffset(pub u64);

impl FileOffset {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous run of real (non-hole) data in the snapshot file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataExtent {
    pub offset: FileOffset,
    pub len: u64,
}

impl DataExtent {
    pub fn new(offset: u64, len: u64) -> Self {
        Self {
            offset: FileOffset(offset),
            len,
        }
    }

    /// One past the last byte of the extent.
    pub fn end(&self) -> u64 {
        self.offset.0 + self.len
    }
}

/// Whole-file extent map produced by the preloader.
#[derive(Debug, Clone)]
pub enum FileExtents {
    /// Sorted data extents covering the whole file.
    Sparse(std::sync::Arc<[DataExtent]>),
    /// The filesystem cannot report holes; every byte counts as data.
    Unsupported,
}

impl FileExtents {
    pub fn is_sparse(&self) -> bool {
        matches!(self, FileExtents::Sparse(_))
    }
}

/// Guest memory region as announced by Firecracker in the UFFD handshake.
///
/// The page size indicates the granularity faults are raised at:
/// - 4096 (4KB): standard pages
/// - 2097152 (2MB): hugepage-backed memory (`huge_pages: "2M"`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "RegionWire")]
pub struct MemoryRegion {
    pub base: HostAddr,
    pub size: u64,
    pub file_offset: FileOffset,
    pub page_size: u64,
}

/// On-the-wire layout of a region (`GuestRegionUffdMapping` in Firecracker).
#[derive(Deserialize)]
struct RegionWire {
    base_host_virt_addr: u64,
    size: u64,
    offset: u64,
    page_size: Option<u64>,
    /// Older Firecracker name for `page_size`. Holds bytes despite the name.
    page_size_kib: Option<u64>,
}

impl From<RegionWire> for MemoryRegion {
    fn from(wire: RegionWire) -> Self {
        MemoryRegion {
            base: HostAddr(wire.base_host_virt_addr),
            size: wire.size,
            file_offset: FileOffset(wire.offset),
            page_size: wire
                .page_size
                .or(wire.page_size_kib)
                .unwrap_or(DEFAULT_PAGE_SIZE),
        }
    }
}

impl MemoryRegion {
    /// Check if address is within this region (overflow-safe)
    pub fn contains(&self, addr: HostAddr) -> bool {
        if addr < self.base {
            return false;
        }
        match self.base.checked_add(self.size) {
            Some(end) => addr < end,
            None => true,
        }
    }

    /// One past the last file byte backing this region.
    pub fn file_end(&self) -> u64 {
        self.file_offset.0 + self.size
    }

    /// File offset backing `addr`. The address must lie inside the region.
    pub fn file_offset_of(&self, addr: HostAddr) -> FileOffset {
        FileOffset(self.file_offset.0 + (addr.0 - self.base.0))
    }

    /// Host address backing file offset `off`. The offset must lie inside the region.
    pub fn host_addr_of(&self, off: FileOffset) -> HostAddr {
        HostAddr(self.base.0 + (off.0 - self.file_offset.0))
    }

    /// Validate that this region has sensible values
    pub fn validate(&self) -> Result<(), String> {
        if self.size == 0 {
            return Err(format!("region has zero size at base {}", self.base));
        }
        if self.base.checked_add(self.size).is_none() {
            return Err(format!(
                "region range overflow: base {}, size {}",
                self.base, self.size
            ));
        }
        if self.file_offset.0.checked_add(self.size).is_none() {
            return Err(format!(
                "region file range overflow: offset {}, size {}",
                self.file_offset, self.size
            ));
        }
        if !self.page_size.is_power_of_two() {
            return Err(format!(
                "page size {} is not a power of two",
                self.page_size
            ));
        }
        Ok(())
    }
}
