use std::borrow::Cow;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use memmap2::{Advice, Mmap, MmapOptions};
use tracing::debug;

use super::error::SetupError;
use super::types::FileOffset;

/// Read-only mapping of the snapshot memory file.
///
/// Every read goes through [`SnapshotMapping::slice`], which bounds-checks the
/// requested file range, so copy jobs carry offsets rather than pointers.
pub struct SnapshotMapping {
    path: PathBuf,
    file: File,
    mmap: Mmap,
}

impl SnapshotMapping {
    /// Open and map `path` without populating it. Returns immediately; the
    /// kernel faults pages in on first access.
    pub fn open(path: &Path) -> Result<Self, SetupError> {
        let file = File::open(path).map_err(|source| SetupError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let len = file
            .metadata()
            .map_err(|source| SetupError::Stat {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        if len == 0 {
            return Err(SetupError::EmptyFile {
                path: path.to_path_buf(),
            });
        }

        // Safety: the snapshot is opened read-only and never modified while
        // the handler lives.
        let mmap = unsafe { MmapOptions::new().len(len as usize).map(&file) }.map_err(
            |source| SetupError::Map {
                path: path.to_path_buf(),
                source,
            },
        )?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mmap,
        })
    }

    /// Issue best-effort access hints: sequential readahead for the file,
    /// WILLNEED and transparent huge pages for the mapping.
    pub fn advise(&self) {
        let ret = unsafe {
            libc::posix_fadvise(
                self.file.as_raw_fd(),
                0,
                self.len() as libc::off_t,
                libc::POSIX_FADV_SEQUENTIAL,
            )
        };
        if ret != 0 {
            debug!(target: "uffd", errno = ret, "posix_fadvise(SEQUENTIAL) failed");
        }
        if let Err(e) = self.mmap.advise(Advice::WillNeed) {
            debug!(target: "uffd", error = %e, "madvise(WILLNEED) failed");
        }
        if let Err(e) = self.mmap.advise(Advice::HugePage) {
            debug!(target: "uffd", error = %e, "madvise(HUGEPAGE) failed");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Bytes `[offset, offset + len)` of the file, or `None` if the range
    /// leaves the mapping.
    pub fn slice(&self, offset: FileOffset, len: u64) -> Option<&[u8]> {
        let start = usize::try_from(offset.raw()).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        self.mmap.get(start..end)
    }

    /// Like [`slice`](Self::slice), but a range running past the end of the
    /// file is returned zero-padded to `len` bytes. `None` if `offset` is at
    /// or past the end of the file.
    pub fn padded(&self, offset: FileOffset, len: u64) -> Option<Cow<'_, [u8]>> {
        if let Some(bytes) = self.slice(offset, len) {
            return Some(Cow::Borrowed(bytes));
        }
        let start = usize::try_from(offset.raw()).ok()?;
        let available = self.mmap.get(start..).filter(|rest| !rest.is_empty())?;
        // Heap-allocate (2MB on stack would overflow for hugepages)
        let mut page = vec![0u8; usize::try_from(len).ok()?];
        let n = available.len().min(page.len());
        page[..n].copy_from_slice(&available[..n]);
        Some(Cow::Owned(page))
    }
}

impl std::fmt::Debug for SnapshotMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotMapping")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}
