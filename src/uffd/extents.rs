//! Sparse-file extent reasoning: SEEK_DATA/SEEK_HOLE scanning, per-region
//! clipping and page alignment.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use super::types::{DataExtent, FileOffset};

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// The filesystem does not support hole detection.
    #[error("SEEK_DATA/SEEK_HOLE not supported")]
    Unsupported(#[source] io::Error),

    #[error("{whence} at {offset}")]
    Seek {
        whence: &'static str,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("scan range overflows: offset {offset}, size {size}")]
    Range { offset: u64, size: u64 },
}

fn seek(file: &File, offset: u64, whence: libc::c_int) -> io::Result<u64> {
    let pos = unsafe { libc::lseek64(file.as_raw_fd(), offset as libc::off64_t, whence) };
    if pos < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pos as u64)
}

fn is_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS)
    ) || err.raw_os_error() == Some(libc::ENOTSUP)
}

/// Find the data extents of `file` inside `[range_offset, range_offset + range_size)`.
///
/// Extents come back sorted, non-overlapping and clipped to the range. A
/// zero-length range yields an empty list.
pub fn scan_data_extents(
    file: &File,
    range_offset: u64,
    range_size: u64,
) -> Result<Vec<DataExtent>, ScanError> {
    let end = range_offset
        .checked_add(range_size)
        .ok_or(ScanError::Range {
            offset: range_offset,
            size: range_size,
        })?;
    let mut pos = range_offset;
    let mut first = true;
    let mut extents = Vec::new();

    while pos < end {
        let data_start = match seek(file, pos, libc::SEEK_DATA) {
            Ok(p) => p,
            // ENXIO: no data at or after pos, the rest is hole
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => break,
            Err(e) if first && is_unsupported(&e) => return Err(ScanError::Unsupported(e)),
            Err(e) => {
                return Err(ScanError::Seek {
                    whence: "SEEK_DATA",
                    offset: pos,
                    source: e,
                })
            }
        };
        if data_start >= end {
            break;
        }

        let hole_start = match seek(file, data_start, libc::SEEK_HOLE) {
            Ok(p) => p.min(end),
            Err(e) if first && is_unsupported(&e) => return Err(ScanError::Unsupported(e)),
            Err(_) => end,
        };
        first = false;

        extents.push(DataExtent::new(data_start, hole_start - data_start));
        pos = hole_start;
    }

    Ok(extents)
}

/// Return the parts of whole-file `extents` overlapping
/// `[region_offset, region_offset + region_size)`, trimmed to that range.
pub fn clip_to_region(
    extents: &[DataExtent],
    region_offset: FileOffset,
    region_size: u64,
) -> Vec<DataExtent> {
    let region_start = region_offset.raw();
    let region_end = region_start.saturating_add(region_size);
    extents
        .iter()
        .filter(|ext| ext.end() > region_start && ext.offset.raw() < region_end)
        .map(|ext| {
            let start = ext.offset.raw().max(region_start);
            let end = ext.end().min(region_end);
            DataExtent::new(start, end - start)
        })
        .collect()
}

/// Whether file offset `offset` falls inside one of the sorted `extents`.
pub fn is_in_data_extent(offset: FileOffset, extents: &[DataExtent]) -> bool {
    let i = extents.partition_point(|ext| ext.end() <= offset.raw());
    i < extents.len() && offset >= extents[i].offset
}

/// Widen sorted extents to whole pages of `page_size` relative to
/// `[region_start, region_end)`, merging extents that end up sharing a page.
///
/// UFFDIO_COPY needs page-aligned ranges; hole bytes pulled in by the widening
/// read as zero from the mapping.
pub fn page_align(
    extents: &[DataExtent],
    page_size: u64,
    region_start: FileOffset,
    region_end: u64,
) -> Vec<DataExtent> {
    let base = region_start.raw();
    let mut out: Vec<DataExtent> = Vec::with_capacity(extents.len());
    for ext in extents {
        let rel_start = (ext.offset.raw() - base) / page_size * page_size;
        let rel_end = (ext.end() - base).div_ceil(page_size) * page_size;
        let start = base + rel_start;
        let end = (base + rel_end).min(region_end);
        match out.last_mut() {
            Some(prev) if start <= prev.end() => {
                if end > prev.end() {
                    prev.len = end - prev.offset.raw();
                }
            }
            _ => out.push(DataExtent::new(start, end - start)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    const MIB: u64 = 1024 * 1024;

    fn ext(offset: u64, len: u64) -> DataExtent {
        DataExtent::new(offset, len)
    }

    /// Build a file with data at the given (offset, len) ranges and holes elsewhere.
    fn sparse_file(size: u64, data: &[(u64, u64)]) -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem");
        let mut f = File::options()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        f.set_len(size).unwrap();
        for &(off, len) in data {
            f.seek(SeekFrom::Start(off)).unwrap();
            f.write_all(&vec![0xA5; len as usize]).unwrap();
        }
        f.sync_all().unwrap();
        (dir, f)
    }

    #[test]
    fn test_scan_zero_length_range() {
        let (_dir, f) = sparse_file(MIB, &[(0, MIB)]);
        assert!(scan_data_extents(&f, 0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_scan_matches_constructed_layout() {
        let layout = [(0, MIB), (4 * MIB, 2 * MIB), (10 * MIB, MIB)];
        let size = 16 * MIB;
        let (_dir, f) = sparse_file(size, &layout);

        let extents = match scan_data_extents(&f, 0, size) {
            Ok(e) => e,
            Err(ScanError::Unsupported(_)) => {
                eprintln!("skipping: filesystem does not support SEEK_DATA");
                return;
            }
            Err(e) => panic!("scan failed: {e}"),
        };
        if extents.len() == 1 && extents[0] == ext(0, size) {
            eprintln!("skipping: filesystem reports no holes");
            return;
        }

        let expected: Vec<DataExtent> = layout.iter().map(|&(o, l)| ext(o, l)).collect();
        assert_eq!(extents, expected);

        // Sorted, non-overlapping; complement is exactly the holes.
        for pair in extents.windows(2) {
            assert!(pair[0].end() < pair[1].offset.raw());
        }
        let mut holes = Vec::new();
        let mut cursor = 0;
        for e in &extents {
            if e.offset.raw() > cursor {
                holes.push((cursor, e.offset.raw()));
            }
            cursor = e.end();
        }
        if cursor < size {
            holes.push((cursor, size));
        }
        assert_eq!(
            holes,
            vec![(MIB, 4 * MIB), (6 * MIB, 10 * MIB), (11 * MIB, 16 * MIB)]
        );
    }

    #[test]
    fn test_scan_subrange_is_clipped() {
        let (_dir, f) = sparse_file(8 * MIB, &[(0, 4 * MIB)]);
        let extents = match scan_data_extents(&f, MIB, 2 * MIB) {
            Ok(e) => e,
            Err(ScanError::Unsupported(_)) => return,
            Err(e) => panic!("scan failed: {e}"),
        };
        assert_eq!(extents, vec![ext(MIB, 2 * MIB)]);
    }

    #[test]
    fn test_scan_all_hole_file() {
        let (_dir, f) = sparse_file(4 * MIB, &[]);
        match scan_data_extents(&f, 0, 4 * MIB) {
            Ok(e) => assert!(e.is_empty() || e == vec![ext(0, 4 * MIB)]),
            Err(ScanError::Unsupported(_)) => {}
            Err(e) => panic!("scan failed: {e}"),
        }
    }

    #[test]
    fn test_scan_range_overflow() {
        let (_dir, f) = sparse_file(4096, &[(0, 4096)]);
        assert!(matches!(
            scan_data_extents(&f, u64::MAX, 2),
            Err(ScanError::Range { .. })
        ));
    }

    #[test]
    fn test_clip_inside_extent_unchanged() {
        let extents = [ext(0x1000, 0x1000), ext(0x4000, 0x2000)];
        assert_eq!(clip_to_region(&extents, FileOffset(0), 0x10000), extents);
    }

    #[test]
    fn test_clip_trims_to_boundaries() {
        let extents = [ext(0, 0x3000), ext(0x5000, 0x1000), ext(0x7000, 0x3000)];
        let clipped = clip_to_region(&extents, FileOffset(0x2000), 0x6000);
        assert_eq!(
            clipped,
            vec![ext(0x2000, 0x1000), ext(0x5000, 0x1000), ext(0x7000, 0x1000)]
        );
        for e in &clipped {
            assert!(e.offset.raw() >= 0x2000 && e.end() <= 0x8000);
        }
    }

    #[test]
    fn test_clip_no_overlap() {
        let extents = [ext(0, 0x1000), ext(0x9000, 0x1000)];
        assert!(clip_to_region(&extents, FileOffset(0x1000), 0x8000).is_empty());
        assert!(clip_to_region(&[], FileOffset(0), 0x8000).is_empty());
    }

    #[test]
    fn test_clip_extent_spanning_region() {
        let extents = [ext(0, 0x10000)];
        assert_eq!(
            clip_to_region(&extents, FileOffset(0x4000), 0x2000),
            vec![ext(0x4000, 0x2000)]
        );
    }

    #[test]
    fn test_is_in_data_extent() {
        let extents = [ext(0x1000, 0x1000), ext(0x4000, 0x2000)];
        assert!(!is_in_data_extent(FileOffset(0), &extents));
        assert!(is_in_data_extent(FileOffset(0x1000), &extents));
        assert!(is_in_data_extent(FileOffset(0x1FFF), &extents));
        assert!(!is_in_data_extent(FileOffset(0x2000), &extents));
        assert!(is_in_data_extent(FileOffset(0x5FFF), &extents));
        assert!(!is_in_data_extent(FileOffset(0x6000), &extents));
        assert!(!is_in_data_extent(FileOffset(0x1000), &[]));
    }

    #[test]
    fn test_page_align_widens_and_merges() {
        let extents = [ext(100, 200), ext(300, 10), ext(0x2100, 0x100)];
        assert_eq!(
            page_align(&extents, 4096, FileOffset(0), 0x10000),
            vec![ext(0, 0x1000), ext(0x2000, 0x1000)]
        );
    }

    #[test]
    fn test_page_align_respects_region_end() {
        let extents = [ext(0x1800, 0x100)];
        assert_eq!(
            page_align(&extents, 4096, FileOffset(0x1000), 0x1900),
            vec![ext(0x1000, 0x900)]
        );
    }
}
