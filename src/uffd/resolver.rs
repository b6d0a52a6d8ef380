//! Page resolution through the fault descriptor.
//!
//! The handler only talks to the kernel through [`PageResolver`], so the eager
//! and lazy phases can be driven by a real userfaultfd or by a recording double
//! in tests. Fault records are read straight from the descriptor returned by
//! `as_raw_fd`.

use std::io;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::debug;
use userfaultfd::Uffd;

use super::types::{HostAddr, DEFAULT_PAGE_SIZE};

/// Upper bound on the zero buffer used when UFFDIO_ZEROPAGE is unavailable.
const ZERO_BUFFER_SIZE: u64 = 2 * 1024 * 1024;

/// Resolves faults in the guest address space.
pub trait PageResolver: AsRawFd + Send + Sync + 'static {
    /// Inject `src` at `dst` and wake waiters (UFFDIO_COPY). Returns the number
    /// of bytes copied, which may be short.
    fn copy(&self, dst: HostAddr, src: &[u8]) -> io::Result<usize>;

    /// Map zero pages over `[dst, dst + len)` and wake waiters (UFFDIO_ZEROPAGE).
    fn zero_fill(&self, dst: HostAddr, len: u64) -> io::Result<usize>;
}

/// Turns the descriptor received in the handshake into a resolver.
pub trait ResolverFactory: Send + 'static {
    type Resolver: PageResolver;

    fn adopt(&self, fd: OwnedFd) -> io::Result<Self::Resolver>;
}

/// Resolver backed by a userfaultfd delegated by Firecracker.
pub struct UffdResolver {
    uffd: Uffd,
}

impl UffdResolver {
    pub fn new(uffd: Uffd) -> Self {
        Self { uffd }
    }
}

impl AsRawFd for UffdResolver {
    fn as_raw_fd(&self) -> RawFd {
        self.uffd.as_raw_fd()
    }
}

fn uffd_error(err: userfaultfd::Error) -> io::Error {
    match err {
        // Compare raw errno values since we may have different nix versions
        userfaultfd::Error::CopyFailed(errno) | userfaultfd::Error::ZeropageFailed(errno) => {
            io::Error::from_raw_os_error(errno as i32)
        }
        other => io::Error::other(other),
    }
}

impl PageResolver for UffdResolver {
    fn copy(&self, dst: HostAddr, src: &[u8]) -> io::Result<usize> {
        // Safety: `src` is a live borrowed slice; `dst` lies in a range
        // registered by Firecracker, which the kernel validates.
        unsafe {
            self.uffd.copy(
                src.as_ptr() as *const std::ffi::c_void,
                dst.as_mut_ptr(),
                src.len(),
                true,
            )
        }
        .map_err(uffd_error)
    }

    fn zero_fill(&self, dst: HostAddr, len: u64) -> io::Result<usize> {
        // Safety: as for `copy`; the kernel rejects unregistered ranges.
        unsafe { self.uffd.zeropage(dst.as_mut_ptr(), len as usize, true) }.map_err(uffd_error)
    }
}

/// Adopts the received descriptor as a userfaultfd.
#[derive(Debug, Default, Clone, Copy)]
pub struct UffdFactory;

impl ResolverFactory for UffdFactory {
    type Resolver = UffdResolver;

    fn adopt(&self, fd: OwnedFd) -> io::Result<UffdResolver> {
        // Safety: ownership of the descriptor moves into the Uffd, which
        // closes it on drop.
        let uffd = unsafe { Uffd::from_raw_fd(fd.into_raw_fd()) };
        Ok(UffdResolver::new(uffd))
    }
}

/// Put `fd` into non-blocking mode so it can be driven by the tokio reactor.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Map zero pages over `[dst, dst + len)` for a range backed by `page_size`
/// pages. Returns the number of bytes resolved.
///
/// UFFDIO_ZEROPAGE is not supported on hugetlb mappings, so huge pages (and
/// ranges where the kernel answers EINVAL) are filled with UFFDIO_COPY from a
/// zeroed buffer instead.
pub fn zero_pages<R: PageResolver + ?Sized>(
    resolver: &R,
    dst: HostAddr,
    len: u64,
    page_size: u64,
) -> io::Result<u64> {
    if page_size <= DEFAULT_PAGE_SIZE {
        match resolver.zero_fill(dst, len) {
            Ok(n) => return Ok(n as u64),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                debug!(target: "uffd", page = %dst, "UFFDIO_ZEROPAGE rejected, copying zeros");
            }
            Err(e) => return Err(e),
        }
    }

    // Heap-allocate (2MB on stack would overflow for hugepages)
    let zeros = vec![0u8; len.min(ZERO_BUFFER_SIZE.max(page_size)) as usize];
    let mut done = 0u64;
    while done < len {
        let n = (len - done).min(zeros.len() as u64) as usize;
        let copied = resolver.copy(HostAddr(dst.raw() + done), &zeros[..n])?;
        if copied == 0 {
            return Err(io::Error::other(format!(
                "zero copy to {dst} stalled after {done} bytes"
            )));
        }
        done += copied as u64;
    }
    Ok(done)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_set_nonblocking() {
        let (a, _b) = UnixStream::pair().unwrap();
        set_nonblocking(a.as_raw_fd()).unwrap();
        let flags = unsafe { libc::fcntl(a.as_raw_fd(), libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn test_set_nonblocking_bad_fd() {
        assert!(set_nonblocking(-1).is_err());
    }

    const PAGE: u64 = 4096;
    const HUGE_PAGE: u64 = 2 * 1024 * 1024;
    const BASE: HostAddr = HostAddr(0x7f00_0000_0000);

    #[test]
    fn test_zero_pages_uses_zeropage_for_small_pages() {
        let resolver = testing::MemoryResolver::new(BASE, 4 * PAGE as usize);
        assert_eq!(zero_pages(&resolver, BASE, 2 * PAGE, PAGE).unwrap(), 2 * PAGE);
        assert_eq!(*resolver.zero_fills.lock().unwrap(), vec![(BASE, 2 * PAGE)]);
        assert!(resolver.copied_ranges().is_empty());
    }

    #[test]
    fn test_zero_pages_copies_when_zeropage_rejected() {
        let mut resolver = testing::MemoryResolver::new(BASE, 2 * PAGE as usize);
        resolver.zero_fill_errno = Some(libc::EINVAL);
        assert_eq!(zero_pages(&resolver, BASE, PAGE, PAGE).unwrap(), PAGE);
        assert_eq!(resolver.copied_ranges(), vec![(BASE, PAGE)]);
        assert!(resolver.memory.lock().unwrap()[..PAGE as usize].iter().all(|&b| b == 0));

        resolver.zero_fill_errno = Some(libc::ENOMEM);
        let err = zero_pages(&resolver, BASE, PAGE, PAGE).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
    }

    #[test]
    fn test_zero_pages_copies_huge_pages() {
        let mut resolver = testing::MemoryResolver::new(BASE, 2 * HUGE_PAGE as usize);
        resolver.zero_fill_errno = Some(libc::EINVAL);
        assert_eq!(zero_pages(&resolver, BASE, 2 * HUGE_PAGE, HUGE_PAGE).unwrap(), 2 * HUGE_PAGE);
        assert_eq!(
            resolver.copied_ranges(),
            vec![(BASE, HUGE_PAGE), (HostAddr(BASE.raw() + HUGE_PAGE), HUGE_PAGE)]
        );
        assert!(resolver.memory.lock().unwrap().iter().all(|&b| b == 0));
    }
}
