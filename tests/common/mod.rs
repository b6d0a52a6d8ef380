// Common test utilities for snapfault integration tests
#![allow(dead_code)]

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snapfault::uffd::extents::scan_data_extents;
use snapfault::uffd::fault::{EVENT_PAGEFAULT, FAULT_RECORD_SIZE};
use snapfault::uffd::{HostAddr, PageResolver, ResolverFactory};
use vmm_sys_util::sock_ctrl_msg::ScmSocket;

pub const PAGE: u64 = 4096;
pub const MIB: u64 = 1024 * 1024;
pub const GUEST_BASE: HostAddr = HostAddr(0x7f00_0000_0000);

/// Byte stored at `offset` in the data parts of test snapshots.
pub fn pattern(offset: u64) -> u8 {
    ((offset / PAGE) % 251) as u8 + 1
}

/// Create `dir/name` of `size` bytes whose first `data` bytes hold
/// [`pattern`] and whose remainder is a hole.
pub fn sparse_snapshot(dir: &Path, name: &str, size: u64, data: u64) -> PathBuf {
    let path = dir.join(name);
    let mut file = File::create(&path).unwrap();
    file.set_len(size).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut written = 0;
    while written < data {
        let n = (data - written).min(MIB);
        let bytes: Vec<u8> = (written..written + n).map(pattern).collect();
        file.write_all(&bytes).unwrap();
        written += n;
    }
    file.sync_all().unwrap();
    path
}

/// Bytes the filesystem reports as data, or `None` when it cannot tell data
/// from holes (tests relying on holes should skip).
pub fn data_bytes(path: &Path) -> Option<u64> {
    let file = File::open(path).unwrap();
    let size = file.metadata().unwrap().len();
    let extents = scan_data_extents(&file, 0, size).ok()?;
    let total: u64 = extents.iter().map(|e| e.len).sum();
    (total < size).then_some(total)
}

pub fn regions_json(size: u64) -> String {
    format!(
        r#"[{{"base_host_virt_addr": {}, "size": {}, "offset": 0, "page_size": {}}}]"#,
        GUEST_BASE.raw(),
        size,
        PAGE
    )
}

/// Operations recorded by [`RecordingResolver`].
#[derive(Debug, Default)]
pub struct ResolverLog {
    pub copies: Vec<(HostAddr, Vec<u8>)>,
    pub zero_fills: Vec<(HostAddr, u64)>,
}

impl ResolverLog {
    pub fn copied_bytes(&self) -> u64 {
        self.copies.iter().map(|(_, data)| data.len() as u64).sum()
    }
}

/// Resolver standing in for a userfaultfd: records every copy and zero
/// fill instead of touching guest memory. Fault records are read from the
/// adopted descriptor, one end of a socket pair owned by the test.
pub struct RecordingResolver {
    fd: OwnedFd,
    log: Arc<Mutex<ResolverLog>>,
    fail_copies: bool,
}

impl AsRawFd for RecordingResolver {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl PageResolver for RecordingResolver {
    fn copy(&self, dst: HostAddr, src: &[u8]) -> io::Result<usize> {
        if self.fail_copies {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }
        self.log.lock().unwrap().copies.push((dst, src.to_vec()));
        Ok(src.len())
    }

    fn zero_fill(&self, dst: HostAddr, len: u64) -> io::Result<usize> {
        self.log.lock().unwrap().zero_fills.push((dst, len));
        Ok(len as usize)
    }
}

#[derive(Clone, Default)]
pub struct RecordingFactory {
    pub log: Arc<Mutex<ResolverLog>>,
    pub fail_copies: bool,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_copies: true,
            ..Self::default()
        }
    }
}

impl ResolverFactory for RecordingFactory {
    type Resolver = RecordingResolver;

    fn adopt(&self, fd: OwnedFd) -> io::Result<RecordingResolver> {
        Ok(RecordingResolver {
            fd,
            log: Arc::clone(&self.log),
            fail_copies: self.fail_copies,
        })
    }
}

/// Firecracker's side of the handshake.
pub struct FakeFirecracker {
    pub conn: UnixStream,
    /// Write end for fault records; the other end was sent as the "UFFD".
    pub faults: UnixStream,
    uffd: Option<UnixStream>,
}

impl FakeFirecracker {
    pub async fn connect(socket: &Path) -> Self {
        let conn = connect_with_retry(socket).await;
        let (uffd, faults) = UnixStream::pair().unwrap();
        Self {
            conn,
            faults,
            uffd: Some(uffd),
        }
    }

    /// Send a handshake message without the descriptor attached.
    pub fn send_without_fd(&mut self, payload: &str) {
        self.conn.write_all(payload.as_bytes()).unwrap();
    }

    pub fn send_with_fd(&self, payload: &str) {
        let uffd = self.uffd.as_ref().expect("local UFFD end already dropped");
        self.conn
            .send_with_fd(payload.as_bytes(), uffd.as_raw_fd())
            .unwrap();
    }

    /// Drop our copy of the sent descriptor so only the handler holds it.
    pub fn drop_local_uffd(&mut self) {
        self.uffd = None;
    }

    /// Whether every copy of the sent descriptor has been closed.
    pub fn uffd_closed(&self) -> bool {
        self.faults.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        match (&self.faults).read(&mut buf) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => panic!("reading fault socket: {e}"),
        }
    }

    pub fn fault(&mut self, addr: HostAddr) {
        let mut record = [0u8; FAULT_RECORD_SIZE];
        record[0] = EVENT_PAGEFAULT;
        record[16..24].copy_from_slice(&addr.raw().to_ne_bytes());
        self.faults.write_all(&record).unwrap();
    }
}

async fn connect_with_retry(socket: &Path) -> UnixStream {
    for _ in 0..100 {
        if let Ok(conn) = UnixStream::connect(socket) {
            return conn;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to {}", socket.display());
}

/// Whether this process still has `path` open or mapped.
pub fn file_in_use(path: &Path) -> bool {
    let path = path.canonicalize().unwrap();
    let open = std::fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(|entry| std::fs::read_link(entry.ok()?.path()).ok())
        .any(|target| target == path);
    let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
    open || maps.lines().any(|line| line.ends_with(&*path.to_string_lossy()))
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
