//! Firecracker UFFD handshake: one message carrying the userfaultfd via
//! SCM_RIGHTS plus the guest memory layout as JSON.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};
use vmm_sys_util::sock_ctrl_msg::ScmSocket;

use super::error::HandshakeError;
use super::types::MemoryRegion;

/// Retry bound for messages arriving without a descriptor. Firecracker's first
/// message sometimes comes without the fd attached (also seen in its own
/// example handler).
pub const DEFAULT_HANDSHAKE_ATTEMPTS: usize = 5;

/// Buffer for the JSON region payload (unrelated to page size).
const MESSAGE_BUFFER_SIZE: usize = 64 * 1024;

/// Result of a completed handshake.
#[derive(Debug)]
pub struct Handshake {
    pub fd: OwnedFd,
    pub regions: Vec<MemoryRegion>,
}

/// Receive one message: payload bytes into `buf` plus at most one descriptor
/// passed as ancillary data.
pub fn receive_handle_and_payload(
    socket: &UnixStream,
    buf: &mut [u8],
) -> io::Result<(usize, Option<OwnedFd>)> {
    match socket.recv_with_fd(buf) {
        Ok((n, file)) => Ok((n, file.map(OwnedFd::from))),
        Err(e) => Err(io::Error::from_raw_os_error(e.errno())),
    }
}

/// Receive the UFFD and memory regions from a freshly accepted connection.
///
/// Uses the same AsyncFd pattern as the fault loop: wait for readability,
/// then `recvmsg`, which succeeds immediately since data is ready.
pub async fn receive_handshake(
    stream: tokio::net::UnixStream,
    max_attempts: usize,
) -> Result<Handshake, HandshakeError> {
    let std_stream = stream.into_std().map_err(HandshakeError::Receive)?;
    // Keep non-blocking; AsyncFd handles readiness
    let socket = AsyncFd::new(std_stream).map_err(HandshakeError::Receive)?;
    let max_attempts = max_attempts.max(1);

    let mut buf = vec![0u8; MESSAGE_BUFFER_SIZE];
    let mut fd: Option<OwnedFd> = None;
    let mut payload: Vec<u8> = Vec::new();
    let mut attempts = 0;

    while attempts < max_attempts {
        let mut guard = socket.readable().await.map_err(HandshakeError::Receive)?;
        let (n, received) = match guard.try_io(|inner| receive_handle_and_payload(inner.get_ref(), &mut buf)) {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return Err(HandshakeError::Receive(e)),
            Err(_would_block) => continue,
        };
        attempts += 1;

        if n == 0 && received.is_none() {
            return Err(HandshakeError::ConnectionClosed);
        }
        if n > 0 {
            payload.clear();
            payload.extend_from_slice(&buf[..n]);
        }
        match received {
            Some(received) => fd = Some(received),
            None => warn!(
                target: "uffd",
                attempt = attempts,
                bytes = n,
                "handshake message arrived without a UFFD, retrying"
            ),
        }
        if fd.is_some() && !payload.is_empty() {
            break;
        }
    }

    let fd = fd.ok_or(HandshakeError::NoDescriptor { attempts })?;
    let regions = parse_regions(&payload)?;
    debug!(target: "uffd", attempts, regions = regions.len(), "handshake received");
    Ok(Handshake { fd, regions })
}

/// Parse and validate the region array.
///
/// On a stream socket, payloads of earlier fd-less messages can be coalesced
/// with the one carrying the fd; the last JSON document wins.
pub fn parse_regions(payload: &[u8]) -> Result<Vec<MemoryRegion>, HandshakeError> {
    let mut regions = None;
    for doc in serde_json::Deserializer::from_slice(payload).into_iter::<Vec<MemoryRegion>>() {
        regions = Some(doc?);
    }
    let regions = regions.ok_or(HandshakeError::NoRegions)?;

    if regions.is_empty() {
        return Err(HandshakeError::NoRegions);
    }
    for (index, region) in regions.iter().enumerate() {
        region
            .validate()
            .map_err(|reason| HandshakeError::InvalidRegion { index, reason })?;
    }
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uffd::types::HostAddr;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    const ONE_REGION: &str =
        r#"[{"base_host_virt_addr": 4096, "size": 8192, "offset": 0, "page_size": 4096}]"#;

    fn pair() -> (tokio::net::UnixStream, UnixStream) {
        let (server, client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        (tokio::net::UnixStream::from_std(server).unwrap(), client)
    }

    #[test]
    fn test_parse_regions_multiple() {
        let json = r#"[
            {"base_host_virt_addr": 140000000, "size": 268435456, "offset": 0, "page_size": 4096},
            {"base_host_virt_addr": 408435456, "size": 268435456, "offset": 268435456, "page_size": 4096}
        ]"#;
        let regions = parse_regions(json.as_bytes()).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].file_offset.raw(), 268435456);
    }

    #[test]
    fn test_parse_regions_coalesced_uses_last() {
        let first = r#"[{"base_host_virt_addr": 1, "size": 4096, "offset": 0}]"#;
        let payload = format!("{first}{ONE_REGION}");
        let regions = parse_regions(payload.as_bytes()).unwrap();
        assert_eq!(regions[0].base, HostAddr(4096));
    }

    #[test]
    fn test_parse_regions_errors() {
        assert!(matches!(parse_regions(b"not json"), Err(HandshakeError::Json(_))));
        assert!(matches!(parse_regions(b"[]"), Err(HandshakeError::NoRegions)));
        assert!(matches!(parse_regions(b""), Err(HandshakeError::NoRegions)));
        let zero = r#"[{"base_host_virt_addr": 4096, "size": 0, "offset": 0}]"#;
        assert!(matches!(
            parse_regions(zero.as_bytes()),
            Err(HandshakeError::InvalidRegion { index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_receive_handshake_with_fd() {
        let (server, client) = pair();
        let (passed, _keep) = UnixStream::pair().unwrap();
        client
            .send_with_fd(ONE_REGION.as_bytes(), passed.as_raw_fd())
            .unwrap();

        let hs = receive_handshake(server, DEFAULT_HANDSHAKE_ATTEMPTS).await.unwrap();
        assert_eq!(hs.regions.len(), 1);
        assert!(hs.fd.as_raw_fd() >= 0);
    }

    #[tokio::test]
    async fn test_receive_handshake_without_fd_fails_after_bound() {
        let (server, mut client) = pair();
        let task = tokio::spawn(receive_handshake(server, 2));
        client.write_all(ONE_REGION.as_bytes()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        client.write_all(ONE_REGION.as_bytes()).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, HandshakeError::NoDescriptor { attempts: 2 }));
    }

    #[tokio::test]
    async fn test_receive_handshake_peer_closed() {
        let (server, client) = pair();
        drop(client);
        let err = receive_handshake(server, DEFAULT_HANDSHAKE_ATTEMPTS)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_receive_handshake_malformed_json() {
        let (server, client) = pair();
        let (passed, _keep) = UnixStream::pair().unwrap();
        client.send_with_fd(&b"{oops"[..], passed.as_raw_fd()).unwrap();
        let err = receive_handshake(server, DEFAULT_HANDSHAKE_ATTEMPTS)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Json(_)));
    }
}
