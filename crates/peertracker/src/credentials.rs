//! Peer credential extraction.
//!
//! Credentials are taken from the kernel's per-connection peer credential
//! record (`SO_PEERCRED` and equivalents), which is sampled when the peer
//! calls `connect()`. They are never derived by looking up whichever process
//! currently owns an address.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{PeerTrackerError, Result};

/// Raw OS-level identity of the peer that opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Transport address of the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    /// Unix domain socket; client sockets are usually unnamed
    Unix(Option<PathBuf>),
    Tcp(Option<SocketAddr>),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            PeerAddr::Unix(None) => f.write_str("unix:@"),
            PeerAddr::Tcp(Some(addr)) => write!(f, "tcp:{addr}"),
            PeerAddr::Tcp(None) => f.write_str("tcp:?"),
        }
    }
}

/// An accepted, stream-oriented local connection.
pub trait PeerConnection {
    /// Credentials the kernel bound to this connection at connect time.
    fn peer_credentials(&self) -> Result<PeerCredentials>;

    fn transport_addr(&self) -> PeerAddr;
}

impl PeerConnection for tokio::net::UnixStream {
    fn peer_credentials(&self) -> Result<PeerCredentials> {
        let cred = self.peer_cred()?;
        let pid = cred.pid().ok_or_else(|| {
            PeerTrackerError::InvalidConnection(
                "peer process id is not available on this platform".to_string(),
            )
        })?;
        Ok(PeerCredentials {
            pid,
            uid: cred.uid(),
            gid: cred.gid(),
        })
    }

    fn transport_addr(&self) -> PeerAddr {
        let path = self
            .peer_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(Path::to_path_buf));
        PeerAddr::Unix(path)
    }
}

impl PeerConnection for tokio::net::TcpStream {
    fn peer_credentials(&self) -> Result<PeerCredentials> {
        Err(PeerTrackerError::InvalidConnection(
            "TCP connections carry no peer credentials".to_string(),
        ))
    }

    fn transport_addr(&self) -> PeerAddr {
        PeerAddr::Tcp(self.peer_addr().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[tokio::test]
    async fn test_unix_pair_reports_own_process() {
        let (a, b) = tokio::net::UnixStream::pair().unwrap();
        let creds = a.peer_credentials().unwrap();
        assert_eq!(creds.pid, std::process::id() as i32);
        assert_eq!(creds, b.peer_credentials().unwrap());

        let scratch = tempfile::NamedTempFile::new().unwrap();
        let meta = scratch.as_file().metadata().unwrap();
        assert_eq!(creds.uid, meta.uid());

        assert_eq!(a.transport_addr(), PeerAddr::Unix(None));
    }

    #[tokio::test]
    async fn test_tcp_is_invalid_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        assert!(matches!(
            server.peer_credentials(),
            Err(PeerTrackerError::InvalidConnection(_))
        ));
        assert_eq!(
            server.transport_addr(),
            PeerAddr::Tcp(Some(client.local_addr().unwrap()))
        );
    }

    #[test]
    fn test_addr_display() {
        assert_eq!(PeerAddr::Unix(None).to_string(), "unix:@");
        assert_eq!(
            PeerAddr::Unix(Some(PathBuf::from("/tmp/agent.sock"))).to_string(),
            "unix:/tmp/agent.sock"
        );
    }
}
