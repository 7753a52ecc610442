//! Attested Unix socket listener.
//!
//! Wraps a `UnixListener` so every accepted connection arrives with an
//! attested [`CallerInfo`]. Connections whose peer cannot be attested are
//! closed and never handed to application code.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::tracker::{CallerInfo, ProcessTracker};

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

pub struct AttestedListener {
    listener: UnixListener,
    tracker: Arc<ProcessTracker>,
    path: Option<PathBuf>,
}

impl AttestedListener {
    /// Bind a fresh socket at `path`, replacing a stale socket file left by
    /// a previous run. The socket file is removed when the listener drops.
    pub fn bind(path: impl AsRef<Path>, tracker: Arc<ProcessTracker>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "attested listener bound");
        Ok(Self {
            listener,
            tracker,
            path: Some(path.to_path_buf()),
        })
    }

    /// Wrap an already bound listener. The caller keeps ownership of the
    /// socket file.
    pub fn from_listener(listener: UnixListener, tracker: Arc<ProcessTracker>) -> Self {
        Self {
            listener,
            tracker,
            path: None,
        }
    }

    pub fn tracker(&self) -> &Arc<ProcessTracker> {
        &self.tracker
    }

    pub fn local_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Accept the next connection and attest its peer.
    ///
    /// A failed attestation is returned as an error and the connection is
    /// dropped; the listener remains usable.
    pub async fn accept(&self) -> Result<AttestedStream> {
        let (stream, _) = self.listener.accept().await?;
        let accepted_at = self.tracker.now()?;
        let caller = self.tracker.resolve(&stream, accepted_at).await?;
        Ok(AttestedStream { stream, caller })
    }

    /// Accept until `shutdown` fires, running `handler` on its own task for
    /// each attested connection.
    pub async fn serve<F, Fut>(self, shutdown: CancellationToken, handler: F)
    where
        F: Fn(AttestedStream) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let mut backoff = ACCEPT_BACKOFF_START;

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("attested listener shutting down");
                    return;
                }
                accepted = self.listener.accept() => accepted,
            };

            let stream = match accepted {
                Ok((stream, _)) => {
                    backoff = ACCEPT_BACKOFF_START;
                    stream
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    continue;
                }
            };

            let accepted_at = match self.tracker.now() {
                Ok(now) => now,
                Err(e) => {
                    error!(error = %e, "boot clock unavailable; dropping connection");
                    continue;
                }
            };

            let tracker = Arc::clone(&self.tracker);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                match tracker.resolve(&stream, accepted_at).await {
                    Ok(caller) => handler(AttestedStream { stream, caller }).await,
                    Err(e) => warn!(error = %e, "rejected unattested connection"),
                }
            });
        }
    }
}

impl Drop for AttestedListener {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// A Unix stream whose peer has been attested.
#[derive(Debug)]
pub struct AttestedStream {
    stream: UnixStream,
    caller: CallerInfo,
}

impl AttestedStream {
    pub fn caller(&self) -> &CallerInfo {
        &self.caller
    }

    pub fn get_ref(&self) -> &UnixStream {
        &self.stream
    }

    pub fn into_parts(self) -> (UnixStream, CallerInfo) {
        (self.stream, self.caller)
    }
}

impl AsyncRead for AttestedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for AttestedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
