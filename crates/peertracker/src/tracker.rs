//! Process tracker: race-safe binding of connections to process instances.
//!
//! Every resolved connection holds a lease on a [`ProcessWatch`] keyed by pid.
//! A watch records the start time of the process instance that was attested
//! and owns one liveness monitor task. When the process exits or its pid is
//! recycled the watch is invalidated, and every [`CallerInfo`] referencing it
//! fails subsequent checks even if the socket is still open. The watch is
//! torn down when its last lease is released.
//!
//! # Race handling
//!
//! Credentials come from the connection itself (sampled by the kernel at
//! connect time). The start time of the process now holding that pid is then
//! compared against the accept instant: a process born after the connection
//! was accepted cannot be the one that connected, so resolution fails with
//! [`PeerTrackerError::AttestationMismatch`] instead of returning the
//! newcomer's identity. Both values are whole clock ticks, so a start time in
//! the same tick as the accept cannot be ordered and is rejected too. The
//! effective uid and gid of that process must match the connection's
//! credentials. The start time is read again after the watch is registered
//! to catch a recycle that happens during registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PeerTrackerConfig;
use crate::credentials::{PeerAddr, PeerConnection, PeerCredentials};
use crate::error::{PeerTrackerError, Result};
use crate::process::{ProcessLookupError, ProcessTable, StartTime};

/// Liveness of an attested process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    /// The attested process is still running
    Alive,
    /// The process exited
    Exited,
    /// The pid now belongs to a different process
    Replaced,
    /// The tracker shut down; liveness can no longer be vouched for
    Untracked,
}

/// Liveness watch for one `(pid, start time)` process instance.
struct ProcessWatch {
    pid: i32,
    start_time: StartTime,
    status: watch::Sender<WatchStatus>,
    cancel: CancellationToken,
}

impl ProcessWatch {
    fn new(pid: i32, start_time: StartTime, cancel: CancellationToken) -> Self {
        let (status, _) = watch::channel(WatchStatus::Alive);
        Self {
            pid,
            start_time,
            status,
            cancel,
        }
    }

    fn status(&self) -> WatchStatus {
        *self.status.borrow()
    }

    /// Mark the watch dead (first transition wins) and stop its monitor.
    fn invalidate(&self, status: WatchStatus) {
        self.status.send_if_modified(|current| {
            if *current == WatchStatus::Alive {
                *current = status;
                true
            } else {
                false
            }
        });
        self.cancel.cancel();
    }
}

struct WatchEntry {
    watch: Arc<ProcessWatch>,
    /// Leases (connections) referencing this watch
    refs: usize,
}

struct Shared {
    table: Arc<dyn ProcessTable>,
    config: PeerTrackerConfig,
    watches: Mutex<HashMap<i32, WatchEntry>>,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<i32, WatchEntry>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop one lease; the last one tears the watch down.
    fn release(&self, watch: &Arc<ProcessWatch>) {
        let mut watches = self.lock();
        let Some(entry) = watches.get_mut(&watch.pid) else {
            return;
        };
        if !Arc::ptr_eq(&entry.watch, watch) {
            return;
        }
        entry.refs -= 1;
        if entry.refs == 0 {
            watches.remove(&watch.pid);
            watch.cancel.cancel();
            debug!(pid = watch.pid, "released last connection; liveness monitor stopped");
        }
    }

    /// Remove a watch regardless of outstanding leases and invalidate it.
    fn retire(&self, watch: &Arc<ProcessWatch>, status: WatchStatus) {
        {
            let mut watches = self.lock();
            if watches
                .get(&watch.pid)
                .is_some_and(|entry| Arc::ptr_eq(&entry.watch, watch))
            {
                watches.remove(&watch.pid);
            }
        }
        watch.invalidate(status);
    }
}

/// A connection's reference on a process watch.
struct WatchLease {
    shared: Arc<Shared>,
    watch: Arc<ProcessWatch>,
}

impl Drop for WatchLease {
    fn drop(&mut self) {
        self.shared.release(&self.watch);
    }
}

/// Attested identity bound to a local connection.
///
/// Only produced by [`ProcessTracker`]. Valid while the connection is open
/// and the owning process instance is alive; check with [`CallerInfo::check`]
/// before every authorization decision.
#[derive(Clone)]
pub struct CallerInfo {
    uid: u32,
    gid: u32,
    addr: PeerAddr,
    resolved_at: SystemTime,
    lease: Arc<WatchLease>,
}

impl CallerInfo {
    pub fn pid(&self) -> i32 {
        self.lease.watch.pid
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn addr(&self) -> &PeerAddr {
        &self.addr
    }

    pub fn resolved_at(&self) -> SystemTime {
        self.resolved_at
    }

    /// Start time of the attested process instance.
    pub fn start_time(&self) -> StartTime {
        self.lease.watch.start_time
    }

    pub fn status(&self) -> WatchStatus {
        self.lease.watch.status()
    }

    pub fn is_alive(&self) -> bool {
        self.status() == WatchStatus::Alive
    }

    /// Fail if the attested process is gone.
    pub fn check(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(PeerTrackerError::ProcessExited { pid: self.pid() })
        }
    }

    /// Wait until the attested process is invalidated.
    pub async fn wait_exited(&self) -> WatchStatus {
        let mut rx = self.lease.watch.status.subscribe();
        let status = match rx.wait_for(|status| *status != WatchStatus::Alive).await {
            Ok(status) => *status,
            Err(_) => WatchStatus::Untracked,
        };
        status
    }
}

impl fmt::Debug for CallerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerInfo")
            .field("pid", &self.pid())
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("addr", &self.addr)
            .field("resolved_at", &self.resolved_at)
            .field("status", &self.status())
            .finish()
    }
}

/// Produces attested [`CallerInfo`]s and maintains per-process liveness watches.
pub struct ProcessTracker {
    shared: Arc<Shared>,
}

impl ProcessTracker {
    pub fn new(table: Arc<dyn ProcessTable>, config: PeerTrackerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                table,
                config,
                watches: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Tracker backed by the host's `/proc`.
    #[cfg(target_os = "linux")]
    pub fn with_procfs(config: PeerTrackerConfig) -> Result<Self> {
        let table = crate::procfs::ProcfsTable::new()?;
        Self::new(Arc::new(table), config)
    }

    pub fn config(&self) -> &PeerTrackerConfig {
        &self.shared.config
    }

    /// Current boot-relative time; sample it as soon as a connection is accepted.
    pub fn now(&self) -> Result<StartTime> {
        Ok(self.shared.table.now()?)
    }

    /// Resolve the caller behind an accepted connection.
    pub async fn resolve<C>(&self, conn: &C, accepted_at: StartTime) -> Result<CallerInfo>
    where
        C: PeerConnection + ?Sized,
    {
        let creds = conn.peer_credentials()?;
        self.resolve_credentials(creds, conn.transport_addr(), accepted_at)
            .await
    }

    /// Resolve already extracted credentials. `accepted_at` must have been
    /// sampled when the connection carrying `creds` was accepted.
    pub async fn resolve_credentials(
        &self,
        creds: PeerCredentials,
        addr: PeerAddr,
        accepted_at: StartTime,
    ) -> Result<CallerInfo> {
        let timeout = self.shared.config.resolution_timeout();
        let lease = tokio::time::timeout(timeout, self.attest(&creds, accepted_at))
            .await
            .map_err(|_| PeerTrackerError::ResolutionTimeout(timeout))??;

        debug!(
            pid = creds.pid,
            uid = creds.uid,
            gid = creds.gid,
            addr = %addr,
            start_time = lease.watch.start_time.0,
            "attested peer"
        );

        Ok(CallerInfo {
            uid: creds.uid,
            gid: creds.gid,
            addr,
            resolved_at: SystemTime::now(),
            lease: Arc::new(lease),
        })
    }

    /// Re-read the process table for an attested caller, invalidating its
    /// watch if the process exited or was replaced.
    pub async fn revalidate(&self, caller: &CallerInfo) -> Result<()> {
        let watch = &caller.lease.watch;
        caller.check()?;
        match self.shared.table.start_time(watch.pid).await {
            Ok(start_time) if start_time == watch.start_time => Ok(()),
            Ok(_) => {
                warn!(pid = watch.pid, "attested process was replaced");
                self.shared.retire(watch, WatchStatus::Replaced);
                Err(PeerTrackerError::ProcessExited { pid: watch.pid })
            }
            Err(ProcessLookupError::NotFound(_)) => {
                self.shared.retire(watch, WatchStatus::Exited);
                Err(PeerTrackerError::ProcessExited { pid: watch.pid })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Number of distinct process instances currently watched.
    pub fn watched_processes(&self) -> usize {
        self.shared.lock().len()
    }

    /// Number of live connections attested to `pid`.
    pub fn connections_for(&self, pid: i32) -> usize {
        self.shared.lock().get(&pid).map_or(0, |entry| entry.refs)
    }

    async fn attest(&self, creds: &PeerCredentials, accepted_at: StartTime) -> Result<WatchLease> {
        let pid = creds.pid;
        let start_time = self.lookup(pid).await?;
        if start_time >= accepted_at {
            warn!(
                pid,
                start_time = start_time.0,
                accepted_at = accepted_at.0,
                "process holding the peer pid did not start before the connection was accepted"
            );
            return Err(PeerTrackerError::AttestationMismatch {
                pid,
                reason: "process did not start before the connection was accepted".to_string(),
            });
        }

        let owner = match self.shared.table.owner(pid).await {
            Ok(owner) => owner,
            Err(ProcessLookupError::NotFound(_)) => {
                return Err(PeerTrackerError::AttestationMismatch {
                    pid,
                    reason: "process exited before attestation completed".to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        if owner.uid != creds.uid || owner.gid != creds.gid {
            warn!(
                pid,
                peer_uid = creds.uid,
                peer_gid = creds.gid,
                process_uid = owner.uid,
                process_gid = owner.gid,
                "peer credentials do not match the process holding the pid"
            );
            return Err(PeerTrackerError::AttestationMismatch {
                pid,
                reason: "peer credentials do not match the process owner".to_string(),
            });
        }

        let lease = register(&self.shared, pid, start_time);

        match self.shared.table.start_time(pid).await {
            Ok(confirmed) if confirmed == start_time => Ok(lease),
            Ok(_) => {
                self.shared.retire(&lease.watch, WatchStatus::Replaced);
                Err(PeerTrackerError::AttestationMismatch {
                    pid,
                    reason: "process was replaced during attestation".to_string(),
                })
            }
            Err(ProcessLookupError::NotFound(_)) => {
                self.shared.retire(&lease.watch, WatchStatus::Exited);
                Err(PeerTrackerError::AttestationMismatch {
                    pid,
                    reason: "process exited during attestation".to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn lookup(&self, pid: i32) -> Result<StartTime> {
        match self.shared.table.start_time(pid).await {
            Ok(start_time) => Ok(start_time),
            Err(ProcessLookupError::NotFound(_)) => Err(PeerTrackerError::AttestationMismatch {
                pid,
                reason: "process exited before attestation completed".to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ProcessTracker {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl fmt::Debug for ProcessTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTracker")
            .field("config", &self.shared.config)
            .field("watched_processes", &self.watched_processes())
            .finish()
    }
}

/// Take a lease on the watch for `(pid, start_time)`, replacing a watch for
/// an earlier occupant of the pid.
fn register(shared: &Arc<Shared>, pid: i32, start_time: StartTime) -> WatchLease {
    let mut watches = shared.lock();

    if let Some(entry) = watches.get_mut(&pid) {
        if entry.watch.start_time == start_time {
            entry.refs += 1;
            return WatchLease {
                shared: Arc::clone(shared),
                watch: Arc::clone(&entry.watch),
            };
        }
    }

    if let Some(stale) = watches.remove(&pid) {
        warn!(
            pid,
            stale_start_time = stale.watch.start_time.0,
            start_time = start_time.0,
            connections = stale.refs,
            "pid reuse detected; invalidating stale process watch"
        );
        stale.watch.invalidate(WatchStatus::Replaced);
    }

    let watch = Arc::new(ProcessWatch::new(
        pid,
        start_time,
        shared.shutdown.child_token(),
    ));
    watches.insert(
        pid,
        WatchEntry {
            watch: Arc::clone(&watch),
            refs: 1,
        },
    );
    drop(watches);

    tokio::spawn(monitor(Arc::clone(shared), Arc::clone(&watch)));
    debug!(pid, start_time = start_time.0, "started liveness monitor");

    WatchLease {
        shared: Arc::clone(shared),
        watch,
    }
}

/// Liveness monitor: one per watched process instance.
async fn monitor(shared: Arc<Shared>, watch: Arc<ProcessWatch>) {
    let mut ticker = tokio::time::interval(shared.config.liveness_poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = watch.cancel.cancelled() => {
                if shared.shutdown.is_cancelled() {
                    watch.invalidate(WatchStatus::Untracked);
                }
                return;
            }
            _ = ticker.tick() => {}
        }

        match shared.table.start_time(watch.pid).await {
            Ok(start_time) if start_time == watch.start_time => {}
            Ok(_) => {
                info!(pid = watch.pid, "pid recycled; invalidating attested connections");
                shared.retire(&watch, WatchStatus::Replaced);
                return;
            }
            Err(ProcessLookupError::NotFound(_)) => {
                info!(pid = watch.pid, "process exited; invalidating attested connections");
                shared.retire(&watch, WatchStatus::Exited);
                return;
            }
            Err(e) => {
                debug!(pid = watch.pid, error = %e, "liveness check failed; retrying");
            }
        }
    }
}
