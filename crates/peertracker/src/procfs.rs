//! Linux `/proc` process table.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use rustix::io::Errno;
use rustix::time::{clock_gettime, ClockId};

use crate::process::{ProcessLookupError, ProcessOwner, ProcessTable, StartTime};

/// Index of `starttime` among the whitespace separated fields that follow
/// the parenthesised command name in `/proc/<pid>/stat` (field 22 overall).
const STARTTIME_FIELD: usize = 19;

/// Process table backed by procfs.
#[derive(Debug, Clone)]
pub struct ProcfsTable {
    root: PathBuf,
    ticks_per_second: u64,
}

impl ProcfsTable {
    pub fn new() -> io::Result<Self> {
        Self::with_root("/proc")
    }

    /// Read process entries from an alternate procfs mount.
    pub fn with_root(root: impl Into<PathBuf>) -> io::Result<Self> {
        let ticks = rustix::param::clock_ticks_per_second();
        if ticks == 0 {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "clock tick rate unavailable",
            ));
        }
        Ok(Self {
            root: root.into(),
            ticks_per_second: ticks,
        })
    }
}

impl ProcfsTable {
    async fn read_entry(&self, pid: i32, name: &str) -> Result<String, ProcessLookupError> {
        if pid <= 0 {
            return Err(ProcessLookupError::NotFound(pid));
        }
        let path = self.root.join(pid.to_string()).join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ProcessLookupError::NotFound(pid)),
            // ESRCH surfaces when the process is reaped mid-read
            Err(e) if e.raw_os_error() == Some(Errno::SRCH.raw_os_error()) => {
                Err(ProcessLookupError::NotFound(pid))
            }
            Err(source) => Err(ProcessLookupError::Io { pid, source }),
        }
    }
}

#[async_trait]
impl ProcessTable for ProcfsTable {
    async fn start_time(&self, pid: i32) -> Result<StartTime, ProcessLookupError> {
        let stat = self.read_entry(pid, "stat").await?;
        parse_stat_start_time(&stat).map(StartTime).ok_or_else(|| ProcessLookupError::Malformed {
            pid,
            reason: "missing or unparseable starttime field".to_string(),
        })
    }

    async fn owner(&self, pid: i32) -> Result<ProcessOwner, ProcessLookupError> {
        let status = self.read_entry(pid, "status").await?;
        parse_status_owner(&status).ok_or_else(|| ProcessLookupError::Malformed {
            pid,
            reason: "missing or unparseable Uid/Gid lines".to_string(),
        })
    }

    fn now(&self) -> Result<StartTime, ProcessLookupError> {
        // Boot-relative so it is comparable with /proc starttime across suspend
        let ts = clock_gettime(ClockId::Boottime);
        let secs = ts.tv_sec as u64;
        let nanos = ts.tv_nsec as u64;
        Ok(StartTime(
            secs * self.ticks_per_second + nanos * self.ticks_per_second / 1_000_000_000,
        ))
    }
}

/// Effective ids from the `Uid:` and `Gid:` lines of `/proc/<pid>/status`,
/// which list real, effective, saved and filesystem ids in that order.
fn parse_status_owner(status: &str) -> Option<ProcessOwner> {
    let effective = |key: &str| -> Option<u32> {
        status
            .lines()
            .find_map(|line| line.strip_prefix(key))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    Some(ProcessOwner {
        uid: effective("Uid:")?,
        gid: effective("Gid:")?,
    })
}

/// Extract `starttime` from the contents of `/proc/<pid>/stat`. The command
/// name may itself contain spaces and parentheses, so parsing starts after
/// the last `)`.
fn parse_stat_start_time(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm
        .split_whitespace()
        .nth(STARTTIME_FIELD)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    const STAT: &str = "4242 (evil) (proc name) S 1 4242 4242 0 -1 4194560 120 0 0 0 \
                        1 2 0 0 20 0 1 0 987654 1234567 200 18446744073709551615";

    #[test]
    fn test_parse_start_time_with_hostile_comm() {
        assert_eq!(parse_stat_start_time(STAT), Some(987654));
    }

    #[test]
    fn test_parse_status_owner_uses_effective_ids() {
        let status = "Name:\tsetuid-helper\nUid:\t1000\t0\t0\t0\nGid:\t1000\t27\t27\t27\n";
        assert_eq!(
            parse_status_owner(status),
            Some(ProcessOwner { uid: 0, gid: 27 })
        );
        assert_eq!(parse_status_owner("Name:\tsh\nUid:\t1000\n"), None);
    }

    #[test]
    fn test_parse_start_time_truncated() {
        assert_eq!(parse_stat_start_time("4242 (sh) S 1 2 3"), None);
        assert_eq!(parse_stat_start_time("garbage"), None);
    }

    #[tokio::test]
    async fn test_synthetic_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("4242")).unwrap();
        std::fs::write(dir.path().join("4242/stat"), STAT).unwrap();
        std::fs::write(
            dir.path().join("4242/status"),
            "Name:\tevil\nUid:\t1000\t1000\t1000\t1000\nGid:\t100\t100\t100\t100\n",
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("77")).unwrap();
        std::fs::write(dir.path().join("77/stat"), "77 (x) S").unwrap();

        let table = ProcfsTable::with_root(dir.path()).unwrap();
        assert_eq!(table.start_time(4242).await.unwrap(), StartTime(987654));
        assert_eq!(
            table.owner(4242).await.unwrap(),
            ProcessOwner { uid: 1000, gid: 100 }
        );
        assert!(matches!(
            table.owner(77).await,
            Err(ProcessLookupError::NotFound(77))
        ));
        assert!(matches!(
            table.start_time(4243).await,
            Err(ProcessLookupError::NotFound(4243))
        ));
        assert!(matches!(
            table.start_time(77).await,
            Err(ProcessLookupError::Malformed { pid: 77, .. })
        ));
        assert!(matches!(
            table.start_time(0).await,
            Err(ProcessLookupError::NotFound(0))
        ));
    }

    #[tokio::test]
    async fn test_own_process_started_before_now() {
        let table = ProcfsTable::new().unwrap();
        let pid = std::process::id() as i32;
        let started = table.start_time(pid).await.unwrap();
        let now = table.now().unwrap();
        assert!(started <= now);
        // Stable for the lifetime of the process
        assert_eq!(table.start_time(pid).await.unwrap(), started);

        // /proc/self is owned by the effective ids
        let proc_self = std::fs::metadata("/proc/self").unwrap();
        let owner = table.owner(pid).await.unwrap();
        assert_eq!((owner.uid, owner.gid), (proc_self.uid(), proc_self.gid()));
    }
}
