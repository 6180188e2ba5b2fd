//! Per-key mutual exclusion for cache installs.
//!
//! Installing a toolchain is serialised per [`CacheKey`] through a
//! [`KeyLocker`]. Two implementations exist:
//!
//! - [`FileLocker`] (default) coordinates across processes with an OS advisory
//!   lock on `locks/<key>.lock`. The OS drops the lock when its holder dies.
//! - [`MemoryLocker`] coordinates tasks within one process only.
//!
//! ## Owner records
//!
//! While holding a file lock, the holder keeps `locks/<key>.owner` with its pid,
//! the scope that pid belongs to (hostname and pid namespace), a random token
//! and the acquisition time, and deletes it on release. A new holder that
//! still finds a record knows the previous holder died without releasing,
//! which means it may have left a staging directory behind
//! ([`HeldLock::previous_holder_died`]).
//!
//! Waiters read the record too. A pid is only checked when the record's scope
//! matches the waiter's own; holders on other hosts or in other containers
//! sharing the cache volume are simply waited for. If the lock stays held
//! while a same-scope holder pid is gone for longer than the grace period,
//! something else inherited the lock and waiting fails with `LockHolderDead`
//! instead of hanging.

use std::collections::HashMap;
use std::fs::{File, OpenOptions, TryLockError};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::cache::CacheKey;
use crate::errors::{ToolchainError, ToolchainResult};
use crate::paths::CacheLayout;

/// Timing policy for lock waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Fail with `LockTimeout` after waiting this long. `None` waits forever.
    pub wait_timeout: Option<Duration>,
    /// Fail with `LockHolderDead` once the recorded holder has been gone
    /// this long while the lock is still held.
    pub dead_holder_grace: Duration,
    /// Base interval between acquisition attempts.
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            wait_timeout: None,
            dead_holder_grace: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// A held per-key lock. Released on drop.
pub trait HeldLock: Send {
    /// Whether the previous holder exited without releasing.
    fn previous_holder_died(&self) -> bool {
        false
    }
}

/// Serialises installs of the same cache key.
pub trait KeyLocker: Send + Sync {
    /// Guard type; dropping it releases the lock.
    type Guard: HeldLock;

    /// Waits until the lock for `key` is held by the caller.
    fn lock(&self, key: &CacheKey) -> impl Future<Output = ToolchainResult<Self::Guard>> + Send;
}

/// Liveness record of the current lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    /// Holder process id.
    pub pid: u32,
    /// Where `pid` is meaningful, see [`pid_scope`].
    #[serde(default)]
    pub scope: String,
    /// Random token identifying this acquisition.
    pub token: String,
    /// Unix timestamp of the acquisition.
    pub acquired_at: u64,
}

/// Cross-process locker backed by OS advisory file locks.
#[derive(Debug, Clone)]
pub struct FileLocker {
    layout: CacheLayout,
    options: LockOptions,
    scope: String,
}

/// Guard for a [`FileLocker`] lock.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    owner_path: PathBuf,
    token: String,
    previous_holder_died: bool,
}

impl FileLocker {
    /// Creates a locker keeping its files in the layout's lock directory.
    #[must_use]
    pub fn new(layout: CacheLayout, options: LockOptions) -> Self {
        Self {
            layout,
            options,
            scope: pid_scope(),
        }
    }

    async fn acquire(&self, key: &CacheKey) -> ToolchainResult<FileLockGuard> {
        let name = key.dir_name();
        let lock_path = self.layout.lock_file(&name);
        let owner_path = self.layout.owner_file(&name);
        let locks_dir = &self.layout.locks;

        std::fs::create_dir_all(locks_dir).map_err(|e| {
            ToolchainError::io(format!("creating lock directory {}", locks_dir.display()), e)
        })?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| {
                ToolchainError::io(format!("opening lock file {}", lock_path.display()), e)
            })?;

        let start = Instant::now();
        let mut holder_gone_since: Option<(u32, Instant)> = None;
        let mut logged_wait = false;

        loop {
            match file.try_lock() {
                Ok(()) => break,
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Error(e)) => {
                    return Err(ToolchainError::io(
                        format!("locking {}", lock_path.display()),
                        e,
                    ));
                }
            }

            if !logged_wait {
                debug!(key = %name, "waiting for cache lock");
                logged_wait = true;
            }

            match read_owner(&owner_path) {
                Some(owner) if owner.scope == self.scope && !is_pid_alive(owner.pid) => {
                    let since = match holder_gone_since {
                        Some((pid, since)) if pid == owner.pid => since,
                        _ => {
                            let now = Instant::now();
                            holder_gone_since = Some((owner.pid, now));
                            now
                        }
                    };
                    if since.elapsed() >= self.options.dead_holder_grace {
                        return Err(ToolchainError::LockHolderDead {
                            path: lock_path,
                            pid: owner.pid,
                        });
                    }
                }
                _ => holder_gone_since = None,
            }

            let waited = start.elapsed();
            if let Some(timeout) = self.options.wait_timeout
                && waited >= timeout
            {
                return Err(ToolchainError::LockTimeout {
                    path: lock_path,
                    waited_secs: waited.as_secs(),
                });
            }

            tokio::time::sleep(jittered(self.options.poll_interval)).await;
        }

        let previous = read_owner(&owner_path);
        if let Some(previous) = &previous {
            warn!(
                key = %name,
                pid = previous.pid,
                acquired_at = previous.acquired_at,
                "previous lock holder exited without releasing, reclaiming"
            );
        }

        let record = OwnerRecord {
            pid: std::process::id(),
            scope: self.scope.clone(),
            token: random_token(),
            acquired_at: current_timestamp(),
        };
        let content = serde_json::to_vec(&record).map_err(|e| {
            ToolchainError::io("encoding lock owner record", std::io::Error::other(e))
        })?;
        std::fs::write(&owner_path, content).map_err(|e| {
            ToolchainError::io(format!("writing lock owner {}", owner_path.display()), e)
        })?;

        debug!(key = %name, "acquired cache lock");
        Ok(FileLockGuard {
            file,
            owner_path,
            token: record.token,
            previous_holder_died: previous.is_some(),
        })
    }
}

impl KeyLocker for FileLocker {
    type Guard = FileLockGuard;

    fn lock(&self, key: &CacheKey) -> impl Future<Output = ToolchainResult<Self::Guard>> + Send {
        self.acquire(key)
    }
}

impl HeldLock for FileLockGuard {
    fn previous_holder_died(&self) -> bool {
        self.previous_holder_died
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if read_owner(&self.owner_path).is_some_and(|owner| owner.token == self.token) {
            let _ = std::fs::remove_file(&self.owner_path);
        }
        let _ = self.file.unlock();
    }
}

/// In-process locker: one async mutex per key.
#[derive(Debug, Clone, Default)]
pub struct MemoryLocker {
    locks: Arc<Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Guard for a [`MemoryLocker`] lock.
#[derive(Debug)]
pub struct MemoryLockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl MemoryLocker {
    /// Creates an empty locker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(key.clone()).or_default())
    }
}

impl KeyLocker for MemoryLocker {
    type Guard = MemoryLockGuard;

    fn lock(&self, key: &CacheKey) -> impl Future<Output = ToolchainResult<Self::Guard>> + Send {
        let slot = self.slot(key);
        async move {
            Ok(MemoryLockGuard {
                _guard: slot.lock_owned().await,
            })
        }
    }
}

impl HeldLock for MemoryLockGuard {}

/// Reads an owner record; unreadable or partial records count as absent.
#[must_use]
pub fn read_owner(path: &Path) -> Option<OwnerRecord> {
    let content = std::fs::read(path).ok()?;
    serde_json::from_slice(&content).ok()
}

/// Identifies the pid namespace of this process: its hostname plus, on
/// Linux, the `/proc/self/ns/pid` link. Two processes with the same scope
/// can check each other's pids.
#[must_use]
pub fn pid_scope() -> String {
    let host = hostname().unwrap_or_default();
    match std::fs::read_link("/proc/self/ns/pid") {
        Ok(ns) => format!("{host}/{}", ns.display()),
        Err(_) => host,
    }
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for writes of its full length.
    let result = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if result != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Some(String::from_utf8_lossy(&buf[..end]).into_owned())
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

/// Check whether a given PID is alive on this host.
///
/// Uses `kill(pid, 0)`, which checks for existence without sending a signal.
fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: signal 0 performs no action beyond the existence check.
        let result = unsafe { libc::kill(pid, 0) };
        if result == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to another user.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn jittered(interval: Duration) -> Duration {
    let base = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    let jitter = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

fn random_token() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    hex::encode(bytes)
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
