//! Two-layer advisory workspace lock.
//!
//! Layer 1 serializes threads of this process through a global registry of
//! held paths (a mutex+condvar set keyed by canonical path) before any OS
//! primitive is touched. Layer 2 excludes other processes: the lockfile is
//! created with `create_new`, carries `{pid, host, acquired_at}` JSON for
//! diagnostics, and holds a kernel-level exclusive lock via `fs2`.
//!
//! A lockfile whose PID no longer exists on the same host is stale; it is
//! reclaimed only after a 5-second grace re-check confirms the same stale
//! owner. Acquisition across multiple locks must be ordered by sorted
//! absolute path (see [`acquire_many`]) to prevent deadlock.

use crate::core::error::MemosError;
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Default acquisition timeout for apply-path locks.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period before a stale lockfile may be reclaimed.
const STALE_GRACE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Metadata written into the lockfile for stale detection and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub host: String,
    pub acquired_at: String,
}

impl LockOwner {
    fn current() -> Self {
        LockOwner {
            pid: std::process::id(),
            host: local_hostname(),
            acquired_at: Utc::now().to_rfc3339(),
        }
    }

    /// Best-effort staleness probe; only meaningful on the same host.
    fn is_stale(&self) -> bool {
        if self.host != local_hostname() {
            return false;
        }
        !process_alive(self.pid)
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to another user.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Intra-process registry of held lock paths.
struct Registry {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        held: Mutex::new(HashSet::new()),
        released: Condvar::new(),
    })
}

/// A held workspace lock. Released on drop along all exit paths.
pub struct LockHandle {
    file: Option<File>,
    lock_path: PathBuf,
    registry_key: PathBuf,
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
        let _ = std::fs::remove_file(&self.lock_path);
        let mut held = registry().held.lock().unwrap();
        held.remove(&self.registry_key);
        registry().released.notify_all();
    }
}

/// Acquire the advisory lock guarding `target` (typically the workspace
/// root). Blocks up to `timeout`, then fails with `LockTimeout` having
/// caused no side effect.
pub fn acquire(target: &Path, timeout: Duration) -> Result<LockHandle, MemosError> {
    let registry_key = normalize(target);
    let lock_path = lock_path_for(target);
    let deadline = Instant::now() + timeout;

    // Layer 1: intra-process.
    {
        let mut held = registry().held.lock().unwrap();
        while held.contains(&registry_key) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MemosError::LockTimeout(format!(
                    "{} (held by another thread)",
                    lock_path.display()
                )));
            }
            let (guard, result) = registry().released.wait_timeout(held, remaining).unwrap();
            held = guard;
            if result.timed_out() && held.contains(&registry_key) {
                return Err(MemosError::LockTimeout(format!(
                    "{} (held by another thread)",
                    lock_path.display()
                )));
            }
        }
        held.insert(registry_key.clone());
    }

    // Layer 2: inter-process. On any failure the registry slot must be
    // returned before surfacing the error.
    match acquire_os_lock(&lock_path, deadline) {
        Ok(file) => Ok(LockHandle {
            file: Some(file),
            lock_path,
            registry_key,
        }),
        Err(e) => {
            let mut held = registry().held.lock().unwrap();
            held.remove(&registry_key);
            registry().released.notify_all();
            Err(e)
        }
    }
}

fn acquire_os_lock(lock_path: &Path, deadline: Instant) -> Result<File, MemosError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut stale_seen: Option<(Instant, u32)> = None;

    loop {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(mut file) => {
                if let Err(e) = file.try_lock_exclusive() {
                    let _ = std::fs::remove_file(lock_path);
                    return Err(MemosError::Io(e));
                }
                let owner = LockOwner::current();
                let json = serde_json::to_string_pretty(&owner)?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                return Ok(file);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if let Some(owner) = read_owner(lock_path) {
                    if owner.is_stale() {
                        // Reclaim only after the same dead owner has been
                        // observed across the full grace window.
                        match stale_seen {
                            Some((first, pid))
                                if pid == owner.pid && first.elapsed() >= STALE_GRACE =>
                            {
                                let _ = std::fs::remove_file(lock_path);
                                stale_seen = None;
                                continue;
                            }
                            Some((_, pid)) if pid == owner.pid => {}
                            _ => stale_seen = Some((Instant::now(), owner.pid)),
                        }
                    } else {
                        stale_seen = None;
                    }
                }
                if Instant::now() >= deadline {
                    let holder = read_owner(lock_path)
                        .map(|o| format!(" (held by pid {} on {})", o.pid, o.host))
                        .unwrap_or_default();
                    return Err(MemosError::LockTimeout(format!(
                        "{}{}",
                        lock_path.display(),
                        holder
                    )));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(MemosError::Io(e)),
        }
    }
}

/// Acquire several locks in deadlock-free order (sorted absolute path).
pub fn acquire_many(targets: &[&Path], timeout: Duration) -> Result<Vec<LockHandle>, MemosError> {
    let mut sorted: Vec<PathBuf> = targets.iter().map(|p| normalize(p)).collect();
    sorted.sort();
    sorted.dedup();
    let mut handles = Vec::with_capacity(sorted.len());
    for path in &sorted {
        handles.push(acquire(path, timeout)?);
    }
    Ok(handles)
}

/// Directory targets keep their lockfile inside themselves; file targets
/// get a `.lock` sibling.
pub fn lock_path_for(target: &Path) -> PathBuf {
    let normalized = normalize(target);
    if normalized.is_dir() {
        return normalized.join(".lock");
    }
    let mut os = normalized.into_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

fn read_owner(lock_path: &Path) -> Option<LockOwner> {
    let content = std::fs::read_to_string(lock_path).ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_owner_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("ws");
        std::fs::create_dir(&target).unwrap();

        let handle = acquire(&target, Duration::from_secs(1)).unwrap();
        let owner = read_owner(&lock_path_for(&target)).unwrap();
        assert_eq!(owner.pid, std::process::id());
        drop(handle);
        assert!(!lock_path_for(&target).exists());
    }

    #[test]
    fn second_thread_blocks_then_acquires() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("ws");
        std::fs::create_dir(&target).unwrap();

        let handle = acquire(&target, Duration::from_secs(1)).unwrap();
        let target2 = target.clone();
        let waiter = std::thread::spawn(move || acquire(&target2, Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(200));
        drop(handle);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn zero_timeout_fails_fast_when_held() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("ws");
        std::fs::create_dir(&target).unwrap();

        let _handle = acquire(&target, Duration::from_secs(1)).unwrap();
        let result = acquire(&target, Duration::from_millis(0));
        assert!(matches!(result, Err(MemosError::LockTimeout(_))));
    }

    #[test]
    fn stale_lock_not_reclaimed_before_grace() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("ws");
        std::fs::create_dir(&target).unwrap();

        // Forge a lockfile from a PID that is genuinely dead: a child
        // that has already been reaped.
        let child = std::process::Command::new("true")
            .spawn()
            .and_then(|mut c| {
                let pid = c.id();
                c.wait().map(|_| pid)
            })
            .unwrap();
        let owner = LockOwner {
            pid: child,
            host: local_hostname(),
            acquired_at: Utc::now().to_rfc3339(),
        };
        std::fs::write(
            lock_path_for(&target),
            serde_json::to_string(&owner).unwrap(),
        )
        .unwrap();

        // Under the 5s grace the stale lock must not be broken.
        let result = acquire(&target, Duration::from_millis(300));
        assert!(matches!(result, Err(MemosError::LockTimeout(_))));

        // Past the grace window it is reclaimed.
        let handle = acquire(&target, Duration::from_secs(8)).unwrap();
        drop(handle);
    }

    #[test]
    fn acquire_many_sorts_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();
        let handles = acquire_many(&[&b, &a, &b], Duration::from_secs(1)).unwrap();
        assert_eq!(handles.len(), 2);
    }
}
