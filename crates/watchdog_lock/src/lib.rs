//! Cross-process exclusive lock guarding the simulate-then-submit critical section.
//!
//! Acquisition order is: in-process mutex, then `flock(LOCK_EX)` on the lock file, then the
//! watchdog timer. Release runs in reverse. A holder that keeps the lock past the ceiling is
//! terminated by the watchdog; cooperating processes must never starve behind a stuck holder.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// Exit status of a process killed by its own watchdog.
pub const WATCHDOG_EXIT_CODE: i32 = 70;
pub const DEFAULT_CEILING: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize)]
pub struct HolderInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub held_ms: u64,
}

#[derive(Debug, Clone)]
pub struct WatchdogExpiry {
    pub path: PathBuf,
    pub pid: u32,
    pub ceiling: Duration,
    pub acquired_at: DateTime<Utc>,
}

pub type ExpiryHook = Arc<dyn Fn(&WatchdogExpiry) + Send + Sync>;

/// Default expiry hook.
pub fn terminate_process(expiry: &WatchdogExpiry) {
    tracing::error!(
        path = %expiry.path.display(),
        pid = expiry.pid,
        ceiling_ms = expiry.ceiling.as_millis() as u64,
        acquired_at = %expiry.acquired_at,
        "cross-process lock held past ceiling, terminating"
    );
    eprintln!(
        "watchdog: lock {} held since {} exceeded {:?}, exiting",
        expiry.path.display(),
        expiry.acquired_at,
        expiry.ceiling
    );
    std::process::exit(WATCHDOG_EXIT_CODE);
}

/// An acquired `flock`. Dropping it unlocks, so a flock that completes after its `lock()`
/// future was dropped is released instead of leaking.
struct FlockGuard {
    file: Option<Arc<File>>,
}

impl FlockGuard {
    fn release(mut self) -> std::io::Result<()> {
        match self.file.take() {
            Some(file) => FileExt::unlock(&*file),
            None => Ok(()),
        }
    }
}

impl Drop for FlockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&*file);
        }
    }
}

struct Held {
    _in_process: OwnedMutexGuard<()>,
    flock: FlockGuard,
    watchdog: JoinHandle<()>,
    acquired: Instant,
    acquired_at: DateTime<Utc>,
}

pub struct WatchdogLock {
    path: PathBuf,
    file: Arc<File>,
    in_process: Arc<AsyncMutex<()>>,
    ceiling: Duration,
    on_expiry: ExpiryHook,
    held: Mutex<Option<Held>>,
}

impl fmt::Debug for WatchdogLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchdogLock")
            .field("path", &self.path)
            .field("ceiling", &self.ceiling)
            .field("held", &self.held.lock().is_some())
            .finish()
    }
}

impl WatchdogLock {
    /// Opens (creating if needed) the lock file. Nothing is locked yet.
    pub fn open(path: impl AsRef<Path>, ceiling: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create lock dir {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        Ok(Self {
            path,
            file: Arc::new(file),
            in_process: Arc::new(AsyncMutex::new(())),
            ceiling,
            on_expiry: Arc::new(terminate_process),
            held: Mutex::new(None),
        })
    }

    pub fn with_expiry_hook(mut self, hook: ExpiryHook) -> Self {
        self.on_expiry = hook;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Cancel-safe: if this future is dropped while the OS lock is still being waited for, the
    /// OS lock is released as soon as the blocking wait completes.
    pub async fn lock(&self) -> Result<()> {
        let in_process = self.in_process.clone().lock_owned().await;

        let file = self.file.clone();
        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let locked = FileExt::lock_exclusive(&*file).map(|()| FlockGuard { file: Some(file) });
            // A dropped receiver drops the guard with the message, which unlocks.
            let _ = tx.send(locked);
        });
        let flock = rx
            .await
            .context("flock task gone")?
            .with_context(|| format!("flock {}", self.path.display()))?;

        let acquired_at = Utc::now();
        let expiry = WatchdogExpiry {
            path: self.path.clone(),
            pid: std::process::id(),
            ceiling: self.ceiling,
            acquired_at,
        };
        let hook = self.on_expiry.clone();
        let ceiling = self.ceiling;
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(ceiling).await;
            hook(&expiry);
        });

        *self.held.lock() = Some(Held {
            _in_process: in_process,
            flock,
            watchdog,
            acquired: Instant::now(),
            acquired_at,
        });
        tracing::info!(path = %self.path.display(), "locked cross-process lock");
        Ok(())
    }

    /// Cancels the watchdog, releases the OS lock, then the in-process lock.
    ///
    /// # Panics
    ///
    /// When the lock is not held: unlocking without a successful `lock()` means the caller's lock
    /// discipline is broken.
    pub fn unlock(&self) -> Result<()> {
        let Some(held) = self.held.lock().take() else {
            panic!(
                "cross-process lock {} unlocked without being locked",
                self.path.display()
            );
        };
        let Held {
            _in_process: in_process,
            flock,
            watchdog,
            acquired,
            ..
        } = held;
        watchdog.abort();
        let released = flock.release();
        let held_ms = acquired.elapsed().as_millis() as u64;
        drop(in_process);
        released.with_context(|| format!("funlock {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), held_ms, "unlocked cross-process lock");
        Ok(())
    }

    /// Locks and returns a guard that unlocks when released or dropped.
    pub async fn acquire(self: &Arc<Self>) -> Result<WatchdogGuard> {
        self.lock().await?;
        Ok(WatchdogGuard {
            lock: self.clone(),
            released: false,
        })
    }

    pub fn holder(&self) -> Option<HolderInfo> {
        self.held.lock().as_ref().map(|held| HolderInfo {
            pid: std::process::id(),
            acquired_at: held.acquired_at,
            held_ms: held.acquired.elapsed().as_millis() as u64,
        })
    }

    pub fn is_held(&self) -> bool {
        self.held.lock().is_some()
    }
}

pub struct WatchdogGuard {
    lock: Arc<WatchdogLock>,
    released: bool,
}

impl fmt::Debug for WatchdogGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchdogGuard")
            .field("path", &self.lock.path)
            .field("released", &self.released)
            .finish()
    }
}

impl WatchdogGuard {
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.unlock()
    }
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.lock.unlock() {
            tracing::error!(?err, "failed to release cross-process lock");
        }
    }
}
