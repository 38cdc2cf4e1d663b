//! Cross-process mutual exclusion around the Active Credential File.
//!
//! The lock is a directory: `mkdir` is atomic on every filesystem we care
//! about, so whoever creates it owns it. The owner writes `owner.json`
//! inside so that waiters can tell a live holder from one that crashed.
//! Liveness is probed with signal 0; this is a heuristic, `force` is the
//! guaranteed way out.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::accounts::AccountName;
use crate::error::{CxError, CxResult};
use crate::event_log::{next_trace_id, EventLog};
use crate::fs_store;

const OWNER_FILE_NAME: &str = "owner.json";
const MAX_ACQUIRE_ATTEMPTS: usize = 16;
const UNKNOWN_OWNER_GRACE: Duration = Duration::from_secs(10);

/// Returns whether a pid may still be running.
pub type ProcessProbe = Arc<dyn Fn(u32) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOwner {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub account: String,
}

impl LockOwner {
    fn current(account: &AccountName) -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            account: account.to_string(),
        }
    }
}

enum Holder {
    Live(Option<LockOwner>),
    Stale(Option<LockOwner>),
}

pub struct LockManager {
    lock_dir: PathBuf,
    probe: ProcessProbe,
    events: Arc<EventLog>,
    unknown_owner_grace: Duration,
}

impl LockManager {
    pub fn with_probe(lock_dir: PathBuf, events: Arc<EventLog>, probe: ProcessProbe) -> Self {
        Self {
            lock_dir,
            probe,
            events,
            unknown_owner_grace: UNKNOWN_OWNER_GRACE,
        }
    }

    #[cfg(test)]
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Takes the lock or fails with `Locked`. Never waits: a live holder
    /// blocks until it releases, and only `force` overrides it.
    pub fn acquire(&self, account: &AccountName, force: bool) -> CxResult<LockHandle> {
        if let Some(parent) = self.lock_dir.parent() {
            fs_store::ensure_private_dir(parent)?;
        }

        let trace_id = next_trace_id();
        let mut last_owner = None;
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            match fs::create_dir(&self.lock_dir) {
                Ok(()) => return self.claim(account, trace_id),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(CxError::io("failed to create lock", &self.lock_dir, err));
                }
            }

            let (owner, reason) = match self.inspect_holder() {
                Holder::Stale(owner) => (owner, "owner_not_running"),
                Holder::Live(owner) if force => (owner, "forced"),
                Holder::Live(owner) => {
                    return Err(match owner {
                        Some(owner) => CxError::locked(&owner.account, owner.pid, Some(owner.started_at)),
                        None => CxError::locked("unknown", 0, None),
                    });
                }
            };

            tracing::info!(
                lock = %self.lock_dir.display(),
                reason,
                owner_pid = owner.as_ref().map(|owner| owner.pid),
                "reclaiming auth lock"
            );
            self.events.write(
                "lock_reclaimed",
                &[
                    ("trace_id", Some(trace_id.clone())),
                    ("account", Some(account.to_string())),
                    ("reason", Some(reason.to_string())),
                    ("owner_account", owner.as_ref().map(|owner| owner.account.clone())),
                    ("owner_pid", owner.as_ref().map(|owner| owner.pid.to_string())),
                ],
            );
            remove_lock_dir(&self.lock_dir)?;
            last_owner = owner;
        }

        Err(match last_owner {
            Some(owner) => CxError::locked(&owner.account, owner.pid, Some(owner.started_at)),
            None => CxError::locked("unknown", 0, None),
        })
    }

    fn claim(&self, account: &AccountName, trace_id: String) -> CxResult<LockHandle> {
        let _ = fs::set_permissions(&self.lock_dir, fs::Permissions::from_mode(0o700));
        let owner = LockOwner::current(account);
        let owner_path = self.lock_dir.join(OWNER_FILE_NAME);
        let write = serde_json::to_vec_pretty(&owner)
            .map_err(|err| CxError::json(&owner_path, err))
            .and_then(|data| fs_store::write_atomic(&owner_path, &data));
        if let Err(err) = write {
            let _ = fs::remove_dir_all(&self.lock_dir);
            return Err(err);
        }

        tracing::debug!(lock = %self.lock_dir.display(), account = %account, "auth lock acquired");
        self.events.write(
            "lock_acquired",
            &[
                ("trace_id", Some(trace_id.clone())),
                ("account", Some(account.to_string())),
            ],
        );
        Ok(LockHandle {
            dir: self.lock_dir.clone(),
            owner,
            trace_id,
            events: Arc::clone(&self.events),
            released: false,
        })
    }

    fn inspect_holder(&self) -> Holder {
        let Some(owner) = read_owner(&self.lock_dir) else {
            // Either mid-creation by another process or left corrupt by a crash.
            let age = fs::metadata(&self.lock_dir)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok());
            return match age {
                Some(age) if age < self.unknown_owner_grace => Holder::Live(None),
                _ => Holder::Stale(None),
            };
        };

        if (self.probe)(owner.pid) {
            Holder::Live(Some(owner))
        } else {
            Holder::Stale(Some(owner))
        }
    }
}

/// Owning guard for the lock directory. Dropping it releases the lock,
/// so every exit path (including panics) gives the lock back.
pub struct LockHandle {
    dir: PathBuf,
    owner: LockOwner,
    trace_id: String,
    events: Arc<EventLog>,
    released: bool,
}

impl LockHandle {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn release(mut self) -> CxResult<()> {
        self.released = true;
        self.release_inner()
    }

    fn release_inner(&self) -> CxResult<()> {
        // A forced takeover means the directory is someone else's now.
        if read_owner(&self.dir).as_ref() != Some(&self.owner) {
            tracing::warn!(lock = %self.dir.display(), "auth lock was taken over; leaving it alone");
            return Ok(());
        }
        remove_lock_dir(&self.dir)?;
        self.events.write(
            "lock_released",
            &[
                ("trace_id", Some(self.trace_id.clone())),
                ("account", Some(self.owner.account.clone())),
            ],
        );
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.release_inner() {
            tracing::warn!(error = %err, "failed to release auth lock");
        }
    }
}

fn read_owner(lock_dir: &Path) -> Option<LockOwner> {
    let data = fs::read(lock_dir.join(OWNER_FILE_NAME)).ok()?;
    serde_json::from_slice(&data).ok()
}

fn remove_lock_dir(dir: &Path) -> CxResult<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CxError::io("failed to remove lock", dir, err)),
    }
}

/// Signal-0 probe. EPERM means the pid exists under another user, which
/// cannot be disproven, so it counts as alive.
pub fn process_is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    liveness(kill(Pid::from_raw(raw), None::<Signal>))
}

fn liveness(signal_result: nix::Result<()>) -> bool {
    match signal_result {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}
