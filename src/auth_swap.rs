use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::accounts::{AccountName, AccountStore};
use crate::error::{CxError, CxResult};
use crate::event_log::EventLog;
use crate::fs_store;
use crate::lock::LockManager;

/// Swaps an account's Auth Snapshot in and out of the single Active
/// Credential File, always under the lock.
pub struct AuthSwap {
    active_path: PathBuf,
    accounts: Arc<AccountStore>,
    lock: LockManager,
    events: Arc<EventLog>,
}

impl AuthSwap {
    pub fn new(
        active_path: PathBuf,
        accounts: Arc<AccountStore>,
        lock: LockManager,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            active_path,
            accounts,
            lock,
            events,
        }
    }

    pub fn active_path(&self) -> &Path {
        &self.active_path
    }

    /// Lock, install `account`'s snapshot, run `task`, copy the (possibly
    /// refreshed) active file back into the snapshot, optionally put back
    /// what was active before, unlock.
    ///
    /// Capture, restore and release run whether `task` returns an error or
    /// panics; the task's error (or panic) is re-raised after cleanup.
    pub fn with_account_auth<T>(
        &self,
        account: &AccountName,
        force_lock: bool,
        restore_previous: bool,
        task: impl FnOnce() -> CxResult<T>,
    ) -> CxResult<T> {
        self.accounts.require(account)?;
        let handle = self.lock.acquire(account, force_lock)?;
        let trace_id = handle.trace_id().to_string();

        let previous = if restore_previous {
            Some(fs_store::read_optional(&self.active_path)?)
        } else {
            None
        };
        self.events.write(
            "auth_swap_start",
            &[
                ("trace_id", Some(trace_id.clone())),
                ("account", Some(account.to_string())),
                ("restore_previous", Some(restore_previous.to_string())),
            ],
        );

        // If the snapshot never made it into place, the active file still
        // belongs to someone else and must not be captured into `account`.
        let (outcome, installed) = match self.install_snapshot(account) {
            Ok(()) => (panic::catch_unwind(AssertUnwindSafe(task)), true),
            Err(err) => (Ok(Err(err)), false),
        };

        let mut cleanup_errors = Vec::new();
        if installed {
            if let Err(err) = self.capture_snapshot(account) {
                cleanup_errors.push(err);
            }
        }
        if let Some(previous) = previous {
            if let Err(err) = self.write_or_remove(&self.active_path, previous.as_deref()) {
                cleanup_errors.push(err);
            }
        }
        if let Err(err) = handle.release() {
            cleanup_errors.push(err);
        }

        let status = match &outcome {
            Ok(Ok(_)) => "success",
            Ok(Err(_)) => "error",
            Err(_) => "panic",
        };
        self.events.write(
            "auth_swap_done",
            &[
                ("trace_id", Some(trace_id)),
                ("account", Some(account.to_string())),
                ("task", Some(status.to_string())),
                ("cleanup_errors", Some(cleanup_errors.len().to_string())),
            ],
        );

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                for err in &cleanup_errors {
                    tracing::warn!(account = %account, error = %err, "auth swap cleanup failed");
                }
                panic::resume_unwind(payload)
            }
        };

        match result {
            Err(err) => {
                for cleanup in &cleanup_errors {
                    tracing::warn!(account = %account, error = %cleanup, "auth swap cleanup failed");
                }
                Err(err)
            }
            Ok(value) => match cleanup_errors.into_iter().next() {
                Some(err) => Err(err),
                None => Ok(value),
            },
        }
    }

    /// Copies the Active Credential File into `account`'s snapshot.
    pub fn import_default_auth_to_account(
        &self,
        account: &AccountName,
        force_lock: bool,
    ) -> CxResult<()> {
        self.accounts.require(account)?;
        let handle = self.lock.acquire(account, force_lock)?;
        let active = fs_store::read_optional(&self.active_path)?.ok_or_else(|| {
            CxError::NotLoggedIn(format!(
                "no active credential file at {}",
                self.active_path.display()
            ))
        })?;
        fs_store::write_atomic(&self.accounts.snapshot_path(account), &active)?;
        tracing::info!(account = %account, "imported active credentials");
        handle.release()
    }

    /// Installs `account`'s snapshot as the Active Credential File, leaving it there.
    pub fn apply_account_auth_to_default(
        &self,
        account: &AccountName,
        force_lock: bool,
    ) -> CxResult<()> {
        self.accounts.require(account)?;
        let handle = self.lock.acquire(account, force_lock)?;
        self.install_snapshot(account)?;
        tracing::info!(account = %account, "applied account credentials");
        handle.release()
    }

    fn install_snapshot(&self, account: &AccountName) -> CxResult<()> {
        let snapshot = self.accounts.read_snapshot(account)?;
        if snapshot.is_none() {
            tracing::debug!(account = %account, "no snapshot; account runs logged out");
        }
        self.write_or_remove(&self.active_path, snapshot.as_deref())
    }

    fn capture_snapshot(&self, account: &AccountName) -> CxResult<()> {
        let snapshot_path = self.accounts.snapshot_path(account);
        let active = fs_store::read_optional(&self.active_path)?;
        if active.is_some() && active == fs_store::read_optional(&snapshot_path)? {
            return Ok(());
        }
        self.write_or_remove(&snapshot_path, active.as_deref())
    }

    fn write_or_remove(&self, path: &Path, data: Option<&[u8]>) -> CxResult<()> {
        match data {
            Some(data) => fs_store::write_atomic(path, data),
            None => fs_store::remove_optional(path).map(|_| ()),
        }
    }
}
