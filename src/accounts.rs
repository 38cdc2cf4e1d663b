use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AUTH_FILE_NAME;
use crate::error::{CxError, CxResult};
use crate::fs_store;

const MAX_NAME_LEN: usize = 64;

/// Validated account name: `[A-Za-z0-9_-]{1,64}`. Safe to use as a path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountName(String);

impl AccountName {
    pub fn parse(raw: &str) -> CxResult<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_NAME_LEN
            && raw
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !valid {
            return Err(CxError::InvalidAccountName(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl FromStr for AccountName {
    type Err = CxError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for AccountName {
    type Error = CxError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<AccountName> for String {
    fn from(name: AccountName) -> Self {
        name.0
    }
}

/// Advisory per-account bookkeeping. Nothing depends on it for correctness.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountMetadata {
    pub created_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_login_status: Option<String>,
    pub last_login_checked_at: Option<DateTime<Utc>>,
}

pub struct AccountStore {
    accounts_dir: PathBuf,
}

impl AccountStore {
    pub fn new(accounts_dir: PathBuf) -> Self {
        Self { accounts_dir }
    }

    pub fn account_dir(&self, name: &AccountName) -> PathBuf {
        self.accounts_dir.join(name.as_str())
    }

    /// Where this account's Auth Snapshot lives. Absence means "never logged in".
    pub fn snapshot_path(&self, name: &AccountName) -> PathBuf {
        self.account_dir(name).join(AUTH_FILE_NAME)
    }

    fn metadata_path(&self, name: &AccountName) -> PathBuf {
        self.account_dir(name).join("meta.json")
    }

    pub fn exists(&self, name: &AccountName) -> bool {
        self.account_dir(name).is_dir()
    }

    pub fn require(&self, name: &AccountName) -> CxResult<()> {
        if self.exists(name) {
            Ok(())
        } else {
            Err(CxError::AccountNotFound(name.to_string()))
        }
    }

    pub fn create(&self, name: &AccountName) -> CxResult<()> {
        if self.exists(name) {
            return Err(CxError::AccountExists(name.to_string()));
        }
        fs_store::ensure_private_dir(&self.account_dir(name))?;
        self.save_metadata(
            name,
            &AccountMetadata {
                created_at: Some(Utc::now()),
                ..AccountMetadata::default()
            },
        )
    }

    pub fn remove(&self, name: &AccountName) -> CxResult<()> {
        self.require(name)?;
        let dir = self.account_dir(name);
        fs::remove_dir_all(&dir).map_err(|err| CxError::io("failed to remove", &dir, err))
    }

    pub fn list(&self) -> CxResult<Vec<AccountName>> {
        let entries = match fs::read_dir(&self.accounts_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(CxError::io("failed to list", &self.accounts_dir, err)),
        };

        let mut names = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let Some(raw) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match AccountName::parse(&raw) {
                Ok(name) => names.push(name),
                Err(_) => tracing::debug!(entry = %raw, "skipping non-account directory"),
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn read_snapshot(&self, name: &AccountName) -> CxResult<Option<Vec<u8>>> {
        fs_store::read_optional(&self.snapshot_path(name))
    }

    pub fn load_metadata(&self, name: &AccountName) -> AccountMetadata {
        let path = self.metadata_path(name);
        match fs_store::read_optional(&path) {
            Ok(Some(data)) => serde_json::from_slice(&data).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable metadata");
                AccountMetadata::default()
            }),
            _ => AccountMetadata::default(),
        }
    }

    pub fn save_metadata(&self, name: &AccountName, metadata: &AccountMetadata) -> CxResult<()> {
        let path = self.metadata_path(name);
        let data = serde_json::to_vec_pretty(metadata).map_err(|err| CxError::json(&path, err))?;
        fs_store::write_atomic(&path, &data)
    }

    /// Read-modify-write of metadata; failures are logged, never raised.
    pub fn touch_metadata(&self, name: &AccountName, update: impl FnOnce(&mut AccountMetadata)) {
        let mut metadata = self.load_metadata(name);
        update(&mut metadata);
        if let Err(err) = self.save_metadata(name, &metadata) {
            tracing::warn!(account = %name, error = %err, "failed to update account metadata");
        }
    }
}
