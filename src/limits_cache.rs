use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::accounts::AccountName;
use crate::error::{CxError, CxResult};
use crate::fs_store;
use crate::usage::UsageSnapshot;

const CACHE_VERSION: u32 = 1;

/// Which live source produced a cached snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchProvider {
    Api,
    Rpc,
}

impl FetchProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Rpc => "rpc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub snapshot: UsageSnapshot,
    pub fetched_at: DateTime<Utc>,
    pub provider: FetchProvider,
}

#[derive(Serialize)]
struct CacheFile<'a> {
    version: u32,
    accounts: &'a BTreeMap<String, CacheEntry>,
}

/// File-backed map of account -> last live usage fetch. Never expires
/// entries itself; readers pass the TTL they accept.
pub struct LimitsCache {
    path: PathBuf,
}

impl LimitsCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Returns the entry and its age when it is younger than `ttl`.
    pub fn get(
        &self,
        account: &AccountName,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<(CacheEntry, Duration)> {
        let entry = self.load().remove(account.as_str())?;
        let age = (now - entry.fetched_at).max(Duration::zero());
        (age < ttl).then_some((entry, age))
    }

    pub fn put(
        &self,
        account: &AccountName,
        snapshot: &UsageSnapshot,
        provider: FetchProvider,
        fetched_at: DateTime<Utc>,
    ) -> CxResult<()> {
        let mut accounts = self.load();
        accounts.insert(
            account.to_string(),
            CacheEntry {
                snapshot: snapshot.clone(),
                fetched_at,
                provider,
            },
        );
        let file = CacheFile {
            version: CACHE_VERSION,
            accounts: &accounts,
        };
        let data = serde_json::to_vec_pretty(&file).map_err(|err| CxError::json(&self.path, err))?;
        fs_store::write_atomic(&self.path, &data)
    }

    /// Any unreadable part of the file reads as missing.
    fn load(&self) -> BTreeMap<String, CacheEntry> {
        let root = match fs_store::read_optional(&self.path) {
            Ok(Some(data)) => serde_json::from_slice::<Value>(&data).unwrap_or(Value::Null),
            Ok(None) => return BTreeMap::new(),
            Err(err) => {
                tracing::debug!(error = %err, "limits cache unreadable");
                return BTreeMap::new();
            }
        };
        if root.get("version").and_then(Value::as_u64) != Some(u64::from(CACHE_VERSION)) {
            return BTreeMap::new();
        }
        let Some(accounts) = root.get("accounts").and_then(Value::as_object) else {
            return BTreeMap::new();
        };

        accounts
            .iter()
            .filter_map(|(name, entry)| {
                serde_json::from_value::<CacheEntry>(entry.clone())
                    .ok()
                    .map(|entry| (name.clone(), entry))
            })
            .collect()
    }
}
