use std::fmt;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::accounts::{AccountName, AccountStore};
use crate::error::{CxError, CxResult};
use crate::limits_cache::{FetchProvider, LimitsCache};
use crate::usage::UsageSnapshot;

/// Which usage source(s) a limits fetch may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderPreference {
    /// REST first, RPC for the accounts where REST failed.
    Auto,
    Api,
    Rpc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderTag {
    Cached,
    LiveApi,
    LiveRpc,
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cached => "cached",
            Self::LiveApi => "live-api",
            Self::LiveRpc => "live-rpc",
        })
    }
}

#[derive(Debug)]
pub enum LimitsOutcome {
    Cached {
        snapshot: UsageSnapshot,
        age: Duration,
        provider: FetchProvider,
    },
    LiveApi(UsageSnapshot),
    LiveRpc(UsageSnapshot),
    Failed {
        api_error: Option<CxError>,
        rpc_error: Option<CxError>,
    },
}

impl LimitsOutcome {
    pub fn tag(&self) -> Option<ProviderTag> {
        match self {
            Self::Cached { .. } => Some(ProviderTag::Cached),
            Self::LiveApi(_) => Some(ProviderTag::LiveApi),
            Self::LiveRpc(_) => Some(ProviderTag::LiveRpc),
            Self::Failed { .. } => None,
        }
    }

    pub fn snapshot(&self) -> Option<&UsageSnapshot> {
        match self {
            Self::Cached { snapshot, .. } | Self::LiveApi(snapshot) | Self::LiveRpc(snapshot) => {
                Some(snapshot)
            }
            Self::Failed { .. } => None,
        }
    }

    /// Both provider errors, labeled, when both were tried.
    pub fn error_message(&self) -> Option<String> {
        let Self::Failed {
            api_error,
            rpc_error,
        } = self
        else {
            return None;
        };
        match (api_error, rpc_error) {
            (Some(api), Some(rpc)) => Some(format!("api: {api}; rpc: {rpc}")),
            (Some(err), None) | (None, Some(err)) => Some(err.to_string()),
            (None, None) => Some("no provider attempted".to_string()),
        }
    }

    pub fn needs_login(&self) -> bool {
        match self {
            Self::Failed {
                api_error,
                rpc_error,
            } => [api_error, rpc_error]
                .into_iter()
                .flatten()
                .any(CxError::needs_login),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct AccountLimits {
    pub account: AccountName,
    pub outcome: LimitsOutcome,
}

#[derive(Debug, Clone, Copy)]
pub struct LimitsRequest {
    pub preference: ProviderPreference,
    pub use_cache: bool,
    pub ttl: Duration,
}

pub type UsageFetcher = Arc<dyn Fn(&AccountName) -> CxResult<UsageSnapshot> + Send + Sync>;
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct LimitsOrchestrator {
    api: UsageFetcher,
    rpc: UsageFetcher,
    cache: LimitsCache,
    store: Arc<AccountStore>,
    clock: Clock,
}

impl LimitsOrchestrator {
    pub fn new(
        api: UsageFetcher,
        rpc: UsageFetcher,
        cache: LimitsCache,
        store: Arc<AccountStore>,
        clock: Clock,
    ) -> Self {
        Self {
            api,
            rpc,
            cache,
            store,
            clock,
        }
    }

    /// Produces exactly one outcome per requested account, in request order.
    /// One account's failure never stops the others.
    pub fn fetch(&self, accounts: &[AccountName], request: &LimitsRequest) -> Vec<AccountLimits> {
        let mut outcomes: Vec<Option<LimitsOutcome>> = accounts
            .iter()
            .map(|account| {
                if !request.use_cache {
                    return None;
                }
                let (entry, age) = self.cache.get(account, request.ttl, (self.clock)())?;
                tracing::debug!(account = %account, age_secs = age.num_seconds(), "limits cache hit");
                Some(LimitsOutcome::Cached {
                    snapshot: entry.snapshot,
                    age,
                    provider: entry.provider,
                })
            })
            .collect();

        let pending: Vec<usize> = (0..accounts.len())
            .filter(|index| outcomes[*index].is_none())
            .collect();

        let mut api_errors: Vec<(usize, CxError)> = Vec::new();
        match request.preference {
            ProviderPreference::Api | ProviderPreference::Auto => {
                let targets: Vec<&AccountName> = pending.iter().map(|index| &accounts[*index]).collect();
                for (index, result) in pending.iter().zip(self.fetch_api_concurrently(&targets)) {
                    match result {
                        Ok(snapshot) => {
                            self.record_live(&accounts[*index], &snapshot, FetchProvider::Api);
                            outcomes[*index] = Some(LimitsOutcome::LiveApi(snapshot));
                        }
                        Err(err) => api_errors.push((*index, err)),
                    }
                }
            }
            ProviderPreference::Rpc => {}
        }

        let rpc_targets: Vec<(usize, Option<CxError>)> = match request.preference {
            ProviderPreference::Api => {
                for (index, err) in api_errors {
                    self.record_failure(&accounts[index], &err);
                    outcomes[index] = Some(LimitsOutcome::Failed {
                        api_error: Some(err),
                        rpc_error: None,
                    });
                }
                Vec::new()
            }
            ProviderPreference::Auto => api_errors
                .into_iter()
                .map(|(index, err)| {
                    tracing::info!(account = %accounts[index], error = %err, "api fetch failed; trying rpc");
                    (index, Some(err))
                })
                .collect(),
            ProviderPreference::Rpc => pending.iter().map(|index| (*index, None)).collect(),
        };

        // The RPC path swaps the shared active file, so it runs one account at a time.
        for (index, api_error) in rpc_targets {
            let account = &accounts[index];
            match (self.rpc)(account) {
                Ok(snapshot) => {
                    self.record_live(account, &snapshot, FetchProvider::Rpc);
                    outcomes[index] = Some(LimitsOutcome::LiveRpc(snapshot));
                }
                Err(rpc_error) => {
                    let outcome = LimitsOutcome::Failed {
                        api_error,
                        rpc_error: Some(rpc_error),
                    };
                    if let Some(message) = outcome.error_message() {
                        self.stamp_login_status(account, message);
                    }
                    outcomes[index] = Some(outcome);
                }
            }
        }

        accounts
            .iter()
            .zip(outcomes)
            .map(|(account, outcome)| AccountLimits {
                account: account.clone(),
                outcome: outcome.unwrap_or(LimitsOutcome::Failed {
                    api_error: None,
                    rpc_error: None,
                }),
            })
            .collect()
    }

    fn fetch_api_concurrently(&self, targets: &[&AccountName]) -> Vec<CxResult<UsageSnapshot>> {
        let api = &self.api;
        thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|account| scope.spawn(move || api(account)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(CxError::ProviderFetchFailed("api fetch panicked".to_string()))
                    })
                })
                .collect()
        })
    }

    fn record_live(&self, account: &AccountName, snapshot: &UsageSnapshot, provider: FetchProvider) {
        if let Err(err) = self.cache.put(account, snapshot, provider, (self.clock)()) {
            tracing::warn!(account = %account, error = %err, "failed to write limits cache");
        }
        self.stamp_login_status(account, "ok".to_string());
    }

    fn record_failure(&self, account: &AccountName, err: &CxError) {
        self.stamp_login_status(account, err.to_string());
    }

    fn stamp_login_status(&self, account: &AccountName, status: String) {
        if !self.store.exists(account) {
            return;
        }
        let checked_at = (self.clock)();
        self.store.touch_metadata(account, |meta| {
            meta.last_login_status = Some(status);
            meta.last_login_checked_at = Some(checked_at);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::UsageWindow;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        store: Arc<AccountStore>,
        cache_path: std::path::PathBuf,
        now: Arc<Mutex<DateTime<Utc>>>,
        api_calls: Arc<AtomicUsize>,
        rpc_calls: Arc<AtomicUsize>,
    }

    fn snapshot(percent: f64) -> UsageSnapshot {
        UsageSnapshot {
            primary: Some(UsageWindow {
                used_percent: Some(percent),
                window_minutes: 300,
                resets_at: None,
            }),
            ..UsageSnapshot::default()
        }
    }

    fn names(raw: &[&str]) -> Vec<AccountName> {
        raw.iter()
            .map(|name| AccountName::parse(name).expect("name"))
            .collect()
    }

    fn fixture(accounts: &[&str]) -> Fixture {
        let temp = TempDir::new().expect("temp dir");
        let store = Arc::new(AccountStore::new(temp.path().join("accounts")));
        for account in names(accounts) {
            store.create(&account).expect("create");
        }
        Fixture {
            cache_path: temp.path().join("limits-cache.json"),
            store,
            now: Arc::new(Mutex::new(Utc::now())),
            api_calls: Arc::new(AtomicUsize::new(0)),
            rpc_calls: Arc::new(AtomicUsize::new(0)),
            _temp: temp,
        }
    }

    /// Fetchers succeed only for the listed accounts.
    fn orchestrator(fx: &Fixture, api_ok: &[&str], rpc_ok: &[&str]) -> LimitsOrchestrator {
        let api_ok: HashSet<String> = api_ok.iter().map(|name| name.to_string()).collect();
        let rpc_ok: HashSet<String> = rpc_ok.iter().map(|name| name.to_string()).collect();
        let api_calls = Arc::clone(&fx.api_calls);
        let rpc_calls = Arc::clone(&fx.rpc_calls);
        let now = Arc::clone(&fx.now);
        LimitsOrchestrator::new(
            Arc::new(move |account: &AccountName| {
                api_calls.fetch_add(1, Ordering::SeqCst);
                if api_ok.contains(account.as_str()) {
                    Ok(snapshot(10.0))
                } else {
                    Err(CxError::TokenExpired("usage rejected".to_string()))
                }
            }),
            Arc::new(move |account: &AccountName| {
                rpc_calls.fetch_add(1, Ordering::SeqCst);
                if rpc_ok.contains(account.as_str()) {
                    Ok(snapshot(20.0))
                } else {
                    Err(CxError::ProviderUnavailable("codex not found".to_string()))
                }
            }),
            LimitsCache::new(fx.cache_path.clone()),
            Arc::clone(&fx.store),
            Arc::new(move || *now.lock().expect("clock")),
        )
    }

    fn request(preference: ProviderPreference) -> LimitsRequest {
        LimitsRequest {
            preference,
            use_cache: true,
            ttl: Duration::seconds(300),
        }
    }

    #[test]
    fn second_fetch_within_ttl_is_served_from_cache() {
        let fx = fixture(&["work"]);
        let orchestrator = orchestrator(&fx, &["work"], &[]);
        let accounts = names(&["work"]);

        let first = orchestrator.fetch(&accounts, &request(ProviderPreference::Api));
        assert_eq!(first[0].outcome.tag(), Some(ProviderTag::LiveApi));

        *fx.now.lock().expect("clock") += Duration::seconds(5);
        let second = orchestrator.fetch(&accounts, &request(ProviderPreference::Api));
        match &second[0].outcome {
            LimitsOutcome::Cached { age, provider, snapshot: cached } => {
                assert_eq!(*age, Duration::seconds(5));
                assert_eq!(*provider, FetchProvider::Api);
                assert_eq!(cached, &snapshot(10.0));
            }
            other => panic!("expected cached outcome, got {other:?}"),
        }
        assert_eq!(fx.api_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_cache_skips_reads_but_still_writes() {
        let fx = fixture(&["work"]);
        let orchestrator = orchestrator(&fx, &["work"], &[]);
        let accounts = names(&["work"]);
        let mut no_cache = request(ProviderPreference::Api);
        no_cache.use_cache = false;

        orchestrator.fetch(&accounts, &no_cache);
        orchestrator.fetch(&accounts, &no_cache);
        assert_eq!(fx.api_calls.load(Ordering::SeqCst), 2);

        let cached = orchestrator.fetch(&accounts, &request(ProviderPreference::Api));
        assert_eq!(cached[0].outcome.tag(), Some(ProviderTag::Cached));
    }

    #[test]
    fn auto_falls_back_to_rpc_only_for_failed_accounts() {
        let fx = fixture(&["alpha", "beta"]);
        let orchestrator = orchestrator(&fx, &["beta"], &["alpha"]);
        let results = orchestrator.fetch(&names(&["alpha", "beta"]), &request(ProviderPreference::Auto));

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].account.as_str(), "alpha");
        assert_eq!(results[0].outcome.tag(), Some(ProviderTag::LiveRpc));
        assert_eq!(results[0].outcome.snapshot(), Some(&snapshot(20.0)));
        assert_eq!(results[1].outcome.tag(), Some(ProviderTag::LiveApi));
        assert_eq!(fx.api_calls.load(Ordering::SeqCst), 2);
        assert_eq!(fx.rpc_calls.load(Ordering::SeqCst), 1);

        let alpha = AccountName::parse("alpha").expect("name");
        let meta = fx.store.load_metadata(&alpha);
        assert_eq!(meta.last_login_status.as_deref(), Some("ok"));
        assert!(meta.last_login_checked_at.is_some());
    }

    #[test]
    fn failing_both_providers_reports_both_errors() {
        let fx = fixture(&["alpha", "beta"]);
        let orchestrator = orchestrator(&fx, &["beta"], &[]);
        let results = orchestrator.fetch(&names(&["alpha", "beta"]), &request(ProviderPreference::Auto));

        let message = results[0].outcome.error_message().expect("error");
        assert!(message.starts_with("api: token expired"), "{message}");
        assert!(message.contains("; rpc: provider unavailable"), "{message}");
        assert!(results[0].outcome.needs_login());
        assert_eq!(results[1].outcome.tag(), Some(ProviderTag::LiveApi));

        let alpha = AccountName::parse("alpha").expect("name");
        assert_eq!(fx.store.load_metadata(&alpha).last_login_status, Some(message));
    }

    #[test]
    fn single_provider_modes_never_touch_the_other() {
        let fx = fixture(&["work"]);
        let orchestrator = orchestrator(&fx, &[], &["work"]);
        let accounts = names(&["work"]);

        let api_only = orchestrator.fetch(&accounts, &request(ProviderPreference::Api));
        assert!(matches!(
            api_only[0].outcome,
            LimitsOutcome::Failed {
                api_error: Some(_),
                rpc_error: None
            }
        ));
        assert_eq!(fx.rpc_calls.load(Ordering::SeqCst), 0);

        let rpc_only = orchestrator.fetch(&accounts, &request(ProviderPreference::Rpc));
        assert_eq!(rpc_only[0].outcome.tag(), Some(ProviderTag::LiveRpc));
        assert_eq!(fx.api_calls.load(Ordering::SeqCst), 1);
    }
}
