use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::accounts::{AccountName, AccountStore};
use crate::auth_swap::AuthSwap;
use crate::config::Settings;
use crate::credentials::{
    default_process_runner, parse_codex_credentials, CredentialLocator, Keychain, ProcessRunner,
};
use crate::error::{CxError, CxResult};
use crate::event_log::EventLog;
use crate::fs_store;
use crate::limits::{
    AccountLimits, Clock, LimitsOrchestrator, LimitsOutcome, LimitsRequest, ProviderPreference,
    ProviderTag, UsageFetcher,
};
use crate::limits_cache::{FetchProvider, LimitsCache};
use crate::lock::{process_is_alive, LockManager, ProcessProbe};
use crate::rpc_client::{self, RpcClientConfig};
use crate::runner::{run_wrapped, WrappedCommand};
use crate::usage::{UsageSnapshot, UsageWindow};
use crate::usage_client::{
    http_refresh_transport, http_usage_transport, RefreshTransport, UsageClient, UsageTransport,
};

pub struct CxAuthApp {
    settings: Settings,
    accounts: Arc<AccountStore>,
    auth_swap: Arc<AuthSwap>,
    limits: LimitsOrchestrator,
    clock: Clock,
}

impl CxAuthApp {
    pub fn new(settings: Settings) -> Self {
        let refresh_transport = http_refresh_transport(
            settings.token_endpoint.clone(),
            settings.oauth_client_id.clone(),
            settings.refresh_timeout,
        );
        let usage_transport =
            http_usage_transport(settings.usage_endpoint.clone(), settings.usage_timeout);

        Self::with_clients(
            settings,
            Arc::new(default_process_runner),
            refresh_transport,
            usage_transport,
            Arc::new(process_is_alive),
            Arc::new(Utc::now),
        )
    }

    pub(crate) fn with_clients(
        settings: Settings,
        process_runner: ProcessRunner,
        refresh_transport: RefreshTransport,
        usage_transport: UsageTransport,
        probe: ProcessProbe,
        clock: Clock,
    ) -> Self {
        let events = Arc::new(EventLog::new(settings.logs_dir()));
        let accounts = Arc::new(AccountStore::new(settings.accounts_dir()));
        let lock = LockManager::with_probe(settings.swap_lock_dir(), Arc::clone(&events), probe);
        let auth_swap = Arc::new(AuthSwap::new(
            settings.active_auth_path(),
            Arc::clone(&accounts),
            lock,
            Arc::clone(&events),
        ));

        let keychain = settings.keychain_enabled.then(|| {
            Keychain::new(
                settings.keychain_service_name.clone(),
                settings.security_executable.clone(),
                process_runner,
            )
        });
        let locator = CredentialLocator::new(
            settings.active_auth_path(),
            settings.env_codex_home.clone(),
            settings.home_dir.clone(),
            keychain,
        );
        let usage_client = UsageClient::new(
            locator,
            refresh_transport,
            usage_transport,
            settings.stale_after,
            settings.locks_dir(),
            Arc::clone(&events),
        );

        let api_accounts = Arc::clone(&accounts);
        let api_fetcher: UsageFetcher = Arc::new(move |account: &AccountName| {
            let snapshot_path = require_usable_snapshot(&api_accounts, account)?;
            usage_client.fetch_usage(Some(&snapshot_path))
        });

        let rpc_config = RpcClientConfig {
            program: settings.codex_bin.clone(),
            args: settings.codex_rpc_args.clone(),
            codex_home: settings.codex_home.clone(),
            message_timeout: settings.rpc_message_timeout,
        };
        let rpc_swap = Arc::clone(&auth_swap);
        let rpc_fetcher: UsageFetcher = Arc::new(move |account: &AccountName| {
            rpc_swap.with_account_auth(account, false, true, || {
                rpc_client::fetch_rate_limits(&rpc_config)
            })
        });

        let limits = LimitsOrchestrator::new(
            api_fetcher,
            rpc_fetcher,
            LimitsCache::new(settings.limits_cache_path()),
            Arc::clone(&accounts),
            Arc::clone(&clock),
        );

        Self {
            settings,
            accounts,
            auth_swap,
            limits,
            clock,
        }
    }

    /// Runs the wrapped tool as `account` and returns its exit code.
    pub fn run(
        &self,
        account: &AccountName,
        force: bool,
        restore: bool,
        args: Vec<String>,
    ) -> CxResult<i32> {
        let command = WrappedCommand {
            program: self.settings.codex_bin.clone(),
            args,
            codex_home: self.settings.codex_home.clone(),
        };
        let code = self
            .auth_swap
            .with_account_auth(account, force, restore, || run_wrapped(&command))?;
        let now = (self.clock)();
        self.accounts
            .touch_metadata(account, |meta| meta.last_used_at = Some(now));
        Ok(code)
    }

    pub fn import(&self, account: &AccountName, force: bool) -> CxResult<()> {
        self.auth_swap.import_default_auth_to_account(account, force)?;
        println!(
            "imported {} into account '{}'",
            self.auth_swap.active_path().display(),
            account
        );
        Ok(())
    }

    pub fn apply(&self, account: &AccountName, force: bool) -> CxResult<()> {
        self.auth_swap.apply_account_auth_to_default(account, force)?;
        println!(
            "account '{}' is now active in {}",
            account,
            self.auth_swap.active_path().display()
        );
        Ok(())
    }

    pub fn add(&self, account: &AccountName) -> CxResult<()> {
        self.accounts.create(account)?;
        println!("added account '{account}'; log in with: cxauth run {account} -- login");
        Ok(())
    }

    pub fn remove(&self, account: &AccountName, delete_data: bool) -> CxResult<()> {
        self.accounts.require(account)?;
        if !delete_data {
            return Err(CxError::Usage(format!(
                "refusing to remove '{account}' without --delete-data (its saved login would be lost)"
            )));
        }
        self.accounts.remove(account)?;
        println!("removed account '{account}'");
        Ok(())
    }

    pub fn list(&self) -> CxResult<()> {
        for line in self.list_lines()? {
            println!("{line}");
        }
        Ok(())
    }

    fn list_lines(&self) -> CxResult<Vec<String>> {
        let names = self.accounts.list()?;
        if names.is_empty() {
            return Ok(vec!["no accounts; add one with `cxauth add <name>`".to_string()]);
        }

        let active = fs_store::read_optional(self.auth_swap.active_path())?;
        let now = (self.clock)();
        let mut lines = Vec::new();
        for name in names {
            let snapshot = self.accounts.read_snapshot(&name)?;
            let marker = if active.is_some() && snapshot == active {
                "*"
            } else {
                " "
            };
            let login = match snapshot.as_deref().and_then(parse_codex_credentials) {
                None => "not logged in".to_string(),
                Some(credentials) => {
                    let who = credentials
                        .email()
                        .or_else(|| credentials.api_key.as_ref().map(|_| "api key".to_string()))
                        .unwrap_or_else(|| "logged in".to_string());
                    match credentials.plan() {
                        Some(plan) => format!("{who} ({plan})"),
                        None => who,
                    }
                }
            };
            let last_used = self
                .accounts
                .load_metadata(&name)
                .last_used_at
                .map(|at| format!("{} ago", format_duration((now - at).num_seconds().max(0))))
                .unwrap_or_else(|| "never".to_string());
            lines.push(format!("{marker} {name:<16} {login:<40} last used {last_used}"));
        }
        Ok(lines)
    }

    pub fn fetch_limits(
        &self,
        accounts: Vec<AccountName>,
        request: &LimitsRequest,
    ) -> CxResult<Vec<AccountLimits>> {
        let targets = if accounts.is_empty() {
            self.accounts.list()?
        } else {
            accounts
        };
        if targets.is_empty() {
            return Err(CxError::Usage(
                "no accounts; add one with `cxauth add <name>`".to_string(),
            ));
        }
        Ok(self.limits.fetch(&targets, request))
    }

    /// Prints per-account limits; the exit code reflects the worst failure.
    pub fn limits(
        &self,
        accounts: Vec<AccountName>,
        provider: Option<ProviderPreference>,
        no_cache: bool,
        ttl_seconds: Option<u64>,
        json: bool,
    ) -> CxResult<i32> {
        let ttl = ttl_seconds
            .map(std::time::Duration::from_secs)
            .unwrap_or(self.settings.limits_ttl);
        let request = LimitsRequest {
            preference: provider.unwrap_or(self.settings.limits_provider),
            use_cache: !no_cache,
            ttl: chrono::Duration::from_std(ttl)
                .map_err(|_| CxError::Usage("--ttl is out of range".to_string()))?,
        };
        let results = self.fetch_limits(accounts, &request)?;

        if json {
            let rows: Vec<LimitsRow<'_>> = results.iter().map(LimitsRow::from).collect();
            let text = serde_json::to_string_pretty(&rows).map_err(|err| {
                CxError::Usage(format!("failed to serialize limits output: {err}"))
            })?;
            println!("{text}");
        } else {
            let now = (self.clock)();
            for result in &results {
                println!("{}", limits_line(result, now));
            }
        }
        Ok(limits_exit_code(&results))
    }
}

/// The API path must only ever read this account's own snapshot; letting the
/// credential chain fall through would report another login's usage.
fn require_usable_snapshot(accounts: &AccountStore, account: &AccountName) -> CxResult<PathBuf> {
    accounts.require(account)?;
    let usable = accounts
        .read_snapshot(account)?
        .as_deref()
        .and_then(parse_codex_credentials)
        .is_some_and(|credentials| credentials.is_usable());
    if !usable {
        return Err(CxError::NotLoggedIn(format!(
            "account '{account}' has no saved login; run `cxauth run {account} -- login`"
        )));
    }
    Ok(accounts.snapshot_path(account))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LimitsRow<'a> {
    account: &'a str,
    provider: Option<ProviderTag>,
    cached_from: Option<FetchProvider>,
    age_seconds: Option<i64>,
    snapshot: Option<&'a UsageSnapshot>,
    error: Option<String>,
    needs_login: bool,
}

impl<'a> From<&'a AccountLimits> for LimitsRow<'a> {
    fn from(result: &'a AccountLimits) -> Self {
        let (cached_from, age_seconds) = match &result.outcome {
            LimitsOutcome::Cached { age, provider, .. } => (Some(*provider), Some(age.num_seconds())),
            _ => (None, None),
        };
        Self {
            account: result.account.as_str(),
            provider: result.outcome.tag(),
            cached_from,
            age_seconds,
            snapshot: result.outcome.snapshot(),
            error: result.outcome.error_message(),
            needs_login: result.outcome.needs_login(),
        }
    }
}

fn limits_exit_code(results: &[AccountLimits]) -> i32 {
    let failed: Vec<&LimitsOutcome> = results
        .iter()
        .map(|result| &result.outcome)
        .filter(|outcome| outcome.tag().is_none())
        .collect();
    if failed.is_empty() {
        0
    } else if failed.iter().any(|outcome| outcome.needs_login()) {
        4
    } else {
        5
    }
}

fn limits_line(result: &AccountLimits, now: DateTime<Utc>) -> String {
    let account = &result.account;
    let Some(snapshot) = result.outcome.snapshot() else {
        let message = result
            .outcome
            .error_message()
            .unwrap_or_else(|| "unknown error".to_string());
        let hint = if result.outcome.needs_login() {
            format!(" (log in again: cxauth run {account} -- login)")
        } else {
            String::new()
        };
        return format!("{account}: error: {message}{hint}");
    };

    let windows = [snapshot.primary.as_ref(), snapshot.secondary.as_ref()]
        .into_iter()
        .flatten()
        .map(|window| format_window(window, now))
        .collect::<Vec<_>>();
    let windows = if windows.is_empty() {
        "no usage windows".to_string()
    } else {
        windows.join("  ")
    };
    let plan = snapshot.plan_type.as_deref().unwrap_or("-");
    let credits = snapshot
        .credits
        .as_ref()
        .and_then(|credits| credits.balance.as_deref())
        .map(|balance| format!("  credits={balance}"))
        .unwrap_or_default();
    let source = match &result.outcome {
        LimitsOutcome::Cached { age, provider, .. } => {
            format!("cached ({}) {}s ago", provider.as_str(), age.num_seconds())
        }
        outcome => outcome
            .tag()
            .map(|tag| tag.to_string())
            .unwrap_or_default(),
    };
    format!("{account}: {windows}  plan={plan}{credits}  [{source}]")
}

fn format_window(window: &UsageWindow, now: DateTime<Utc>) -> String {
    format!(
        "{} {}",
        window_label(window.window_minutes),
        format_usage_window(window.used_percent, window.resets_at.as_ref(), now)
    )
}

fn window_label(minutes: i64) -> String {
    if minutes > 0 && minutes % 1_440 == 0 {
        format!("{}d", minutes / 1_440)
    } else if minutes > 0 && minutes % 60 == 0 {
        format!("{}h", minutes / 60)
    } else {
        format!("{minutes}m")
    }
}

fn format_usage_window(
    percent: Option<f64>,
    reset_at: Option<&DateTime<Utc>>,
    now: DateTime<Utc>,
) -> String {
    let percent_text = percent
        .map(|value| format!("{}%", value.round() as i64))
        .unwrap_or_else(|| "--".to_string());
    let reset_text = reset_at
        .map(|date| {
            let remaining = (*date - now).num_seconds();
            if remaining <= 0 {
                "reset".to_string()
            } else {
                format_duration(remaining)
            }
        })
        .unwrap_or_else(|| "--".to_string());
    format!("{percent_text} ({reset_text})")
}

fn format_duration(seconds: i64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
