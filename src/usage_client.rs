use std::fs::{self, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::credentials::{
    get_path_string, parse_codex_credentials, value_as_string, CodexCredentials,
    CredentialLocator, CredentialSource, LoadedCredentials, RefreshedTokens,
};
use crate::error::{CxError, CxResult};
use crate::event_log::{next_trace_id, short_hash_hex, token_fingerprint, EventLog};
use crate::fs_store;
use crate::usage::UsageSnapshot;

const REFRESH_SCOPE: &str = "openid profile email";

#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpReply {
    fn is_auth_failure(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// `refresh_token -> reply` from the OAuth token endpoint.
pub type RefreshTransport = Arc<dyn Fn(&str) -> Result<HttpReply, TransportError> + Send + Sync>;
/// `(access_token, account_id) -> reply` from the usage endpoint.
pub type UsageTransport =
    Arc<dyn Fn(&str, Option<&str>) -> Result<HttpReply, TransportError> + Send + Sync>;

/// Why a refresh did not produce new tokens.
#[derive(Debug)]
pub enum RefreshFailure {
    /// Only an interactive login fixes this.
    Terminal(CxError),
    /// Network trouble or an unrecognized reply; the old token is still tried.
    Unavailable(String),
}

enum RefreshOutcome {
    Refreshed,
    Adopted,
}

pub struct UsageClient {
    locator: CredentialLocator,
    refresh_transport: RefreshTransport,
    usage_transport: UsageTransport,
    stale_after: chrono::Duration,
    locks_dir: PathBuf,
    events: Arc<EventLog>,
}

impl UsageClient {
    pub fn new(
        locator: CredentialLocator,
        refresh_transport: RefreshTransport,
        usage_transport: UsageTransport,
        stale_after: chrono::Duration,
        locks_dir: PathBuf,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            locator,
            refresh_transport,
            usage_transport,
            stale_after,
            locks_dir,
            events,
        }
    }

    /// Loads credentials (preferring `preferred`), refreshes them when stale
    /// or rejected, and fetches the usage document. Retries the usage request
    /// at most once.
    pub fn fetch_usage(&self, preferred: Option<&Path>) -> CxResult<UsageSnapshot> {
        let mut loaded = self.locator.load(preferred).ok_or_else(|| {
            CxError::NotLoggedIn("no Codex credentials found; run `codex login`".to_string())
        })?;
        if loaded.credentials.access_token.is_none() && loaded.credentials.api_key.is_some() {
            return Err(CxError::ApiKeyUnsupported);
        }

        let trace_id = next_trace_id();
        let needs_refresh = loaded.credentials.access_token.is_none()
            || loaded.credentials.is_stale(Utc::now(), self.stale_after);
        if needs_refresh && loaded.credentials.refresh_token.is_some() {
            tracing::debug!(trace_id = %trace_id, "refreshing stale credentials before usage request");
            self.refresh_or_continue(&mut loaded, &trace_id)?;
        }

        let mut reply = self.request_usage(&loaded)?;
        if reply.is_auth_failure() {
            tracing::info!(status = reply.status, "usage request rejected; refreshing once");
            self.refresh_or_continue(&mut loaded, &trace_id)?;
            reply = self.request_usage(&loaded)?;
            if reply.is_auth_failure() {
                return Err(CxError::TokenExpired(format!(
                    "usage endpoint rejected the token ({}) after refresh",
                    reply.status
                )));
            }
        }

        if !reply.is_success() {
            return Err(CxError::ProviderFetchFailed(format!(
                "usage request failed ({}): {}",
                reply.status,
                truncate_chars(&reply.body, 200)
            )));
        }
        let body = if reply.body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str::<Value>(&reply.body).map_err(|err| {
                CxError::ProviderFetchFailed(format!("usage response is not JSON: {err}"))
            })?
        };
        Ok(UsageSnapshot::from_http(&reply.headers, &body, Utc::now()))
    }

    fn request_usage(&self, loaded: &LoadedCredentials) -> CxResult<HttpReply> {
        let access_token = loaded.credentials.access_token.as_deref().ok_or_else(|| {
            CxError::NotLoggedIn("credentials have no access token; run `codex login`".to_string())
        })?;
        (self.usage_transport)(access_token, loaded.credentials.account_id.as_deref()).map_err(
            |err| match err {
                TransportError::Timeout => CxError::Timeout("usage request".to_string()),
                TransportError::Other(message) => {
                    CxError::ProviderFetchFailed(format!("usage request failed: {message}"))
                }
            },
        )
    }

    fn refresh_or_continue(&self, loaded: &mut LoadedCredentials, trace_id: &str) -> CxResult<()> {
        match self.refresh(loaded, trace_id) {
            Ok(()) => Ok(()),
            Err(RefreshFailure::Terminal(err)) => Err(err),
            Err(RefreshFailure::Unavailable(reason)) => {
                tracing::warn!(reason = %reason, "token refresh unavailable; continuing with current token");
                Ok(())
            }
        }
    }

    pub fn refresh(&self, loaded: &mut LoadedCredentials, trace_id: &str) -> Result<(), RefreshFailure> {
        let Some(refresh_token) = loaded.credentials.refresh_token.clone() else {
            return Err(RefreshFailure::Unavailable("no refresh token stored".to_string()));
        };
        let source_label = source_label(&loaded.source);
        self.events.write(
            "token_refresh_start",
            &[
                ("trace_id", Some(trace_id.to_string())),
                ("source", Some(source_label.clone())),
                ("refresh_token_fp", token_fingerprint(Some(refresh_token.as_str()))),
            ],
        );

        let result = self.with_refresh_lock(&source_label, || {
            if let Some(on_disk) = reread_rotated(&loaded.source, &refresh_token) {
                loaded.credentials = on_disk;
                return Ok(RefreshOutcome::Adopted);
            }

            let reply = (self.refresh_transport)(&refresh_token)
                .map_err(|err| RefreshFailure::Unavailable(format!("refresh request failed: {err}")))?;
            let tokens = interpret_refresh_reply(&reply)?;
            loaded.credentials.apply_refresh(&tokens, Utc::now());
            self.locator.persist(loaded).map_err(RefreshFailure::Terminal)?;
            Ok(RefreshOutcome::Refreshed)
        });

        let (label, error) = match &result {
            Ok(RefreshOutcome::Refreshed) => ("refreshed", None),
            Ok(RefreshOutcome::Adopted) => ("adopted", None),
            Err(RefreshFailure::Terminal(err)) => ("terminal", Some(err.to_string())),
            Err(RefreshFailure::Unavailable(reason)) => ("unavailable", Some(reason.clone())),
        };
        self.events.write(
            "token_refresh_result",
            &[
                ("trace_id", Some(trace_id.to_string())),
                ("source", Some(source_label)),
                ("result", Some(label.to_string())),
                ("error", error),
                (
                    "refresh_token_fp",
                    token_fingerprint(loaded.credentials.refresh_token.as_deref()),
                ),
            ],
        );
        result.map(|_| ())
    }

    /// Serializes refreshes of one credential store across processes.
    fn with_refresh_lock<T>(
        &self,
        key: &str,
        operation: impl FnOnce() -> Result<T, RefreshFailure>,
    ) -> Result<T, RefreshFailure> {
        fs::create_dir_all(&self.locks_dir).map_err(|err| {
            RefreshFailure::Unavailable(format!(
                "failed to create lock dir {}: {}",
                self.locks_dir.display(),
                err
            ))
        })?;
        let lock_path = self
            .locks_dir
            .join(format!("refresh-{}.lock", short_hash_hex(key.as_bytes())));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|err| {
                RefreshFailure::Unavailable(format!(
                    "failed to open lock file {}: {}",
                    lock_path.display(),
                    err
                ))
            })?;
        let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
        file.lock_exclusive().map_err(|err| {
            RefreshFailure::Unavailable(format!(
                "failed to acquire lock {}: {}",
                lock_path.display(),
                err
            ))
        })?;

        let result = operation();
        let _ = file.unlock();
        result
    }
}

fn source_label(source: &CredentialSource) -> String {
    match source {
        CredentialSource::File(path) => path.display().to_string(),
        CredentialSource::Keychain => "keychain".to_string(),
    }
}

/// Another process may have rotated the refresh token while we waited for
/// the lock. Returns the on-disk credentials when that happened.
fn reread_rotated(
    source: &CredentialSource,
    loaded_refresh_token: &str,
) -> Option<CodexCredentials> {
    let CredentialSource::File(path) = source else {
        return None;
    };
    let data = fs_store::read_optional(path).ok()??;
    let on_disk = parse_codex_credentials(&data)?;
    let rotated = on_disk.access_token.is_some()
        && on_disk
            .refresh_token
            .as_deref()
            .is_some_and(|token| token != loaded_refresh_token);
    rotated.then_some(on_disk)
}

pub fn interpret_refresh_reply(reply: &HttpReply) -> Result<RefreshedTokens, RefreshFailure> {
    let root = serde_json::from_str::<Value>(&reply.body).unwrap_or(Value::Null);
    if reply.is_success() {
        let access_token = value_as_string(root.get("access_token")).ok_or_else(|| {
            RefreshFailure::Unavailable("refresh response missing access_token".to_string())
        })?;
        return Ok(RefreshedTokens {
            access_token,
            refresh_token: value_as_string(root.get("refresh_token")),
            id_token: value_as_string(root.get("id_token")),
        });
    }

    if reply.status == 400 || reply.status == 401 {
        let code = value_as_string(root.get("error"))
            .or_else(|| get_path_string(&root, &["error", "code"]))
            .or_else(|| value_as_string(root.get("error_code")));
        let terminal = match code.as_deref() {
            Some("refresh_token_expired") => Some(CxError::SessionExpired),
            Some("refresh_token_reused") => Some(CxError::TokenConflict),
            Some("refresh_token_invalidated") => Some(CxError::TokenRevoked),
            Some(code @ ("invalid_grant" | "token_expired")) => {
                Some(CxError::TokenExpired(format!("refresh rejected ({code})")))
            }
            _ => None,
        };
        if let Some(err) = terminal {
            return Err(RefreshFailure::Terminal(err));
        }
    }

    Err(RefreshFailure::Unavailable(format!(
        "refresh failed ({}): {}",
        reply.status,
        truncate_chars(&reply.body, 200)
    )))
}

fn build_http_client(timeout: Duration) -> Result<reqwest::blocking::Client, TransportError> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| TransportError::Other(format!("failed to build HTTP client: {err}")))
}

fn send(request: reqwest::blocking::RequestBuilder) -> Result<HttpReply, TransportError> {
    let response = request.send().map_err(classify_reqwest_error)?;
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.text().map_err(classify_reqwest_error)?;
    Ok(HttpReply {
        status,
        headers,
        body,
    })
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Other(err.to_string())
    }
}

fn user_agent() -> String {
    format!("cxauth/{}", env!("CARGO_PKG_VERSION"))
}

pub fn http_refresh_transport(
    token_endpoint: String,
    client_id: String,
    timeout: Duration,
) -> RefreshTransport {
    Arc::new(move |refresh_token: &str| {
        let client = build_http_client(timeout)?;
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", client_id.as_str()),
            ("refresh_token", refresh_token),
            ("scope", REFRESH_SCOPE),
        ];
        send(
            client
                .post(&token_endpoint)
                .header("Accept", "application/json")
                .header("User-Agent", user_agent())
                .form(&form),
        )
    })
}

pub fn http_usage_transport(usage_endpoint: String, timeout: Duration) -> UsageTransport {
    Arc::new(move |access_token: &str, account_id: Option<&str>| {
        let client = build_http_client(timeout)?;
        let mut request = client
            .get(&usage_endpoint)
            .header("Accept", "application/json")
            .header("User-Agent", user_agent())
            .bearer_auth(access_token);
        if let Some(account_id) = account_id {
            request = request.header("ChatGPT-Account-Id", account_id);
        }
        send(request)
    })
}

fn truncate_chars(raw: &str, max_chars: usize) -> String {
    raw.chars().take(max_chars).collect()
}
