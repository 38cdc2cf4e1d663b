use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::sync::Arc;

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::config::AUTH_FILE_NAME;
use crate::error::{CxError, CxResult};
use crate::fs_store;

const OPENAI_AUTH_CLAIM: &str = "https://api.openai.com/auth";

pub type ProcessRunner = Arc<dyn Fn(&str, &[String]) -> ProcessExecutionResult + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ProcessExecutionResult {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

pub fn default_process_runner(executable: &str, arguments: &[String]) -> ProcessExecutionResult {
    match ProcessCommand::new(executable).args(arguments).output() {
        Ok(output) => ProcessExecutionResult {
            status: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
        Err(err) => ProcessExecutionResult {
            status: 1,
            stdout: String::new(),
            stderr: err.to_string(),
        },
    }
}

/// Parsed view of a Codex `auth.json` payload. `root` keeps every field,
/// including ones this tool does not understand, so rewrites are lossless.
#[derive(Debug, Clone)]
pub struct CodexCredentials {
    pub root: Value,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub account_id: Option<String>,
    pub api_key: Option<String>,
    pub last_refresh: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
}

pub fn parse_codex_credentials(data: &[u8]) -> Option<CodexCredentials> {
    let root = serde_json::from_slice::<Value>(data).ok()?;
    if !root.is_object() {
        return None;
    }
    Some(CodexCredentials::from_root(root))
}

impl CodexCredentials {
    fn from_root(root: Value) -> Self {
        let access_token = get_path_string(&root, &["tokens", "access_token"]);
        let refresh_token = get_path_string(&root, &["tokens", "refresh_token"]);
        let id_token = get_path_string(&root, &["tokens", "id_token"]);
        let account_id = get_path_string(&root, &["tokens", "account_id"]).or_else(|| {
            id_token
                .as_deref()
                .and_then(decode_jwt_claims)
                .and_then(|claims| get_path_string(&claims, &[OPENAI_AUTH_CLAIM, "chatgpt_account_id"]))
        });
        let api_key = value_as_string(root.get("OPENAI_API_KEY"));
        let last_refresh = root
            .get("last_refresh")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|date| date.with_timezone(&Utc));

        Self {
            root,
            access_token,
            refresh_token,
            id_token,
            account_id,
            api_key,
            last_refresh,
        }
    }

    /// Has something a client could authenticate with.
    pub fn is_usable(&self) -> bool {
        self.access_token.is_some() || self.refresh_token.is_some() || self.api_key.is_some()
    }

    pub fn email(&self) -> Option<String> {
        let claims = decode_jwt_claims(self.id_token.as_deref()?)?;
        value_as_string(claims.get("email"))
    }

    pub fn plan(&self) -> Option<String> {
        let claims = decode_jwt_claims(self.id_token.as_deref()?)?;
        get_path_string(&claims, &[OPENAI_AUTH_CLAIM, "chatgpt_plan_type"])
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        match self.last_refresh {
            Some(last_refresh) => now - last_refresh > stale_after,
            None => true,
        }
    }

    pub fn apply_refresh(&mut self, tokens: &RefreshedTokens, now: DateTime<Utc>) {
        if !self.root.is_object() {
            self.root = Value::Object(Map::new());
        }
        if let Some(root) = self.root.as_object_mut() {
            let entry = root
                .entry("tokens".to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Some(object) = entry.as_object_mut() {
                object.insert(
                    "access_token".to_string(),
                    Value::String(tokens.access_token.clone()),
                );
                if let Some(refresh_token) = &tokens.refresh_token {
                    object.insert(
                        "refresh_token".to_string(),
                        Value::String(refresh_token.clone()),
                    );
                }
                if let Some(id_token) = &tokens.id_token {
                    object.insert("id_token".to_string(), Value::String(id_token.clone()));
                }
            }
            root.insert(
                "last_refresh".to_string(),
                Value::String(now.to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
        }
        *self = Self::from_root(std::mem::take(&mut self.root));
    }

    pub fn to_bytes(&self) -> CxResult<Vec<u8>> {
        serde_json::to_vec_pretty(&self.root)
            .map_err(|err| CxError::ProviderFetchFailed(format!("failed to encode credentials: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    File(PathBuf),
    Keychain,
}

#[derive(Debug, Clone)]
pub struct LoadedCredentials {
    pub source: CredentialSource,
    pub credentials: CodexCredentials,
}

pub struct Keychain {
    service_name: String,
    security_executable: String,
    process_runner: ProcessRunner,
}

impl Keychain {
    pub fn new(service_name: String, security_executable: String, process_runner: ProcessRunner) -> Self {
        Self {
            service_name,
            security_executable,
            process_runner,
        }
    }

    pub fn read(&self) -> Option<String> {
        let args = vec![
            "find-generic-password".to_string(),
            "-s".to_string(),
            self.service_name.clone(),
            "-w".to_string(),
        ];
        let result = (self.process_runner)(&self.security_executable, &args);
        if result.status != 0 {
            return None;
        }
        let trimmed = result.stdout.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn write(&self, data: &[u8]) -> CxResult<()> {
        let raw = std::str::from_utf8(data)
            .map_err(|_| CxError::ProviderFetchFailed("credentials are not valid UTF-8 JSON".to_string()))?;
        let account_name = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
        let args = vec![
            "add-generic-password".to_string(),
            "-a".to_string(),
            account_name,
            "-s".to_string(),
            self.service_name.clone(),
            "-w".to_string(),
            raw.to_string(),
            "-U".to_string(),
        ];
        let result = (self.process_runner)(&self.security_executable, &args);
        if result.status != 0 {
            return Err(CxError::ProviderFetchFailed(format!(
                "failed to update keychain: {}",
                result.stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Finds the credential payload a usage fetch should use.
pub struct CredentialLocator {
    active_path: PathBuf,
    env_codex_home: Option<PathBuf>,
    home_dir: PathBuf,
    keychain: Option<Keychain>,
}

impl CredentialLocator {
    pub fn new(
        active_path: PathBuf,
        env_codex_home: Option<PathBuf>,
        home_dir: PathBuf,
        keychain: Option<Keychain>,
    ) -> Self {
        Self {
            active_path,
            env_codex_home,
            home_dir,
            keychain,
        }
    }

    /// Preferred path, active file, `$CODEX_HOME`, then the default homes.
    /// Duplicates are dropped, first position wins.
    pub fn candidate_paths(&self, preferred: Option<&Path>) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        let mut push = |path: PathBuf| {
            if !paths.contains(&path) {
                paths.push(path);
            }
        };
        if let Some(preferred) = preferred {
            push(preferred.to_path_buf());
        }
        push(self.active_path.clone());
        if let Some(codex_home) = &self.env_codex_home {
            push(codex_home.join(AUTH_FILE_NAME));
        }
        push(self.home_dir.join(".codex").join(AUTH_FILE_NAME));
        push(self.home_dir.join(".config/codex").join(AUTH_FILE_NAME));
        paths
    }

    pub fn load(&self, preferred: Option<&Path>) -> Option<LoadedCredentials> {
        for path in self.candidate_paths(preferred) {
            let data = match fs_store::read_optional(&path) {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable credential candidate");
                    continue;
                }
            };
            match parse_codex_credentials(&data) {
                Some(credentials) if credentials.is_usable() => {
                    tracing::debug!(path = %path.display(), "loaded credentials");
                    return Some(LoadedCredentials {
                        source: CredentialSource::File(path),
                        credentials,
                    });
                }
                _ => tracing::debug!(path = %path.display(), "credential candidate has no usable token"),
            }
        }

        let raw = self.keychain.as_ref()?.read()?;
        let credentials = parse_codex_credentials(raw.as_bytes()).filter(CodexCredentials::is_usable)?;
        tracing::debug!("loaded credentials from keychain");
        Some(LoadedCredentials {
            source: CredentialSource::Keychain,
            credentials,
        })
    }

    /// Writes refreshed credentials back to where they came from. Keychain
    /// updates are best-effort.
    pub fn persist(&self, loaded: &LoadedCredentials) -> CxResult<()> {
        let data = loaded.credentials.to_bytes()?;
        match &loaded.source {
            CredentialSource::File(path) => fs_store::write_atomic(path, &data),
            CredentialSource::Keychain => {
                if let Some(keychain) = &self.keychain {
                    if let Err(err) = keychain.write(&data) {
                        tracing::warn!(error = %err, "refreshed token not saved to keychain");
                    }
                }
                Ok(())
            }
        }
    }
}

/// Decodes the claims segment of a JWT without verifying its signature.
pub fn decode_jwt_claims(token: &str) -> Option<Value> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| URL_SAFE.decode(payload))
        .ok()?;
    let claims = serde_json::from_slice::<Value>(&bytes).ok()?;
    claims.is_object().then_some(claims)
}

pub fn get_path_value<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = current.get(*segment)?;
    }
    Some(current)
}

pub fn get_path_string(root: &Value, path: &[&str]) -> Option<String> {
    value_as_string(get_path_value(root, path))
}

pub fn value_as_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(raw)) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        _ => None,
    }
}
