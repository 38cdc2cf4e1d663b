use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CxError, CxResult};
use crate::fs_store;
use crate::limits::ProviderPreference;

pub const CODEX_OAUTH_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
pub const CODEX_TOKEN_ENDPOINT: &str = "https://auth.openai.com/oauth/token";
pub const CODEX_USAGE_ENDPOINT: &str = "https://chatgpt.com/backend-api/wham/usage";
pub const CODEX_KEYCHAIN_SERVICE_NAME: &str = "Codex Auth";
pub const AUTH_FILE_NAME: &str = "auth.json";

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
const DEFAULT_RPC_MESSAGE_TIMEOUT_SECS: u64 = 15;
const DEFAULT_LIMITS_TTL_SECS: u64 = 300;
const DEFAULT_STALE_AFTER_DAYS: i64 = 8;

/// Resolved configuration: built-in defaults, then `<root>/config.json`,
/// then environment overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    pub home_dir: PathBuf,
    pub root_dir: PathBuf,
    pub codex_home: PathBuf,
    /// `$CODEX_HOME` exactly as set, consulted by the credential candidate chain.
    pub env_codex_home: Option<PathBuf>,
    pub codex_bin: String,
    pub codex_rpc_args: Vec<String>,
    pub token_endpoint: String,
    pub usage_endpoint: String,
    pub oauth_client_id: String,
    pub refresh_timeout: Duration,
    pub usage_timeout: Duration,
    pub rpc_message_timeout: Duration,
    pub stale_after: chrono::Duration,
    pub limits_ttl: Duration,
    pub limits_provider: ProviderPreference,
    pub keychain_enabled: bool,
    pub keychain_service_name: String,
    pub security_executable: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    codex_home: Option<PathBuf>,
    codex_bin: Option<String>,
    codex_rpc_args: Option<Vec<String>>,
    #[serde(default)]
    limits: LimitsSection,
    #[serde(default)]
    timeouts: TimeoutsSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LimitsSection {
    ttl_seconds: Option<u64>,
    provider: Option<ProviderPreference>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeoutsSection {
    refresh_seconds: Option<u64>,
    usage_seconds: Option<u64>,
    rpc_message_seconds: Option<u64>,
}

impl Settings {
    pub fn load() -> CxResult<Self> {
        Self::load_with(default_home_dir(), |key| std::env::var(key).ok())
    }

    /// `env` is injected so tests never touch the real process environment.
    pub fn load_with(home_dir: PathBuf, env: impl Fn(&str) -> Option<String>) -> CxResult<Self> {
        let env = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        let root_dir = env("CXAUTH_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir.join(".cxauth"));
        let mut settings = Self::defaults(home_dir, root_dir);

        let file = read_config_file(&settings.config_path())?;
        if let Some(codex_home) = file.codex_home {
            settings.codex_home = codex_home;
        }
        if let Some(codex_bin) = file.codex_bin {
            settings.codex_bin = codex_bin;
        }
        if let Some(args) = file.codex_rpc_args {
            settings.codex_rpc_args = args;
        }
        if let Some(ttl) = file.limits.ttl_seconds {
            settings.limits_ttl = Duration::from_secs(ttl);
        }
        if let Some(provider) = file.limits.provider {
            settings.limits_provider = provider;
        }
        if let Some(secs) = file.timeouts.refresh_seconds {
            settings.refresh_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.timeouts.usage_seconds {
            settings.usage_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.timeouts.rpc_message_seconds {
            settings.rpc_message_timeout = Duration::from_secs(secs);
        }

        if let Some(codex_home) = env("CODEX_HOME") {
            settings.codex_home = PathBuf::from(&codex_home);
            settings.env_codex_home = Some(PathBuf::from(codex_home));
        }
        if let Some(codex_bin) = env("CXAUTH_CODEX_BIN") {
            settings.codex_bin = codex_bin;
        }
        if let Some(url) = env("CXAUTH_TOKEN_URL") {
            settings.token_endpoint = url;
        }
        if let Some(url) = env("CXAUTH_USAGE_URL") {
            settings.usage_endpoint = url;
        }
        if let Some(security) = env("CXAUTH_SECURITY_BIN") {
            settings.security_executable = security;
        }

        Ok(settings)
    }

    fn defaults(home_dir: PathBuf, root_dir: PathBuf) -> Self {
        let codex_home = home_dir.join(".codex");
        Self {
            home_dir,
            root_dir,
            codex_home,
            env_codex_home: None,
            codex_bin: "codex".to_string(),
            codex_rpc_args: ["-s", "read-only", "-a", "untrusted", "app-server"]
                .iter()
                .map(|arg| arg.to_string())
                .collect(),
            token_endpoint: CODEX_TOKEN_ENDPOINT.to_string(),
            usage_endpoint: CODEX_USAGE_ENDPOINT.to_string(),
            oauth_client_id: CODEX_OAUTH_CLIENT_ID.to_string(),
            refresh_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            usage_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            rpc_message_timeout: Duration::from_secs(DEFAULT_RPC_MESSAGE_TIMEOUT_SECS),
            stale_after: chrono::Duration::days(DEFAULT_STALE_AFTER_DAYS),
            limits_ttl: Duration::from_secs(DEFAULT_LIMITS_TTL_SECS),
            limits_provider: ProviderPreference::Auto,
            keychain_enabled: cfg!(target_os = "macos"),
            keychain_service_name: CODEX_KEYCHAIN_SERVICE_NAME.to_string(),
            security_executable: "/usr/bin/security".to_string(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.root_dir.join("config.json")
    }

    pub fn accounts_dir(&self) -> PathBuf {
        self.root_dir.join("accounts")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root_dir.join("locks")
    }

    pub fn swap_lock_dir(&self) -> PathBuf {
        self.locks_dir().join("active-auth.lock")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root_dir.join("logs")
    }

    pub fn limits_cache_path(&self) -> PathBuf {
        self.root_dir.join("limits-cache.json")
    }

    /// The wrapped tool's single Active Credential File.
    pub fn active_auth_path(&self) -> PathBuf {
        self.codex_home.join(AUTH_FILE_NAME)
    }
}

fn read_config_file(path: &Path) -> CxResult<ConfigFile> {
    let Some(data) = fs_store::read_optional(path)? else {
        return Ok(ConfigFile::default());
    };
    serde_json::from_slice(&data)
        .map_err(|err| CxError::Config(format!("{}: {}", path.display(), err)))
}

pub fn default_home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_live_under_home() {
        let temp = TempDir::new().expect("temp dir");
        let home = temp.path().to_path_buf();
        let settings = Settings::load_with(home.clone(), env_from(&[])).expect("settings");

        assert_eq!(settings.root_dir, home.join(".cxauth"));
        assert_eq!(settings.active_auth_path(), home.join(".codex/auth.json"));
        assert_eq!(
            settings.swap_lock_dir(),
            home.join(".cxauth/locks/active-auth.lock")
        );
        assert_eq!(settings.limits_provider, ProviderPreference::Auto);
        assert_eq!(settings.limits_ttl, Duration::from_secs(300));
    }

    #[test]
    fn config_file_then_env_override_in_order() {
        let temp = TempDir::new().expect("temp dir");
        let home = temp.path().to_path_buf();
        let root = home.join("state");
        fs::create_dir_all(&root).expect("root");
        fs::write(
            root.join("config.json"),
            r#"{"codexBin":"/opt/codex","limits":{"ttlSeconds":60,"provider":"rpc"},
                "timeouts":{"rpcMessageSeconds":3}}"#,
        )
        .expect("write config");

        let settings = Settings::load_with(
            home.clone(),
            env_from(&[
                ("CXAUTH_HOME", root.to_str().expect("utf8")),
                ("CXAUTH_CODEX_BIN", "/usr/local/bin/codex"),
                ("CODEX_HOME", "   "),
            ]),
        )
        .expect("settings");

        assert_eq!(settings.codex_bin, "/usr/local/bin/codex");
        assert_eq!(settings.limits_ttl, Duration::from_secs(60));
        assert_eq!(settings.limits_provider, ProviderPreference::Rpc);
        assert_eq!(settings.rpc_message_timeout, Duration::from_secs(3));
        assert_eq!(settings.codex_home, home.join(".codex"));
        assert!(settings.env_codex_home.is_none());
    }

    #[test]
    fn malformed_config_file_is_an_error() {
        let temp = TempDir::new().expect("temp dir");
        let home = temp.path().to_path_buf();
        fs::create_dir_all(home.join(".cxauth")).expect("root");
        fs::write(home.join(".cxauth/config.json"), "{not json").expect("write");

        let err = Settings::load_with(home, env_from(&[])).expect_err("should fail");
        assert!(matches!(err, CxError::Config(_)));
    }
}
