use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;

pub type CxResult<T> = Result<T, CxError>;

#[derive(Debug, Error)]
pub enum CxError {
    #[error(
        "auth swap in progress for account '{account}' (pid {pid}, since {started_at}); \
         wait for it to finish or pass --force"
    )]
    Locked {
        account: String,
        pid: u32,
        started_at: String,
    },

    #[error("not logged in: {0}")]
    NotLoggedIn(String),

    #[error("credential only carries an API key; the usage endpoint needs a ChatGPT login")]
    ApiKeyUnsupported,

    #[error("token expired: {0}; log in again")]
    TokenExpired(String),

    #[error("session expired; log in again")]
    SessionExpired,

    #[error("refresh token was already used by another client; log in again")]
    TokenConflict,

    #[error("refresh token was revoked; log in again")]
    TokenRevoked,

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("usage fetch failed: {0}")]
    ProviderFetchFailed(String),

    #[error("invalid account name '{0}': use letters, digits, '_' or '-' (max 64)")]
    InvalidAccountName(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account already exists: {0}")]
    AccountExists(String),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Usage(String),
}

impl CxError {
    pub fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn locked(account: &str, pid: u32, started_at: Option<DateTime<Utc>>) -> Self {
        Self::Locked {
            account: account.to_string(),
            pid,
            started_at: started_at
                .map(|value| value.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    /// True for failures that only an interactive `codex login` can fix.
    pub fn needs_login(&self) -> bool {
        matches!(
            self,
            Self::NotLoggedIn(_)
                | Self::TokenExpired(_)
                | Self::SessionExpired
                | Self::TokenConflict
                | Self::TokenRevoked
        )
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) | Self::InvalidAccountName(_) => 2,
            Self::Locked { .. } => 3,
            _ if self.needs_login() => 4,
            Self::ApiKeyUnsupported
            | Self::ProviderUnavailable(_)
            | Self::Timeout(_)
            | Self::ProviderFetchFailed(_) => 5,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_message_names_owner_and_override() {
        let err = CxError::locked("work", 4242, None);
        let text = err.to_string();
        assert!(text.contains("'work'"));
        assert!(text.contains("pid 4242"));
        assert!(text.contains("--force"));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn terminal_auth_errors_need_login() {
        for err in [
            CxError::SessionExpired,
            CxError::TokenConflict,
            CxError::TokenRevoked,
            CxError::TokenExpired("usage rejected".to_string()),
            CxError::NotLoggedIn("no auth.json".to_string()),
        ] {
            assert!(err.needs_login(), "{err}");
            assert_eq!(err.exit_code(), 4);
        }
        assert!(!CxError::Timeout("usage".to_string()).needs_login());
    }
}
