mod accounts;
mod app;
mod auth_swap;
mod config;
mod credentials;
mod error;
mod event_log;
mod fs_store;
mod limits;
mod limits_cache;
mod lock;
mod rpc_client;
mod runner;
mod usage;
mod usage_client;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::accounts::AccountName;
use crate::app::CxAuthApp;
use crate::config::Settings;
use crate::error::CxResult;
use crate::limits::ProviderPreference;

#[derive(Debug, Parser)]
#[command(
    name = "cxauth",
    version,
    about = "Keep several Codex CLI logins on one machine",
    long_about = "\
Keep several Codex CLI logins on one machine and run codex as any of them.\n\
\n\
Each account's auth.json lives under ~/.cxauth/accounts/<name>. `run` swaps it \
into $CODEX_HOME/auth.json for the duration of one codex invocation, then \
copies any refreshed token back. Everything else in $CODEX_HOME is shared."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run codex as ACCOUNT; arguments after `--` are passed to codex
    Run {
        account: AccountName,
        /// Take over the swap lock even if its holder is still running
        #[arg(long)]
        force: bool,
        /// Put the previously active login back when codex exits
        #[arg(long)]
        restore: bool,
        #[arg(last = true, value_name = "CODEX_ARGS")]
        args: Vec<String>,
    },

    /// Save the currently active codex login into ACCOUNT
    Import {
        account: AccountName,
        #[arg(long)]
        force: bool,
    },

    /// Make ACCOUNT's saved login the active codex login
    Apply {
        account: AccountName,
        #[arg(long)]
        force: bool,
    },

    /// Show usage limits for the given accounts (all when omitted)
    Limits {
        accounts: Vec<AccountName>,
        #[arg(long, value_enum)]
        provider: Option<ProviderPreference>,
        /// Ignore cached results (fresh results are still cached)
        #[arg(long)]
        no_cache: bool,
        /// Maximum age of a cached result
        #[arg(long, value_name = "SECS")]
        ttl: Option<u64>,
        #[arg(long)]
        json: bool,
    },

    /// Create an empty account
    Add { account: AccountName },

    /// List accounts; `*` marks the one whose login is active
    #[command(alias = "ls")]
    List,

    /// Remove an account and its saved login
    Remove {
        account: AccountName,
        #[arg(long)]
        delete_data: bool,
    },
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("cxauth: {err}");
            std::process::exit(err.exit_code());
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CXAUTH_LOG").unwrap_or_else(|_| EnvFilter::new("cxauth=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run() -> CxResult<i32> {
    let cli = Cli::parse();
    let app = CxAuthApp::new(Settings::load()?);

    match cli.command {
        Commands::Run {
            account,
            force,
            restore,
            args,
        } => app.run(&account, force, restore, args),
        Commands::Import { account, force } => app.import(&account, force).map(|_| 0),
        Commands::Apply { account, force } => app.apply(&account, force).map(|_| 0),
        Commands::Limits {
            accounts,
            provider,
            no_cache,
            ttl,
            json,
        } => app.limits(accounts, provider, no_cache, ttl, json),
        Commands::Add { account } => app.add(&account).map(|_| 0),
        Commands::List => app.list().map(|_| 0),
        Commands::Remove {
            account,
            delete_data,
        } => app.remove(&account, delete_data).map(|_| 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_passes_everything_after_double_dash_to_codex() {
        let cli = Cli::try_parse_from(["cxauth", "run", "work", "--restore", "--", "--model", "o3", "exec"])
            .expect("parse");
        match cli.command {
            Commands::Run {
                account,
                force,
                restore,
                args,
            } => {
                assert_eq!(account.as_str(), "work");
                assert!(!force);
                assert!(restore);
                assert_eq!(args, vec!["--model", "o3", "exec"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn limits_accepts_accounts_and_provider() {
        let cli = Cli::try_parse_from([
            "cxauth", "limits", "work", "home", "--provider", "rpc", "--no-cache", "--ttl", "60",
        ])
        .expect("parse");
        match cli.command {
            Commands::Limits {
                accounts,
                provider,
                no_cache,
                ttl,
                json,
            } => {
                assert_eq!(accounts.len(), 2);
                assert_eq!(provider, Some(ProviderPreference::Rpc));
                assert!(no_cache);
                assert_eq!(ttl, Some(60));
                assert!(!json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn invalid_account_names_are_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["cxauth", "add", "../escape"]).is_err());
        assert!(Cli::try_parse_from(["cxauth", "remove", "work"]).is_ok());
    }
}
