use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command as ProcessCommand, ExitStatus};

use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{CxError, CxResult};

const SHIELDED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// One invocation of the wrapped tool.
#[derive(Debug, Clone)]
pub struct WrappedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub codex_home: PathBuf,
}

extern "C" fn swallow_signal(_: libc::c_int) {}

/// Keeps terminal signals from killing this process while the child runs, so
/// snapshot capture, restore and lock release still happen. The child gets
/// default dispositions back on exec.
struct SignalShield {
    previous: Vec<(Signal, SigAction)>,
}

impl SignalShield {
    fn install() -> Self {
        let action = SigAction::new(
            SigHandler::Handler(swallow_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let mut previous = Vec::new();
        for sig in SHIELDED_SIGNALS {
            // SAFETY: the handler is an empty extern "C" fn and touches no state.
            match unsafe { signal::sigaction(sig, &action) } {
                Ok(old) => previous.push((sig, old)),
                Err(err) => tracing::warn!(signal = %sig, error = %err, "failed to shield signal"),
            }
        }
        Self { previous }
    }
}

impl Drop for SignalShield {
    fn drop(&mut self) {
        for (sig, old) in self.previous.drain(..).rev() {
            // SAFETY: restores the disposition that was in place before install().
            if let Err(err) = unsafe { signal::sigaction(sig, &old) } {
                tracing::warn!(signal = %sig, error = %err, "failed to restore signal handler");
            }
        }
    }
}

/// Runs the wrapped tool with inherited stdio and returns its exit code.
/// A child killed by a signal reports `128 + signo`.
pub fn run_wrapped(command: &WrappedCommand) -> CxResult<i32> {
    let _shield = SignalShield::install();
    tracing::debug!(program = %command.program, args = ?command.args, "starting wrapped tool");
    let status = ProcessCommand::new(&command.program)
        .args(&command.args)
        .env("CODEX_HOME", &command.codex_home)
        .status()
        .map_err(|source| CxError::Spawn {
            program: command.program.clone(),
            source,
        })?;
    Ok(exit_code(status))
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sh(temp: &TempDir, script: &str, extra: &[&str]) -> WrappedCommand {
        let mut args = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
        args.extend(extra.iter().map(|arg| arg.to_string()));
        WrappedCommand {
            program: "/bin/sh".to_string(),
            args,
            codex_home: temp.path().to_path_buf(),
        }
    }

    #[test]
    fn returns_child_exit_code() {
        let temp = TempDir::new().expect("temp dir");
        assert_eq!(run_wrapped(&sh(&temp, "exit 7", &[])).expect("run"), 7);
        assert_eq!(run_wrapped(&sh(&temp, "kill -9 $$", &[])).expect("run"), 137);
    }

    #[test]
    fn passes_arguments_and_codex_home_through() {
        let temp = TempDir::new().expect("temp dir");
        let command = sh(
            &temp,
            r#"printf '%s|%s|%s' "$CODEX_HOME" "$1" "$2" > "$CODEX_HOME/out""#,
            &["--model", "o3 mini"],
        );
        assert_eq!(run_wrapped(&command).expect("run"), 0);
        let out = fs::read_to_string(temp.path().join("out")).expect("out");
        assert_eq!(out, format!("{}|--model|o3 mini", temp.path().display()));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let temp = TempDir::new().expect("temp dir");
        let command = WrappedCommand {
            program: temp.path().join("missing-codex").display().to_string(),
            args: Vec::new(),
            codex_home: temp.path().to_path_buf(),
        };
        assert!(matches!(run_wrapped(&command), Err(CxError::Spawn { .. })));
    }
}
