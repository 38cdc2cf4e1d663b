use std::collections::HashMap;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command as ProcessCommand, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::error::{CxError, CxResult};
use crate::usage::UsageSnapshot;

const RATE_LIMITS_METHOD: &str = "account/rateLimits/read";
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub program: String,
    pub args: Vec<String>,
    pub codex_home: PathBuf,
    pub message_timeout: Duration,
}

/// One decoded line from the subprocess.
#[derive(Debug, PartialEq)]
enum Inbound {
    Response {
        id: u64,
        outcome: Result<Value, String>,
    },
    Notification {
        method: String,
    },
}

impl Inbound {
    fn parse(line: &str) -> Option<Self> {
        let value = serde_json::from_str::<Value>(line).ok()?;
        if let Some(method) = value.get("method").and_then(Value::as_str) {
            return Some(Self::Notification {
                method: method.to_string(),
            });
        }
        let id = value.get("id").and_then(Value::as_u64)?;
        let outcome = match value.get("error").filter(|error| !error.is_null()) {
            Some(error) => Err(error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string())),
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };
        Some(Self::Response { id, outcome })
    }
}

enum ReaderEvent {
    Line(String),
    Closed,
}

/// Kills and reaps the subprocess on every exit path.
struct ChildGuard {
    child: Child,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct RpcSession {
    guard: ChildGuard,
    stdin: ChildStdin,
    inbound: Receiver<ReaderEvent>,
    next_id: u64,
    pending: HashMap<u64, &'static str>,
    message_timeout: Duration,
}

impl RpcSession {
    fn spawn(config: &RpcClientConfig) -> CxResult<Self> {
        let mut child = ProcessCommand::new(&config.program)
            .args(&config.args)
            .env("CODEX_HOME", &config.codex_home)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    CxError::ProviderUnavailable(format!("{} not found", config.program))
                } else {
                    CxError::ProviderUnavailable(format!("failed to start {}: {}", config.program, err))
                }
            })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CxError::ProviderUnavailable(
                    "subprocess pipes unavailable".to_string(),
                ));
            }
        };

        let (sender, inbound) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if sender.send(ReaderEvent::Line(line)).is_err() {
                    return;
                }
            }
            let _ = sender.send(ReaderEvent::Closed);
        });

        Ok(Self {
            guard: ChildGuard { child },
            stdin,
            inbound,
            next_id: 1,
            pending: HashMap::new(),
            message_timeout: config.message_timeout,
        })
    }

    fn send_line(&mut self, message: &Value) -> CxResult<()> {
        let line = format!("{message}\n");
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.flush())
            .map_err(|err| CxError::ProviderUnavailable(format!("failed to write to subprocess: {err}")))
    }

    fn notify(&mut self, method: &str) -> CxResult<()> {
        self.send_line(&json!({ "method": method }))
    }

    fn request(&mut self, method: &'static str, params: Option<Value>) -> CxResult<Value> {
        let id = self.next_id;
        self.next_id += 1;
        let mut message = json!({ "id": id, "method": method });
        if let Some(params) = params {
            message["params"] = params;
        }
        self.pending.insert(id, method);
        self.send_line(&message)?;
        self.await_response(id, method)
    }

    fn await_response(&mut self, awaited: u64, method: &str) -> CxResult<Value> {
        let deadline = Instant::now() + self.message_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = match self.inbound.recv_timeout(remaining) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(CxError::Timeout(format!("waiting for {method} response")));
                }
                Err(RecvTimeoutError::Disconnected) => ReaderEvent::Closed,
            };

            let line = match event {
                ReaderEvent::Line(line) => line,
                ReaderEvent::Closed => return Err(self.exited_error(method, deadline)),
            };
            match Inbound::parse(&line) {
                Some(Inbound::Response { id, outcome }) if id == awaited => {
                    self.pending.remove(&id);
                    return outcome.map_err(|message| {
                        CxError::ProviderFetchFailed(format!("{method} failed: {message}"))
                    });
                }
                Some(Inbound::Response { id, .. }) => {
                    let pending = self.pending.remove(&id).unwrap_or("unknown");
                    tracing::debug!(id, awaited, pending, "discarding response for another request");
                }
                Some(Inbound::Notification { method: notification }) => {
                    tracing::trace!(method = %notification, "ignoring notification");
                }
                None => tracing::debug!("ignoring non-JSON-RPC line from subprocess"),
            }
        }
    }

    /// Stdout is gone. Waits for the exit status until `deadline`; a process
    /// still running then is reported without its status and killed by the guard.
    fn exited_error(&mut self, method: &str, deadline: Instant) -> CxError {
        loop {
            match self.guard.child.try_wait() {
                Ok(Some(status)) => {
                    return CxError::ProviderUnavailable(format!(
                        "subprocess exited ({status}) before answering {method}"
                    ));
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
                Ok(None) => {
                    return CxError::ProviderUnavailable(format!(
                        "subprocess closed its output before answering {method}"
                    ));
                }
                Err(err) => {
                    return CxError::ProviderUnavailable(format!(
                        "subprocess lost before answering {method}: {err}"
                    ));
                }
            }
        }
    }
}

/// Spawns the wrapped tool's app server and asks it for the active
/// account's rate limits. The subprocess is always torn down.
pub fn fetch_rate_limits(config: &RpcClientConfig) -> CxResult<UsageSnapshot> {
    let mut session = RpcSession::spawn(config)?;
    session.request(
        "initialize",
        Some(json!({
            "clientInfo": {"name": "cxauth", "version": env!("CARGO_PKG_VERSION")}
        })),
    )?;
    session.notify("initialized")?;
    let result = session.request(RATE_LIMITS_METHOD, None)?;
    UsageSnapshot::from_rpc_result(&result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn script_config(temp: &TempDir, body: &str, timeout: Duration) -> RpcClientConfig {
        let script = temp.path().join("server.sh");
        fs::write(&script, body).expect("write script");
        RpcClientConfig {
            program: "/bin/sh".to_string(),
            args: vec![script.display().to_string()],
            codex_home: temp.path().to_path_buf(),
            message_timeout: timeout,
        }
    }

    #[test]
    fn inbound_messages_are_classified() {
        assert_eq!(
            Inbound::parse(r#"{"method":"codex/event","params":{}}"#),
            Some(Inbound::Notification {
                method: "codex/event".to_string()
            })
        );
        assert_eq!(
            Inbound::parse(r#"{"id":2,"error":{"code":-32600,"message":"nope"}}"#),
            Some(Inbound::Response {
                id: 2,
                outcome: Err("nope".to_string())
            })
        );
        assert_eq!(Inbound::parse("plain log line"), None);
    }

    #[test]
    fn reads_rate_limits_past_noise_and_foreign_responses() {
        let temp = TempDir::new().expect("temp dir");
        let config = script_config(
            &temp,
            r#"read line
printf '%s' "$CODEX_HOME" > "$CODEX_HOME/seen-home"
echo 'starting app server'
echo '{"method":"codex/event","params":{}}'
echo '{"id":1,"result":{"userAgent":"codex"}}'
read line
read line
echo '{"id":99,"result":{}}'
echo '{"id":2,"result":{"rateLimits":{"primary":{"usedPercent":40,"windowDurationMins":300,"resetsAt":1900000000}}}}'
"#,
            Duration::from_secs(5),
        );

        let snapshot = fetch_rate_limits(&config).expect("rate limits");
        assert_eq!(snapshot.primary.and_then(|w| w.used_percent), Some(40.0));
        let seen = fs::read_to_string(temp.path().join("seen-home")).expect("env marker");
        assert_eq!(seen, temp.path().display().to_string());
    }

    #[test]
    fn silent_subprocess_times_out() {
        let temp = TempDir::new().expect("temp dir");
        let config = script_config(&temp, "exec sleep 5\n", Duration::from_millis(200));
        let started = Instant::now();
        let err = fetch_rate_limits(&config).expect_err("timeout");
        assert!(matches!(err, CxError::Timeout(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn early_exit_is_provider_unavailable() {
        let temp = TempDir::new().expect("temp dir");
        let config = script_config(&temp, "read line\nexit 3\n", Duration::from_secs(5));
        let err = fetch_rate_limits(&config).expect_err("exit");
        assert!(matches!(err, CxError::ProviderUnavailable(_)), "{err}");
    }

    #[test]
    fn closed_stdout_on_a_live_process_is_bounded_by_the_message_timeout() {
        let temp = TempDir::new().expect("temp dir");
        let config = script_config(
            &temp,
            "read line\nexec 1>&-\nsleep 6\n",
            Duration::from_millis(500),
        );
        let started = Instant::now();
        let err = fetch_rate_limits(&config).expect_err("closed output");
        assert!(matches!(err, CxError::ProviderUnavailable(_)), "{err}");
        assert!(err.to_string().contains("closed its output"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn rpc_error_field_fails_the_fetch() {
        let temp = TempDir::new().expect("temp dir");
        let config = script_config(
            &temp,
            r#"read line
echo '{"id":1,"result":{}}'
read line
read line
echo '{"id":2,"error":{"code":-32603,"message":"not logged in"}}'
"#,
            Duration::from_secs(5),
        );
        let err = fetch_rate_limits(&config).expect_err("rpc error");
        assert!(err.to_string().contains("not logged in"), "{err}");
    }

    #[test]
    fn missing_binary_is_provider_unavailable() {
        let temp = TempDir::new().expect("temp dir");
        let config = RpcClientConfig {
            program: temp.path().join("no-such-codex").display().to_string(),
            args: Vec::new(),
            codex_home: temp.path().to_path_buf(),
            message_timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            fetch_rate_limits(&config),
            Err(CxError::ProviderUnavailable(_))
        ));
    }
}
