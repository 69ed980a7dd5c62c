use crate::oracle::{
    OracleError, Optimization, PathCondition, ReplayOracle, ReplayRequest, Solution, Solver,
    SymbolicBounds, Trace,
};
use crate::trie::CostStrategy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One request to the backend process, written as a single JSON document
/// on its stdin. The backend answers with one JSON document on stdout.
#[derive(Serialize, Debug)]
#[serde(rename_all = "kebab-case", tag = "mode")]
enum BackendRequest<'a> {
    /// Answer: a [`Trace`].
    Concrete { input: &'a Path },
    /// Answer: a [`Trace`].
    Replay {
        #[serde(flatten)]
        request: &'a ReplayRequest,
        #[serde(skip_serializing_if = "SymbolicBounds::is_unbounded")]
        bounds: SymbolicBounds,
    },
    /// Answer: an [`Optimization`].
    Optimize {
        input: &'a Path,
        strategy: CostStrategy,
        #[serde(skip_serializing_if = "SymbolicBounds::is_unbounded")]
        bounds: SymbolicBounds,
    },
    /// Answer: a [`SolveResponse`].
    Solve { path_condition: &'a PathCondition },
}

#[derive(Deserialize, Debug)]
struct SolveResponse {
    /// `null` when the path condition is unsatisfiable.
    solution: Option<Solution>,
}

#[derive(Debug, Clone)]
pub struct CommandBackendConfig {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
    pub strategy: CostStrategy,
    /// Sent along with every guided and optimizing run.
    pub bounds: SymbolicBounds,
}

/// Replay oracle and solver backed by an external process, started once per
/// request.
///
/// Every call is a fresh process, which keeps runs independent of each other:
/// nothing the backend observed in one run can leak into the next.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    config: CommandBackendConfig,
}

struct RunOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandBackend {
    pub fn new(config: CommandBackendConfig) -> Result<Self, OracleError> {
        if config.command.is_empty() {
            return Err(OracleError::Config("backend command is empty".into()));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &CommandBackendConfig {
        &self.config
    }

    fn request<T: DeserializeOwned>(&self, request: &BackendRequest<'_>) -> Result<T, OracleError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| OracleError::Protocol(format!("failed to encode request: {e}")))?;
        let output = self.run(&payload)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let desc = match output.status.code() {
                Some(code) => format!("backend exited with code {code}"),
                None => "backend was terminated by a signal".to_string(),
            };
            return Err(OracleError::Config(format!("{desc}: {}", stderr.trim())));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| {
            OracleError::Protocol(format!(
                "malformed backend response ({e}): {}",
                String::from_utf8_lossy(&output.stdout).trim()
            ))
        })
    }

    fn run(&self, payload: &[u8]) -> Result<RunOutput, OracleError> {
        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(&self.config.command[1..]);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            OracleError::Config(format!(
                "failed to spawn backend {:?}: {e}",
                self.config.command
            ))
        })?;

        // Drained on their own threads so a chatty backend never blocks on a
        // full pipe while we poll for its exit.
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(payload) {
                log::debug!("backend closed stdin early: {e}");
            }
        }

        let status = run_and_wait_with_timeout(&mut child, self.config.timeout)?;
        let stdout = join_reader(stdout);
        let stderr = join_reader(stderr);
        if !stderr.is_empty() {
            log::debug!("backend stderr: {}", String::from_utf8_lossy(&stderr).trim());
        }
        Ok(RunOutput {
            status,
            stdout,
            stderr,
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn run_and_wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<ExitStatus, OracleError> {
    let start_time = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if start_time.elapsed() > timeout {
                    log::warn!("backend timed out after {timeout:?}, killing it");
                    if let Err(e) = child.kill() {
                        return Err(OracleError::Config(format!(
                            "failed to kill timed-out backend: {e}"
                        )));
                    }
                    let _ = child.wait();
                    return Err(OracleError::Timeout(timeout));
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                return Err(OracleError::Config(format!(
                    "error waiting for backend: {e}"
                )));
            }
        }
    }
}

impl ReplayOracle for CommandBackend {
    fn run_concrete(&mut self, input: &Path) -> Result<Trace, OracleError> {
        if !input.is_file() {
            return Err(OracleError::Input(format!("{input:?} is not a readable file")));
        }
        self.request(&BackendRequest::Concrete { input })
    }

    fn replay(&mut self, request: &ReplayRequest) -> Result<Trace, OracleError> {
        self.request(&BackendRequest::Replay {
            request,
            bounds: self.config.bounds,
        })
    }

    fn optimize(&mut self, input: &Path) -> Result<Optimization, OracleError> {
        if !input.is_file() {
            return Err(OracleError::Input(format!("{input:?} is not a readable file")));
        }
        self.request(&BackendRequest::Optimize {
            input,
            strategy: self.config.strategy,
            bounds: self.config.bounds,
        })
    }
}

impl Solver for CommandBackend {
    fn solve(&mut self, condition: &PathCondition) -> Result<Option<Solution>, OracleError> {
        let response: SolveResponse = self.request(&BackendRequest::Solve {
            path_condition: condition,
        })?;
        Ok(response.solution)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::oracle::{Decision, TraceEnd};
    use tempfile::tempdir;

    fn backend(script: &str, timeout: Duration) -> CommandBackend {
        CommandBackend::new(CommandBackendConfig {
            command: vec!["sh".into(), "-c".into(), script.into()],
            timeout,
            working_dir: None,
            strategy: CostStrategy::Maximize,
            bounds: SymbolicBounds::default(),
        })
        .unwrap()
    }

    #[test]
    fn request_json_is_tagged_by_mode() {
        let replay = ReplayRequest {
            prior_choices: vec![1, 0],
            forced_choice: 2,
            input_size: 16,
        };
        let json = serde_json::to_value(BackendRequest::Replay {
            request: &replay,
            bounds: SymbolicBounds::default(),
        })
        .unwrap();
        assert_eq!(json["mode"], "replay");
        assert_eq!(json["prior_choices"], serde_json::json!([1, 0]));
        assert_eq!(json["forced_choice"], 2);
        assert!(json.get("bounds").is_none());

        let bounds = SymbolicBounds {
            min_int: Some(-5),
            max_int: Some(5),
            ..SymbolicBounds::default()
        };
        let json = serde_json::to_value(BackendRequest::Replay {
            request: &replay,
            bounds,
        })
        .unwrap();
        assert_eq!(json["bounds"], serde_json::json!({"min-int": -5, "max-int": 5}));
        assert_eq!(json["input_size"], 16);

        let pc = PathCondition::new(vec!["sym_0 > 1".into()]);
        let json = serde_json::to_value(BackendRequest::Solve { path_condition: &pc }).unwrap();
        assert_eq!(json["mode"], "solve");
        assert_eq!(json["path_condition"], serde_json::json!(["sym_0 > 1"]));
    }

    #[test]
    fn concrete_run_parses_trace() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("a");
        std::fs::write(&input, [0]).unwrap();
        let mut backend = backend(
            r#"cat > /dev/null; echo '{"decisions":[{"choice":0,"branch_count":2}],"end":{"kind":"terminated","cost":3.0}}'"#,
            Duration::from_secs(5),
        );
        let trace = backend.run_concrete(&input).unwrap();
        assert_eq!(trace.decisions, vec![Decision::new(0, 2)]);
        assert_eq!(trace.end, TraceEnd::Terminated { cost: Some(3.0) });
    }

    #[test]
    fn backend_receives_the_request_on_stdin() {
        let mut backend = backend(
            r#"grep -q '"mode":"solve"' && echo '{"solution":{"sym_0":4}}' || echo '{"solution":null}'"#,
            Duration::from_secs(5),
        );
        let solution = backend
            .solve(&PathCondition::new(vec!["sym_0 > 3".into()]))
            .unwrap()
            .unwrap();
        assert_eq!(solution.get("sym_0"), Some(4));
    }

    #[test]
    fn unsatisfiable_answer_is_none() {
        let mut backend = backend(
            r#"cat > /dev/null; echo '{"solution":null}'"#,
            Duration::from_secs(5),
        );
        assert_eq!(backend.solve(&PathCondition::default()).unwrap(), None);
    }

    #[test]
    fn slow_backend_times_out() {
        let mut backend = backend("sleep 5", Duration::from_millis(100));
        let start = Instant::now();
        let err = backend.solve(&PathCondition::default()).unwrap_err();
        assert_eq!(err, OracleError::Timeout(Duration::from_millis(100)));
        assert!(!err.is_fatal());
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn garbage_output_is_a_protocol_error() {
        let mut backend = backend("cat > /dev/null; echo hello", Duration::from_secs(5));
        let err = backend.solve(&PathCondition::default()).unwrap_err();
        assert!(matches!(err, OracleError::Protocol(_)), "{err:?}");
    }

    #[test]
    fn failing_backend_is_a_configuration_error() {
        let mut backend = backend(
            "cat > /dev/null; echo 'ClassNotFoundException' >&2; exit 3",
            Duration::from_secs(5),
        );
        let err = backend.solve(&PathCondition::default()).unwrap_err();
        match err {
            OracleError::Config(msg) => {
                assert!(msg.contains("code 3"), "{msg}");
                assert!(msg.contains("ClassNotFoundException"), "{msg}");
            }
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    #[test]
    fn missing_binary_is_a_configuration_error() {
        let mut backend = CommandBackend::new(CommandBackendConfig {
            command: vec!["/nonexistent/trellis-backend".into()],
            timeout: Duration::from_secs(1),
            working_dir: None,
            strategy: CostStrategy::Minimize,
            bounds: SymbolicBounds::default(),
        })
        .unwrap();
        let err = backend.solve(&PathCondition::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn empty_command_is_rejected() {
        let result = CommandBackend::new(CommandBackendConfig {
            command: Vec::new(),
            timeout: Duration::from_secs(1),
            working_dir: None,
            strategy: CostStrategy::Maximize,
            bounds: SymbolicBounds::default(),
        });
        assert!(matches!(result, Err(OracleError::Config(_))));
    }

    #[test]
    fn missing_input_is_rejected_before_spawning() {
        let dir = tempdir().unwrap();
        let mut backend = backend("exit 1", Duration::from_secs(1));
        let err = backend.run_concrete(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, OracleError::Input(_)));
    }
}
