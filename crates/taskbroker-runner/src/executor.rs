//! Task execution.
//!
//! [`Executor`] is the seam between the broker connection and whatever
//! actually runs task code. [`NodeExecutor`] runs each task in a fresh
//! Node.js process: the code is checked against the module guard before the
//! process starts, and the `require` handed to the task code enforces the
//! same lists for specifiers the static scan cannot see. A module refused
//! at runtime fails the task even if the code catches the error.

use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskbroker_core::{ModuleGuard, TaskError, TaskId, TaskOutcome, TaskPayload};

use crate::imports::scan_imports;

/// Errors that can occur while running the sandbox itself.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to spawn interpreter: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Sandbox protocol error: {0}")]
    Protocol(String),
}

/// One task handed to an executor.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub payload: TaskPayload,
    /// Effective guard for this task (per-task allow-list already applied).
    pub guard: ModuleGuard,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The code ran to completion or failed on its own.
    Finished(TaskOutcome),
    /// Stopped because the cancellation token fired.
    Cancelled,
}

/// Runs task code.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute a task until it finishes or `cancel` fires.
    async fn execute(
        &self,
        request: TaskRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError>;
}

/// Reject code that statically imports a module the guard does not allow.
///
/// A dynamic `import()` with a computed specifier bypasses the sandbox's
/// guarded `require`, so it is refused whenever the guard restricts anything.
pub fn check_imports(code: &str, guard: &ModuleGuard) -> Result<(), TaskError> {
    let scan = scan_imports(code);
    for module in &scan.modules {
        guard.check(module)?;
    }
    if guard.is_restrictive() {
        if let Some(argument) = scan.computed_imports.into_iter().next() {
            return Err(TaskError::DisallowedModule { module: argument });
        }
    }
    Ok(())
}

/// Marks the line carrying the sandbox's reply on stdout.
const RESULT_MARKER: &str = "__TASKBROKER_RESULT__";

/// Wrapper evaluated by `node -e`. Reads `{code, input, allow, deny}` from
/// stdin, runs `code` as the body of an async function of `items`, and
/// prints one marked JSON reply.
const SANDBOX_JS: &str = r#"
'use strict';
const MARKER = '__TASKBROKER_RESULT__';
const reply = (message) => process.stdout.write('\n' + MARKER + JSON.stringify(message) + '\n');
const packageRoot = (name) => {
  const bare = name.startsWith('node:') ? name.slice(5) : name;
  const parts = bare.split('/');
  return bare.startsWith('@') && parts.length > 1 ? parts[0] + '/' + parts[1] : parts[0];
};
const listed = (list, name) =>
  list.some((entry) => entry === '*' || packageRoot(entry) === packageRoot(name));
const chunks = [];
process.stdin.on('data', (chunk) => chunks.push(chunk));
process.stdin.on('end', async () => {
  const { code, input, allow, deny } = JSON.parse(Buffer.concat(chunks).toString('utf8'));
  const permitted = (name) => !listed(deny, name) && (allow.length === 0 || listed(allow, name));
  const baseRequire = require;
  let violation = null;
  const guardedRequire = (request) => {
    const name = String(request);
    if (!permitted(name)) {
      violation = violation || name;
      const error = new Error("Module '" + name + "' is disallowed");
      error.disallowedModule = name;
      throw error;
    }
    return baseRequire(name);
  };
  Reflect.set(globalThis, 'require', guardedRequire);
  Reflect.set(globalThis, 'module', undefined);
  try {
    const AsyncFunction = Object.getPrototypeOf(async function () {}).constructor;
    const run = new AsyncFunction('items', 'require', code);
    const result = await run(input, guardedRequire);
    if (violation) {
      reply({ status: 'disallowed', module: violation });
    } else {
      reply({ status: 'ok', result: result === undefined ? null : result });
    }
  } catch (error) {
    if (violation || (error && error.disallowedModule)) {
      reply({ status: 'disallowed', module: violation || error.disallowedModule });
    } else {
      reply({
        status: 'error',
        message: String(error && error.message ? error.message : error),
        stack: error && error.stack ? String(error.stack) : undefined,
      });
    }
  }
});
"#;

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum SandboxReply {
    Ok {
        #[serde(default)]
        result: Value,
    },
    Disallowed {
        module: String,
    },
    Error {
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
}

/// Executes JavaScript tasks in a child Node.js process.
#[derive(Debug, Clone)]
pub struct NodeExecutor {
    /// Path to the node binary.
    node_path: String,
}

impl NodeExecutor {
    pub fn new(node_path: impl Into<String>) -> Self {
        Self {
            node_path: node_path.into(),
        }
    }
}

#[async_trait]
impl Executor for NodeExecutor {
    async fn execute(
        &self,
        request: TaskRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let TaskRequest {
            task_id,
            payload,
            guard,
        } = request;

        if let Err(error) = check_imports(&payload.code, &guard) {
            info!(task_id = %task_id, error = %error, "Task code imports a disallowed module");
            return Ok(ExecutionOutcome::Finished(Err(error)));
        }

        let sandbox_input = json!({
            "code": payload.code,
            "input": payload.input,
            "allow": guard.allow_list(),
            "deny": guard.deny_list(),
        });
        let stdin_bytes = serde_json::to_vec(&sandbox_input)
            .map_err(|e| ExecutorError::Protocol(e.to_string()))?;

        let mut cmd = Command::new(&self.node_path);
        cmd.arg("-e")
            .arg(SANDBOX_JS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(task_id = %task_id, node = %self.node_path, "Spawning sandbox process");
        let mut child = cmd.spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutorError::Protocol("Failed to get stdin".to_string()))?;
        stdin.write_all(&stdin_bytes).await?;
        drop(stdin);

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                info!(task_id = %task_id, "Execution cancelled, sandbox killed");
                return Ok(ExecutionOutcome::Cancelled);
            }
            output = child.wait_with_output() => output?,
        };

        let outcome = parse_output(&output.stdout, &output.stderr, output.status);
        debug!(task_id = %task_id, ok = outcome.is_ok(), "Sandbox finished");
        Ok(ExecutionOutcome::Finished(outcome))
    }
}

/// Turn the sandbox's output into a task outcome.
fn parse_output(stdout: &[u8], stderr: &[u8], status: ExitStatus) -> TaskOutcome {
    let stdout = String::from_utf8_lossy(stdout);
    let reply = stdout
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(RESULT_MARKER));

    match reply.map(serde_json::from_str::<SandboxReply>) {
        Some(Ok(SandboxReply::Ok { result })) => Ok(result),
        Some(Ok(SandboxReply::Disallowed { module })) => Err(TaskError::DisallowedModule { module }),
        Some(Ok(SandboxReply::Error { message, stack })) => {
            Err(TaskError::Execution { message, stack })
        }
        Some(Err(e)) => {
            warn!(error = %e, "Unreadable sandbox reply");
            Err(TaskError::execution(format!("unreadable sandbox reply: {e}")))
        }
        None => {
            let stderr = String::from_utf8_lossy(stderr);
            let detail = stderr.trim();
            Err(TaskError::execution(if detail.is_empty() {
                format!("sandbox exited with {status} without a result")
            } else {
                format!("sandbox exited with {status}: {detail}")
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn exit(code: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }

    fn request(code: &str, guard: ModuleGuard) -> TaskRequest {
        TaskRequest {
            task_id: TaskId::new("t1"),
            payload: TaskPayload::new(code),
            guard,
        }
    }

    #[test]
    fn test_check_imports() {
        let guard = ModuleGuard::from_csv("lodash", "child_process");
        assert!(check_imports("const _ = require('lodash/fp');", &guard).is_ok());
        assert_eq!(
            check_imports("require('lodash'); require('axios');", &guard),
            Err(TaskError::DisallowedModule {
                module: "axios".to_string()
            })
        );
        assert_eq!(
            check_imports("import cp from 'node:child_process';", &ModuleGuard::default()),
            Ok(())
        );
        assert!(check_imports(
            "import cp from 'node:child_process';",
            &ModuleGuard::from_csv("", "child_process")
        )
        .is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_output_replies() {
        let stdout = b"log line\n\n__TASKBROKER_RESULT__{\"status\":\"ok\",\"result\":[1,2]}\n";
        assert_eq!(
            parse_output(stdout, b"", exit(0)),
            Ok(serde_json::json!([1, 2]))
        );

        let stdout = b"\n__TASKBROKER_RESULT__{\"status\":\"disallowed\",\"module\":\"fs\"}\n";
        assert_eq!(
            parse_output(stdout, b"", exit(0)),
            Err(TaskError::DisallowedModule {
                module: "fs".to_string()
            })
        );

        let stdout = b"\n__TASKBROKER_RESULT__{\"status\":\"error\",\"message\":\"boom\"}\n";
        assert_eq!(
            parse_output(stdout, b"", exit(0)),
            Err(TaskError::Execution {
                message: "boom".to_string(),
                stack: None
            })
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_output_without_reply_uses_stderr() {
        let outcome = parse_output(b"", b"SyntaxError: Unexpected token\n", exit(1));
        let Err(TaskError::Execution { message, .. }) = outcome else {
            panic!("expected execution error");
        };
        assert!(message.contains("SyntaxError"));
    }

    #[tokio::test]
    async fn test_disallowed_import_fails_before_spawning() {
        // The interpreter path does not exist; the guard must reject first.
        let executor = NodeExecutor::new("/nonexistent/node");
        let outcome = executor
            .execute(
                request("const fs = require('fs');", ModuleGuard::from_csv("", "fs")),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Finished(Err(TaskError::DisallowedModule {
                module: "fs".to_string()
            }))
        );
    }

    #[test]
    fn test_computed_import_refused_only_under_restrictive_guard() {
        let code = "const name = 'f' + 's'; const m = await import(name); return 1;";
        assert_eq!(
            check_imports(code, &ModuleGuard::from_csv("", "child_process")),
            Err(TaskError::DisallowedModule {
                module: "name".to_string()
            })
        );
        assert_eq!(check_imports(code, &ModuleGuard::default()), Ok(()));
    }

    #[tokio::test]
    async fn test_computed_import_fails_before_spawning() {
        let executor = NodeExecutor::new("/nonexistent/node");
        let outcome = executor
            .execute(
                request(
                    "const name = 'f' + 's'; return Object.keys(await import(name));",
                    ModuleGuard::from_csv("", "fs"),
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Finished(Err(TaskError::DisallowedModule {
                module: "name".to_string()
            }))
        );
    }

    fn node_available() -> bool {
        std::process::Command::new("node")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_computed_require_is_refused_at_runtime() {
        if !node_available() {
            eprintln!("node not found, skipping");
            return;
        }
        let executor = NodeExecutor::new("node");
        let outcome = executor
            .execute(
                request(
                    "const name = 'f' + 's'; const fs = require(name); return typeof fs.readdirSync;",
                    ModuleGuard::from_csv("", "fs"),
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Finished(Err(TaskError::DisallowedModule {
                module: "fs".to_string()
            }))
        );
    }

    #[tokio::test]
    async fn test_caught_runtime_refusal_still_fails_task() {
        if !node_available() {
            eprintln!("node not found, skipping");
            return;
        }
        let executor = NodeExecutor::new("node");
        let code = "const name = 'child_' + 'process';
            try { require(name); } catch (e) { return 'swallowed'; }
            return 'unreachable';";
        let outcome = executor
            .execute(
                request(code, ModuleGuard::from_csv("", "child_process")),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Finished(Err(TaskError::DisallowedModule {
                module: "child_process".to_string()
            }))
        );
    }

    #[tokio::test]
    async fn test_computed_require_of_permitted_module_runs() {
        if !node_available() {
            eprintln!("node not found, skipping");
            return;
        }
        let executor = NodeExecutor::new("node");
        let outcome = executor
            .execute(
                request(
                    "const name = 'p' + 'ath'; return require(name).basename('/a/b.txt');",
                    ModuleGuard::from_csv("", "fs"),
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Finished(Ok(serde_json::json!("b.txt"))));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_error() {
        let executor = NodeExecutor::new("/nonexistent/node");
        let err = executor
            .execute(request("return 1;", ModuleGuard::default()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn(_)));
    }
}
